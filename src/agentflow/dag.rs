//! Wave-based DAG scheduling.
//!
//! Nodes execute in topological waves: every node whose dependencies are
//! satisfied launches concurrently, the whole wave is awaited, successor
//! in-degrees are decremented, and the next wave forms. Acyclicity was
//! verified at validation (Kahn) and the in-degree/adjacency tables are
//! precomputed at hydration, so the runtime loop only does bookkeeping.
//!
//! Error semantics: a node error is surfaced immediately in the sense
//! that no further waves start, but nodes already running in the same
//! wave run to completion (the wave barrier guarantees that), and their
//! state writes remain visible. The composite then emits one terminal
//! error event. An empty ready set with uncompleted nodes remaining is a
//! deadlock: impossible for a validated graph, but diagnosed with the
//! stuck node names rather than hanging.

use crate::agentflow::agent::{Agent, AgentOutcome, InvocationContext};
use crate::agentflow::event::Event;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;

/// One scheduled node with its precomputed edges.
pub struct DagNode {
    pub name: String,
    pub agent: Arc<Agent>,
    /// Indices of nodes unblocked by this node's completion.
    successors: Vec<usize>,
    /// Number of dependencies, copied into the runtime table per run.
    indegree: usize,
}

/// The DAG composite.
pub struct DagAgent {
    pub name: String,
    nodes: Vec<DagNode>,
}

impl DagAgent {
    /// Build the scheduler tables from `(name, agent, depends_on)` tuples
    /// in declared order. Dependencies must name declared entries; the
    /// validator guarantees that for workflow-sourced graphs.
    pub fn new(
        name: impl Into<String>,
        entries: Vec<(String, Arc<Agent>, Vec<String>)>,
    ) -> Result<Self, String> {
        let index: HashMap<&str, usize> = entries
            .iter()
            .enumerate()
            .map(|(i, (node_name, _, _))| (node_name.as_str(), i))
            .collect();

        let mut nodes: Vec<DagNode> = entries
            .iter()
            .map(|(node_name, agent, deps)| DagNode {
                name: node_name.clone(),
                agent: agent.clone(),
                successors: Vec::new(),
                indegree: deps.len(),
            })
            .collect();

        for (i, (_, _, deps)) in entries.iter().enumerate() {
            for dep in deps {
                match index.get(dep.as_str()) {
                    Some(&d) => nodes[d].successors.push(i),
                    None => return Err(format!("dag node dependency '{}' not declared", dep)),
                }
            }
        }

        Ok(Self {
            name: name.into(),
            nodes,
        })
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub async fn run(&self, ctx: &InvocationContext) -> AgentOutcome {
        let total = self.nodes.len();
        let mut indegree: Vec<usize> = self.nodes.iter().map(|n| n.indegree).collect();
        let mut completed = vec![false; total];
        let mut completed_count = 0usize;

        // Initial ready set: all roots, in declared order.
        let mut ready: Vec<usize> = (0..total).filter(|&i| indegree[i] == 0).collect();

        while completed_count < total {
            if ready.is_empty() {
                let stuck: Vec<&str> = (0..total)
                    .filter(|&i| !completed[i])
                    .map(|i| self.nodes[i].name.as_str())
                    .collect();
                let message = format!(
                    "dag '{}' deadlocked; nodes never became ready: {}",
                    self.name,
                    stuck.join(", ")
                );
                log::error!("{}", message);
                ctx.emit(Event::failure(&self.name, &ctx.invocation_id, message))
                    .await;
                return AgentOutcome::Error;
            }

            // Launch order within a wave is declared node order. Observable
            // only through event arrival, not a correctness property.
            let mut wave = std::mem::take(&mut ready);
            wave.sort_unstable();
            log::debug!(
                "dag '{}' wave: {:?}",
                self.name,
                wave.iter().map(|&i| &self.nodes[i].name).collect::<Vec<_>>()
            );

            let results = join_all(wave.iter().map(|&i| {
                let node = &self.nodes[i];
                async move { (i, node.agent.execute(ctx).await) }
            }))
            .await;

            let mut wave_failed: Option<usize> = None;
            for (i, outcome) in results {
                completed[i] = true;
                completed_count += 1;
                if outcome.is_error() {
                    wave_failed.get_or_insert(i);
                    continue;
                }
                for &succ in &self.nodes[i].successors {
                    indegree[succ] -= 1;
                    if indegree[succ] == 0 {
                        ready.push(succ);
                    }
                }
            }

            if let Some(failed) = wave_failed {
                let message = format!(
                    "dag '{}' aborted: node '{}' failed; no further waves started",
                    self.name, self.nodes[failed].name
                );
                log::error!("{}", message);
                ctx.emit(Event::failure(&self.name, &ctx.invocation_id, message))
                    .await;
                return AgentOutcome::Error;
            }
        }
        AgentOutcome::Success
    }
}
