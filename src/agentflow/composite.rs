//! Sequential, parallel, and loop composites.
//!
//! Composites schedule children and emit no events of their own; their
//! outcome is derived from child outcomes. All three share the session
//! state of the invocation: sequential and loop children observe the
//! writes of their predecessors, parallel children run concurrently on
//! the cooperative scheduler and must write disjoint output keys (the
//! core does not enforce disjointness; overlapping keys resolve to
//! last-writer-wins, which is observable but unsupported).

use crate::agentflow::agent::{Agent, AgentOutcome, InvocationContext};
use crate::agentflow::workflow::ErrorPolicy;
use futures_util::future::join_all;
use std::sync::Arc;

/// Runs children in declared order.
///
/// On a child error the workflow's `on_error` policy decides: `halt`
/// (default) stops before the next child, `continue` keeps going and lets
/// downstream agents fail on the missing state key themselves. Either
/// way the composite reports an error outcome to its parent.
pub struct SequentialAgent {
    pub name: String,
    pub children: Vec<Arc<Agent>>,
}

impl SequentialAgent {
    pub async fn run(&self, ctx: &InvocationContext) -> AgentOutcome {
        let mut failed = false;
        for child in &self.children {
            let outcome = child.execute(ctx).await;
            if outcome.is_error() {
                failed = true;
                match ctx.on_error {
                    ErrorPolicy::Halt => {
                        log::debug!(
                            "sequential '{}' halting after error in '{}'",
                            self.name,
                            child.name()
                        );
                        return AgentOutcome::Error;
                    }
                    ErrorPolicy::Continue => {
                        log::debug!(
                            "sequential '{}' continuing past error in '{}'",
                            self.name,
                            child.name()
                        );
                    }
                }
            }
        }
        if failed {
            AgentOutcome::Error
        } else {
            AgentOutcome::Success
        }
    }
}

/// Launches all children concurrently and collects every result before
/// returning. Structured concurrency on the scheduler loop: no OS
/// threads, no detached tasks.
pub struct ParallelAgent {
    pub name: String,
    pub children: Vec<Arc<Agent>>,
}

impl ParallelAgent {
    pub async fn run(&self, ctx: &InvocationContext) -> AgentOutcome {
        let outcomes = join_all(self.children.iter().map(|child| child.execute(ctx))).await;
        if outcomes.iter().any(|o| o.is_error()) {
            AgentOutcome::Error
        } else {
            AgentOutcome::Success
        }
    }
}

/// Repeats its children as a unit.
///
/// Iterations run serially, so state accumulated in earlier iterations is
/// visible to later ones. Termination: `max_iterations` reached, or a
/// child raised the `exit_loop` signal (checked after every child, and
/// cleared by this loop when honored). A loop whose children never mutate
/// state still runs all its iterations; there is no fixed-point
/// detection.
pub struct LoopAgent {
    pub name: String,
    pub children: Vec<Arc<Agent>>,
    pub max_iterations: usize,
}

impl LoopAgent {
    pub async fn run(&self, ctx: &InvocationContext) -> AgentOutcome {
        for iteration in 0..self.max_iterations {
            for child in &self.children {
                let outcome = child.execute(ctx).await;
                if ctx.signals.exit_requested() {
                    ctx.signals.clear_exit();
                    log::debug!(
                        "loop '{}' exiting on signal at iteration {}",
                        self.name,
                        iteration + 1
                    );
                    return AgentOutcome::Success;
                }
                if outcome.is_error() && ctx.on_error == ErrorPolicy::Halt {
                    return AgentOutcome::Error;
                }
            }
        }
        AgentOutcome::Success
    }
}
