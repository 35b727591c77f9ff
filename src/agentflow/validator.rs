//! Cross-reference validation for parsed workflow definitions.
//!
//! Serde already rejects unknown tags and missing kind-specific fields at
//! parse time; this module enforces everything the type system cannot:
//! agent-name uniqueness, presence of `output_key` on leaves, non-empty
//! `sub_agents` on composites, resolvability of every referenced name, and
//! acyclicity of DAG orchestrations (Kahn's algorithm).
//!
//! Errors are field-scoped: [`ValidationError::path`] is a dotted path such
//! as `orchestration.nodes[2].depends_on[0]` so an operator can locate the
//! offending line in `workflow.yaml` directly.

use crate::agentflow::workflow::{
    AgentConfig, AgentKind, OrchestrationMode, WorkflowDefinition,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::error::Error;
use std::fmt;

/// A definition failed shape or cross-reference checking.
///
/// Produced at load time and surfaced to the operator; a definition that
/// validated never produces this error again during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted field path locating the problem, e.g. `agents[1].output_key`.
    pub path: String,
    /// Human-readable description of what is wrong.
    pub message: String,
}

impl ValidationError {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl Error for ValidationError {}

/// Validate a parsed definition.
///
/// Returns the first problem encountered, scanning agents in declared
/// order and the orchestration block last.
pub fn validate(def: &WorkflowDefinition) -> Result<(), ValidationError> {
    if def.name.trim().is_empty() {
        return Err(ValidationError::new("name", "workflow name must be non-empty"));
    }
    if def.agents.is_empty() {
        return Err(ValidationError::new(
            "agents",
            "a workflow must declare at least one agent",
        ));
    }

    let mut names: HashSet<&str> = HashSet::new();
    for (i, agent) in def.agents.iter().enumerate() {
        if agent.name.trim().is_empty() {
            return Err(ValidationError::new(
                format!("agents[{}].name", i),
                "agent name must be non-empty",
            ));
        }
        if !names.insert(agent.name.as_str()) {
            return Err(ValidationError::new(
                format!("agents[{}].name", i),
                format!("duplicate agent name '{}'", agent.name),
            ));
        }
    }

    for (i, agent) in def.agents.iter().enumerate() {
        validate_agent(def, i, agent)?;
    }

    validate_composite_acyclicity(def)?;
    validate_orchestration(def)
}

fn validate_agent(
    def: &WorkflowDefinition,
    index: usize,
    agent: &AgentConfig,
) -> Result<(), ValidationError> {
    let base = format!("agents[{}]", index);

    if agent.is_composite() {
        let subs = agent.sub_agents();
        if subs.is_empty() {
            return Err(ValidationError::new(
                format!("{}.sub_agents", base),
                format!("{} agent '{}' requires a non-empty sub_agents list", agent.kind.tag(), agent.name),
            ));
        }
        for (j, sub) in subs.iter().enumerate() {
            if def.agent(sub).is_none() {
                return Err(ValidationError::new(
                    format!("{}.sub_agents[{}]", base, j),
                    format!("unknown agent '{}'", sub),
                ));
            }
        }
        return Ok(());
    }

    // All four leaf kinds must name the state key they write.
    if agent.output_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
        return Err(ValidationError::new(
            format!("{}.output_key", base),
            format!("{} agent '{}' requires an output_key", agent.kind.tag(), agent.name),
        ));
    }

    match &agent.kind {
        AgentKind::Model {
            model_id,
            instruction,
            agent_tools,
            ..
        } => {
            if model_id.trim().is_empty() {
                return Err(ValidationError::new(
                    format!("{}.model_id", base),
                    "model_id must be non-empty",
                ));
            }
            if instruction.trim().is_empty() {
                return Err(ValidationError::new(
                    format!("{}.instruction", base),
                    "instruction must be non-empty",
                ));
            }
            for (j, target) in agent_tools.iter().enumerate() {
                if def.agent(target).is_none() {
                    return Err(ValidationError::new(
                        format!("{}.agent_tools[{}]", base, j),
                        format!("unknown agent '{}'", target),
                    ));
                }
                if target == &agent.name {
                    return Err(ValidationError::new(
                        format!("{}.agent_tools[{}]", base, j),
                        "an agent cannot expose itself as a tool",
                    ));
                }
            }
        }
        AgentKind::Code { function } => {
            if function.trim().is_empty() {
                return Err(ValidationError::new(
                    format!("{}.function", base),
                    "code agent requires a function path",
                ));
            }
        }
        AgentKind::Expression { expression } => {
            if expression.trim().is_empty() {
                return Err(ValidationError::new(
                    format!("{}.expression", base),
                    "expression agent requires an expression",
                ));
            }
        }
        AgentKind::Tool { tool, .. } => {
            if tool.trim().is_empty() {
                return Err(ValidationError::new(
                    format!("{}.tool", base),
                    "tool agent requires a tool name",
                ));
            }
        }
        // Composites handled above.
        _ => {}
    }
    Ok(())
}

/// Composite agents may nest other composites, but never cyclically:
/// hydration builds children before parents and would otherwise never
/// terminate.
fn validate_composite_acyclicity(def: &WorkflowDefinition) -> Result<(), ValidationError> {
    // in-degree over the composite->sub_agent graph restricted to composites
    let composites: Vec<&AgentConfig> = def.agents.iter().filter(|a| a.is_composite()).collect();
    if composites.is_empty() {
        return Ok(());
    }

    let mut indegree: HashMap<&str, usize> = composites.iter().map(|a| (a.name.as_str(), 0)).collect();
    for agent in &composites {
        for sub in agent.sub_agents() {
            if let Some(d) = indegree.get_mut(sub.as_str()) {
                *d += 1;
            }
        }
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut seen = 0usize;
    while let Some(name) = queue.pop_front() {
        seen += 1;
        if let Some(agent) = def.agent(name) {
            for sub in agent.sub_agents() {
                if let Some(d) = indegree.get_mut(sub.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(sub.as_str());
                    }
                }
            }
        }
    }

    if seen < composites.len() {
        let mut stuck: Vec<&str> = indegree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(n, _)| *n)
            .collect();
        stuck.sort_unstable();
        return Err(ValidationError::new(
            "agents",
            format!("cyclic composite nesting among: {}", stuck.join(", ")),
        ));
    }
    Ok(())
}

fn validate_orchestration(def: &WorkflowDefinition) -> Result<(), ValidationError> {
    match &def.orchestration.mode {
        OrchestrationMode::Sequential { agents }
        | OrchestrationMode::Parallel { agents }
        | OrchestrationMode::Loop { agents, .. } => check_agent_list(def, agents),
        OrchestrationMode::React { agent, .. } => {
            if def.agent(agent).is_none() {
                return Err(ValidationError::new(
                    "orchestration.agent",
                    format!("unknown agent '{}'", agent),
                ));
            }
            Ok(())
        }
        OrchestrationMode::LlmRouted { agents, router } => {
            check_agent_list(def, agents)?;
            if def.agent(router).is_none() {
                return Err(ValidationError::new(
                    "orchestration.router",
                    format!("unknown agent '{}'", router),
                ));
            }
            Ok(())
        }
        OrchestrationMode::Dag { nodes } => validate_dag(def, nodes),
    }
}

fn check_agent_list(def: &WorkflowDefinition, agents: &[String]) -> Result<(), ValidationError> {
    if agents.is_empty() {
        return Err(ValidationError::new(
            "orchestration.agents",
            "orchestration requires at least one agent",
        ));
    }
    for (i, name) in agents.iter().enumerate() {
        if def.agent(name).is_none() {
            return Err(ValidationError::new(
                format!("orchestration.agents[{}]", i),
                format!("unknown agent '{}'", name),
            ));
        }
    }
    Ok(())
}

fn validate_dag(
    def: &WorkflowDefinition,
    nodes: &[crate::agentflow::workflow::DagNodeConfig],
) -> Result<(), ValidationError> {
    if nodes.is_empty() {
        return Err(ValidationError::new(
            "orchestration.nodes",
            "dag orchestration requires at least one node",
        ));
    }

    let mut declared: HashSet<&str> = HashSet::new();
    for (i, node) in nodes.iter().enumerate() {
        if def.agent(&node.agent).is_none() {
            return Err(ValidationError::new(
                format!("orchestration.nodes[{}].agent", i),
                format!("unknown agent '{}'", node.agent),
            ));
        }
        if !declared.insert(node.agent.as_str()) {
            return Err(ValidationError::new(
                format!("orchestration.nodes[{}].agent", i),
                format!("node '{}' declared more than once", node.agent),
            ));
        }
    }

    for (i, node) in nodes.iter().enumerate() {
        for (j, dep) in node.depends_on.iter().enumerate() {
            if dep == &node.agent {
                // A node depending on itself is the degenerate cycle.
                return Err(ValidationError::new(
                    format!("orchestration.nodes[{}].depends_on[{}]", i, j),
                    format!("node '{}' depends on itself (cycle)", node.agent),
                ));
            }
            if !declared.contains(dep.as_str()) {
                return Err(ValidationError::new(
                    format!("orchestration.nodes[{}].depends_on[{}]", i, j),
                    format!("dependency '{}' is not a declared node", dep),
                ));
            }
        }
    }

    // Kahn's algorithm: repeatedly remove in-degree-zero nodes. Anything
    // left over participates in a cycle.
    let mut indegree: HashMap<&str, usize> = nodes
        .iter()
        .map(|n| (n.agent.as_str(), n.depends_on.len()))
        .collect();
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
    for node in nodes {
        for dep in &node.depends_on {
            successors
                .entry(dep.as_str())
                .or_insert_with(Vec::new)
                .push(node.agent.as_str());
        }
    }

    let mut queue: VecDeque<&str> = nodes
        .iter()
        .filter(|n| n.depends_on.is_empty())
        .map(|n| n.agent.as_str())
        .collect();
    let mut completed = 0usize;
    while let Some(name) = queue.pop_front() {
        completed += 1;
        if let Some(next) = successors.get(name) {
            for &succ in next {
                if let Some(d) = indegree.get_mut(succ) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(succ);
                    }
                }
            }
        }
    }

    if completed < nodes.len() {
        let mut cyclic: Vec<&str> = indegree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(n, _)| *n)
            .collect();
        cyclic.sort_unstable();
        return Err(ValidationError::new(
            "orchestration.nodes",
            format!("cycle detected among nodes: {}", cyclic.join(", ")),
        ));
    }
    Ok(())
}
