//! Hydration: validated definitions become executable agent trees.
//!
//! The hydrator resolves every name a definition mentions: tools in the
//! registry, functions and callbacks in the process-wide registries,
//! model identifiers through the platform's [`ModelProvider`], and
//! materializes the agent tree bottom-up: an agent is built once all the
//! agents it references (sub-agents, agent-tools) are built, leaves
//! first, composites on top, and finally the orchestration wrapper.
//! Anything unresolved is a [`HydrationError`]; platform boot fails
//! rather than deferring the problem to the first invocation. The same
//! applies to expression compilation: the sandbox whitelist runs here, so
//! a forbidden expression never reaches execution.
//!
//! Hydration happens once per boot. The resulting [`HydratedWorkflow`]s
//! are shared read-only for the platform's lifetime.

use crate::agentflow::agent::{
    Agent, AgentTool, CodeAgent, ExpressionAgent, ModelAgent, ToolAgent,
};
use crate::agentflow::callbacks::{self, HookPoint, ResolvedCallbacks};
use crate::agentflow::composite::{LoopAgent, ParallelAgent, SequentialAgent};
use crate::agentflow::dag::DagAgent;
use crate::agentflow::expression::{Sandbox, SandboxError};
use crate::agentflow::model::{resolve_model, GenerationConfig, ModelProvider};
use crate::agentflow::planner::Planner;
use crate::agentflow::tool_protocol::{
    ToolMetadata, ToolParameter, ToolParameterType,
};
use crate::agentflow::tool_registry::ToolRegistry;
use crate::agentflow::workflow::{
    AgentConfig, AgentKind, AuthScheme, OpenApiAuthConfig, OpenApiToolConfig, OrchestrationMode,
    PlannerChoice, WorkflowDefinition,
};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Boot-time resolution failure. The platform refuses to serve a
/// workflow that produced one of these.
#[derive(Debug)]
pub enum HydrationError {
    /// Tool name resolved against neither custom registrations nor the
    /// built-in catalog.
    UnknownTool(String),
    /// Code-agent function path not present in the function registry.
    UnknownFunction(String),
    /// Callback name not present in the callback registry.
    UnknownCallback(String),
    /// Hook-point key that is not one of the six supported points.
    UnknownHook(String),
    /// Expression rejected by the sandbox at compile time.
    Sandbox { agent: String, error: SandboxError },
    /// Model identifier could not be resolved into an invoker.
    Model { model_id: String, reason: String },
    /// OpenAPI spec file missing or unreadable.
    OpenApiSpec { path: String, reason: String },
    /// Reference structure could not be built (cyclic agent references).
    Graph(String),
    /// Two workflows under the same name.
    DuplicateWorkflow(String),
}

impl fmt::Display for HydrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HydrationError::UnknownTool(name) => write!(f, "unknown tool: {}", name),
            HydrationError::UnknownFunction(path) => write!(f, "unknown function: {}", path),
            HydrationError::UnknownCallback(name) => write!(f, "unknown callback: {}", name),
            HydrationError::UnknownHook(name) => write!(f, "unknown callback hook point: {}", name),
            HydrationError::Sandbox { agent, error } => {
                write!(f, "agent '{}': {}", agent, error)
            }
            HydrationError::Model { model_id, reason } => {
                write!(f, "cannot resolve model '{}': {}", model_id, reason)
            }
            HydrationError::OpenApiSpec { path, reason } => {
                write!(f, "cannot read OpenAPI spec '{}': {}", path, reason)
            }
            HydrationError::Graph(msg) => write!(f, "agent graph error: {}", msg),
            HydrationError::DuplicateWorkflow(name) => {
                write!(f, "duplicate workflow name: {}", name)
            }
        }
    }
}

impl Error for HydrationError {}

/// A workflow ready to run: the validated definition plus the resolved
/// root agent. Built at boot, destroyed at shutdown.
pub struct HydratedWorkflow {
    pub definition: WorkflowDefinition,
    pub root: Arc<Agent>,
}

impl fmt::Debug for HydratedWorkflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HydratedWorkflow")
            .field("definition", &self.definition)
            .field("root", &self.root.name())
            .finish()
    }
}

/// Resolved auth shape for an OpenAPI toolset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedAuth {
    None,
    Bearer { token: String },
    ApiKey { key: String, header: String },
    OAuth2 { client_id: String, client_secret: String, token_url: String },
}

/// Builds agent trees. Holds the shared tool registry and the platform's
/// model factory; both are read-only after boot.
pub struct Hydrator {
    tools: Arc<ToolRegistry>,
    models: Arc<dyn ModelProvider>,
}

impl Hydrator {
    pub fn new(tools: Arc<ToolRegistry>, models: Arc<dyn ModelProvider>) -> Self {
        Self { tools, models }
    }

    /// Hydrate every package, indexing the results by workflow name.
    pub fn hydrate_all(
        &self,
        packages: &[(WorkflowDefinition, std::path::PathBuf)],
    ) -> Result<HashMap<String, HydratedWorkflow>, HydrationError> {
        let mut out = HashMap::new();
        for (def, dir) in packages {
            let hydrated = self.hydrate(def, dir)?;
            if out.insert(def.name.clone(), hydrated).is_some() {
                return Err(HydrationError::DuplicateWorkflow(def.name.clone()));
            }
        }
        Ok(out)
    }

    /// Hydrate one validated definition. `base_dir` is the package
    /// directory, used to locate `specs/` files.
    pub fn hydrate(
        &self,
        def: &WorkflowDefinition,
        base_dir: &Path,
    ) -> Result<HydratedWorkflow, HydrationError> {
        // Orchestration modes that decorate a declared agent (react's
        // planner, llm_routed's routed tools) are applied to a working
        // copy of the configs before anything is built.
        let configs = self.orchestration_overrides(def);

        // Materialize bottom-up: every agent builds once all the agents
        // it references are built. Leaves have no references, so they all
        // materialize in the first sweep; composites follow. Validated
        // definitions always make progress; a stall is a reference cycle.
        let mut built: HashMap<String, Arc<Agent>> = HashMap::new();
        while built.len() < configs.len() {
            let mut progressed = false;
            for config in &configs {
                if built.contains_key(&config.name) {
                    continue;
                }
                if references_of(config).iter().all(|r| built.contains_key(*r)) {
                    let agent = self.build_agent(def, config, &built, base_dir)?;
                    built.insert(config.name.clone(), Arc::new(agent));
                    progressed = true;
                }
            }
            if !progressed {
                let stuck: Vec<&str> = configs
                    .iter()
                    .filter(|c| !built.contains_key(&c.name))
                    .map(|c| c.name.as_str())
                    .collect();
                return Err(HydrationError::Graph(format!(
                    "cyclic agent references among: {}",
                    stuck.join(", ")
                )));
            }
        }

        let root = self.build_root(def, &built)?;
        log::info!(
            "hydrated workflow '{}' ({} agents, {} orchestration)",
            def.name,
            built.len(),
            def.orchestration.mode.tag()
        );
        Ok(HydratedWorkflow {
            definition: def.clone(),
            root,
        })
    }

    /// Apply mode-specific decoration to agent configs.
    fn orchestration_overrides(&self, def: &WorkflowDefinition) -> Vec<AgentConfig> {
        let mut configs = def.agents.clone();
        match &def.orchestration.mode {
            OrchestrationMode::React { agent, planner } => {
                let choice = planner.or(Some(PlannerChoice::PlanReact));
                for config in configs.iter_mut().filter(|c| &c.name == agent) {
                    if let AgentKind::Model { planner, .. } = &mut config.kind {
                        *planner = choice;
                    }
                }
            }
            OrchestrationMode::LlmRouted { agents, router } => {
                for config in configs.iter_mut().filter(|c| &c.name == router) {
                    if let AgentKind::Model { agent_tools, .. } = &mut config.kind {
                        for routed in agents {
                            if routed != router && !agent_tools.contains(routed) {
                                agent_tools.push(routed.clone());
                            }
                        }
                    }
                }
            }
            _ => {}
        }
        configs
    }

    fn build_agent(
        &self,
        def: &WorkflowDefinition,
        config: &AgentConfig,
        built: &HashMap<String, Arc<Agent>>,
        base_dir: &Path,
    ) -> Result<Agent, HydrationError> {
        let resolved_callbacks = resolve_callbacks(&config.callbacks)?;
        // Validation guarantees leaves carry an output key.
        let output_key = config.output_key.clone().unwrap_or_default();

        match &config.kind {
            AgentKind::Model {
                model_id,
                instruction,
                temperature,
                max_tokens,
                top_p,
                top_k,
                tools,
                agent_tools,
                openapi_tools,
                output_schema,
                input_schema,
                planner,
            } => {
                let invoker =
                    resolve_model(self.models.as_ref(), model_id).map_err(|e| {
                        HydrationError::Model {
                            model_id: model_id.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                let bound_tools = self
                    .tools
                    .resolve(tools)
                    .map_err(|e| HydrationError::UnknownTool(e.to_string()))?;

                let mut wrapped_agents = Vec::with_capacity(agent_tools.len());
                for target in agent_tools {
                    // Build order guarantees the target exists in `built`.
                    let agent = built
                        .get(target)
                        .cloned()
                        .ok_or_else(|| {
                            HydrationError::Graph(format!("agent tool '{}' not built", target))
                        })?;
                    let target_config = def.agent(target);
                    let description = target_config
                        .map(|c| c.description.clone())
                        .filter(|d| !d.is_empty())
                        .unwrap_or_else(|| format!("Delegate the request to agent '{}'.", target));
                    wrapped_agents.push(AgentTool {
                        metadata: ToolMetadata::new(target.clone(), description).with_parameter(
                            ToolParameter::new("request", ToolParameterType::String)
                                .with_description("The request to forward")
                                .required(),
                        ),
                        agent,
                        output_key: target_config.and_then(|c| c.output_key.clone()),
                    });
                }

                let mut extra_tool_metadata = Vec::new();
                for spec in openapi_tools {
                    extra_tool_metadata.push(self.resolve_openapi_tool(base_dir, spec)?);
                }

                Ok(Agent::Model(ModelAgent {
                    name: config.name.clone(),
                    description: config.description.clone(),
                    instruction: instruction.clone(),
                    output_key,
                    invoker,
                    generation: GenerationConfig {
                        temperature: *temperature,
                        max_tokens: *max_tokens,
                        top_p: *top_p,
                        top_k: *top_k,
                    },
                    tools: bound_tools,
                    agent_tools: wrapped_agents,
                    extra_tool_metadata,
                    output_schema: output_schema.clone(),
                    input_schema: input_schema.clone(),
                    planner: Planner::from_choice(*planner),
                    callbacks: resolved_callbacks,
                }))
            }
            AgentKind::Code { function } => {
                let resolved = callbacks::lookup_function(function)
                    .ok_or_else(|| HydrationError::UnknownFunction(function.clone()))?;
                Ok(Agent::Code(CodeAgent {
                    name: config.name.clone(),
                    function_path: function.clone(),
                    function: resolved,
                    input_keys: config.input_keys.clone(),
                    output_key,
                    callbacks: resolved_callbacks,
                }))
            }
            AgentKind::Expression { expression } => {
                let sandbox =
                    Sandbox::compile(expression, &config.input_keys).map_err(|error| {
                        HydrationError::Sandbox {
                            agent: config.name.clone(),
                            error,
                        }
                    })?;
                Ok(Agent::Expression(ExpressionAgent {
                    name: config.name.clone(),
                    sandbox,
                    input_keys: config.input_keys.clone(),
                    output_key,
                    callbacks: resolved_callbacks,
                }))
            }
            AgentKind::Tool { tool, tool_config } => {
                let resolved = self
                    .tools
                    .resolve_one(tool)
                    .map_err(|_| HydrationError::UnknownTool(tool.clone()))?;
                Ok(Agent::Tool(ToolAgent {
                    name: config.name.clone(),
                    tool: resolved,
                    tool_config: tool_config.clone(),
                    output_key,
                    callbacks: resolved_callbacks,
                }))
            }
            AgentKind::Sequential { sub_agents } => Ok(Agent::Sequential(SequentialAgent {
                name: config.name.clone(),
                children: collect_children(built, sub_agents)?,
            })),
            AgentKind::Parallel { sub_agents } => Ok(Agent::Parallel(ParallelAgent {
                name: config.name.clone(),
                children: collect_children(built, sub_agents)?,
            })),
            AgentKind::Loop {
                sub_agents,
                max_iterations,
            } => Ok(Agent::Loop(LoopAgent {
                name: config.name.clone(),
                children: collect_children(built, sub_agents)?,
                max_iterations: *max_iterations,
            })),
        }
    }

    /// Wrap the built agents per the orchestration mode.
    fn build_root(
        &self,
        def: &WorkflowDefinition,
        built: &HashMap<String, Arc<Agent>>,
    ) -> Result<Arc<Agent>, HydrationError> {
        let root = match &def.orchestration.mode {
            OrchestrationMode::Sequential { agents } => Agent::Sequential(SequentialAgent {
                name: def.name.clone(),
                children: collect_children(built, agents)?,
            }),
            OrchestrationMode::Parallel { agents } => Agent::Parallel(ParallelAgent {
                name: def.name.clone(),
                children: collect_children(built, agents)?,
            }),
            OrchestrationMode::Loop {
                agents,
                max_iterations,
            } => Agent::Loop(LoopAgent {
                name: def.name.clone(),
                children: collect_children(built, agents)?,
                max_iterations: *max_iterations,
            }),
            OrchestrationMode::Dag { nodes } => {
                let mut entries = Vec::with_capacity(nodes.len());
                for node in nodes {
                    let agent = built.get(&node.agent).cloned().ok_or_else(|| {
                        HydrationError::Graph(format!("dag node '{}' not built", node.agent))
                    })?;
                    entries.push((node.agent.clone(), agent, node.depends_on.clone()));
                }
                Agent::Dag(DagAgent::new(def.name.clone(), entries).map_err(HydrationError::Graph)?)
            }
            OrchestrationMode::React { agent, .. } => {
                return built
                    .get(agent)
                    .cloned()
                    .ok_or_else(|| HydrationError::Graph(format!("react agent '{}' not built", agent)));
            }
            OrchestrationMode::LlmRouted { router, .. } => {
                return built
                    .get(router)
                    .cloned()
                    .ok_or_else(|| HydrationError::Graph(format!("router '{}' not built", router)));
            }
        };
        Ok(Arc::new(root))
    }

    /// Read an OpenAPI spec file and turn it into an opaque tool schema
    /// the model invoker can forward to the provider. An unreadable spec
    /// fails the boot.
    fn resolve_openapi_tool(
        &self,
        base_dir: &Path,
        config: &OpenApiToolConfig,
    ) -> Result<ToolMetadata, HydrationError> {
        let path = base_dir.join("specs").join(&config.spec_path);
        let text = std::fs::read_to_string(&path).map_err(|e| HydrationError::OpenApiSpec {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        // YAML is a superset of JSON, so one parse covers both spec forms.
        let doc: serde_yaml::Value =
            serde_yaml::from_str(&text).map_err(|e| HydrationError::OpenApiSpec {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        let title = doc
            .get("info")
            .and_then(|info| info.get("title"))
            .and_then(|t| t.as_str())
            .unwrap_or(&config.spec_path)
            .to_string();

        let auth = resolve_openapi_auth(&config.auth);
        let auth_note = match auth {
            ResolvedAuth::None => String::new(),
            ResolvedAuth::Bearer { .. } => " (bearer auth)".to_string(),
            ResolvedAuth::ApiKey { .. } => " (API-key auth)".to_string(),
            ResolvedAuth::OAuth2 { .. } => " (OAuth2 auth)".to_string(),
        };

        Ok(
            ToolMetadata::new(
                format!("openapi:{}", title),
                format!("Operations from the '{}' OpenAPI spec{}.", title, auth_note),
            )
            .with_parameter(
                ToolParameter::new("operation", ToolParameterType::String)
                    .with_description("Operation id to invoke")
                    .required(),
            )
            .with_parameter(
                ToolParameter::new("arguments", ToolParameterType::Object)
                    .with_description("Operation arguments"),
            ),
        )
    }
}

/// Map the declarative auth block to the downstream auth shape.
///
/// Environment lookups fail soft: a missing variable becomes an empty
/// string so the failure surfaces on use, not at boot.
pub fn resolve_openapi_auth(config: &OpenApiAuthConfig) -> ResolvedAuth {
    let env_or_empty =
        |name: &Option<String>| -> String {
            name.as_deref()
                .map(|n| std::env::var(n).unwrap_or_default())
                .unwrap_or_default()
        };

    match config.scheme {
        AuthScheme::None => ResolvedAuth::None,
        AuthScheme::Bearer => ResolvedAuth::Bearer {
            token: env_or_empty(&config.token_env),
        },
        AuthScheme::Apikey => ResolvedAuth::ApiKey {
            key: env_or_empty(&config.api_key_env),
            header: config
                .header
                .clone()
                .unwrap_or_else(|| "X-API-Key".to_string()),
        },
        AuthScheme::Oauth2 => ResolvedAuth::OAuth2 {
            client_id: env_or_empty(&config.client_id_env),
            client_secret: env_or_empty(&config.client_secret_env),
            token_url: config.token_url.clone().unwrap_or_default(),
        },
    }
}

/// Resolve an agent's declared callbacks against the callback registry.
/// Unknown hook points and unknown callback names fail loudly.
pub fn resolve_callbacks(
    declared: &HashMap<String, String>,
) -> Result<ResolvedCallbacks, HydrationError> {
    let mut hooks = Vec::with_capacity(declared.len());
    for (hook_name, callback_name) in declared {
        let hook = HookPoint::parse(hook_name)
            .ok_or_else(|| HydrationError::UnknownHook(hook_name.clone()))?;
        let callback = callbacks::lookup_callback(callback_name)
            .ok_or_else(|| HydrationError::UnknownCallback(callback_name.clone()))?;
        hooks.push((hook, callback));
    }
    Ok(ResolvedCallbacks::new(hooks))
}

/// Names an agent config references, i.e. the agents that must be built
/// before it.
fn references_of(config: &AgentConfig) -> Vec<&str> {
    let mut refs: Vec<&str> = config.sub_agents().iter().map(|s| s.as_str()).collect();
    if let AgentKind::Model { agent_tools, .. } = &config.kind {
        refs.extend(agent_tools.iter().map(|s| s.as_str()));
    }
    refs
}

fn collect_children(
    built: &HashMap<String, Arc<Agent>>,
    names: &[String],
) -> Result<Vec<Arc<Agent>>, HydrationError> {
    names
        .iter()
        .map(|name| {
            built
                .get(name)
                .cloned()
                .ok_or_else(|| HydrationError::Graph(format!("agent '{}' not built", name)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentflow::workflow::OpenApiAuthConfig;

    #[test]
    fn openapi_auth_fails_soft_on_missing_env() {
        let mut config = OpenApiAuthConfig::default();
        config.scheme = AuthScheme::Bearer;
        config.token_env = Some("AGENTFLOW_TEST_NO_SUCH_VAR".to_string());
        assert_eq!(
            resolve_openapi_auth(&config),
            ResolvedAuth::Bearer {
                token: String::new()
            }
        );
    }

    #[test]
    fn apikey_auth_defaults_header() {
        let mut config = OpenApiAuthConfig::default();
        config.scheme = AuthScheme::Apikey;
        match resolve_openapi_auth(&config) {
            ResolvedAuth::ApiKey { header, key } => {
                assert_eq!(header, "X-API-Key");
                assert_eq!(key, "");
            }
            other => panic!("unexpected auth shape: {:?}", other),
        }
    }

    #[test]
    fn unknown_hook_point_fails() {
        let mut declared = HashMap::new();
        declared.insert("on_boot".to_string(), "whatever".to_string());
        assert!(matches!(
            resolve_callbacks(&declared),
            Err(HydrationError::UnknownHook(_))
        ));
    }
}
