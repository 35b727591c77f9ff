//! Workflow definition data model and package loading.
//!
//! A workflow is declared in a `workflow.yaml` file inside a *package*
//! directory. The file names the workflow, lists its agents, selects an
//! orchestration mode, and optionally opts into A2A discovery:
//!
//! ```yaml
//! name: rate-tracker
//! description: Tracks an exchange rate against a threshold.
//! runtime:
//!   session_service: in_memory
//! agents:
//!   - name: parser
//!     kind: model
//!     model_id: gpt-4o-mini
//!     instruction: "Extract base, target and threshold from: {user_message}"
//!     output_key: parsed
//!   - name: build_url
//!     kind: expression
//!     expression: '"https://open.er-api.com/v6/latest/" + parsed.base'
//!     input_keys: [parsed]
//!     output_key: rate_url
//! orchestration:
//!   mode: sequential
//!   agents: [parser, build_url]
//! ```
//!
//! Parsing is strict: unknown `kind` / `mode` tags and unknown runtime
//! service selectors are rejected by serde before validation even runs.
//! [`load_package`] and [`load_workflow_dir`] wrap parsing together with
//! [`crate::agentflow::validator::validate`], so a [`WorkflowDefinition`]
//! obtained through them is always fully cross-checked and immutable from
//! then on.

use crate::agentflow::validator::{self, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// File name every workflow package must contain.
pub const WORKFLOW_FILE: &str = "workflow.yaml";

/// A fully parsed and validated workflow definition.
///
/// Created by the loader, validated once, immutable thereafter. The
/// hydrator consumes it to build the executable agent tree.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowDefinition {
    /// Unique workflow name within the registry.
    pub name: String,
    /// Human-readable description surfaced by listing and A2A cards.
    #[serde(default)]
    pub description: String,
    /// Per-workflow runtime service selection.
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Ordered list of agent declarations.
    pub agents: Vec<AgentConfig>,
    /// How the declared agents are composed at the top level.
    pub orchestration: OrchestrationConfig,
    /// Optional A2A discovery opt-in. Presence of this block is what makes
    /// the platform publish an agent card for the workflow.
    #[serde(default)]
    pub a2a: Option<A2AConfig>,
}

impl WorkflowDefinition {
    /// Parse and validate a definition from YAML text.
    pub fn from_yaml_str(input: &str) -> Result<Self, WorkflowError> {
        let def: WorkflowDefinition =
            serde_yaml::from_str(input).map_err(|e| WorkflowError::Parse(e.to_string()))?;
        validator::validate(&def).map_err(WorkflowError::Validation)?;
        Ok(def)
    }

    /// Look up an agent declaration by name.
    pub fn agent(&self, name: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.name == name)
    }
}

/// One agent declaration: common attributes plus a kind-specific payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    /// Unique name within the workflow.
    pub name: String,
    /// Free-form description (embedded into agent-tool schemas and cards).
    #[serde(default)]
    pub description: String,
    /// Ordered session-state keys this agent reads.
    #[serde(default)]
    pub input_keys: Vec<String>,
    /// The single session-state key a leaf agent writes on success.
    #[serde(default)]
    pub output_key: Option<String>,
    /// Hook-point name -> registered callback name.
    #[serde(default)]
    pub callbacks: HashMap<String, String>,
    /// Kind-specific configuration, tagged by `kind`.
    #[serde(flatten)]
    pub kind: AgentKind,
}

impl AgentConfig {
    /// Whether this declaration is one of the three composite kinds.
    pub fn is_composite(&self) -> bool {
        matches!(
            self.kind,
            AgentKind::Sequential { .. } | AgentKind::Parallel { .. } | AgentKind::Loop { .. }
        )
    }

    /// Sub-agent names for composite kinds, empty slice for leaves.
    pub fn sub_agents(&self) -> &[String] {
        match &self.kind {
            AgentKind::Sequential { sub_agents }
            | AgentKind::Parallel { sub_agents }
            | AgentKind::Loop { sub_agents, .. } => sub_agents,
            _ => &[],
        }
    }
}

/// The seven agent kinds. Four leaves perform work, three composites
/// schedule children.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentKind {
    /// LLM-backed agent with a templated instruction and optional tools.
    Model {
        /// Model identifier. A provider prefix such as `anthropic/` or
        /// `openai/` selects the cross-provider adapter; any other string
        /// is handed to the native invoker unchanged.
        model_id: String,
        /// Instruction text; `{key}` placeholders resolve against session
        /// state at invocation time.
        instruction: String,
        #[serde(default)]
        temperature: Option<f64>,
        #[serde(default)]
        max_tokens: Option<u32>,
        #[serde(default)]
        top_p: Option<f64>,
        #[serde(default)]
        top_k: Option<u32>,
        /// Registry tool names bound to this agent.
        #[serde(default)]
        tools: Vec<String>,
        /// Other agents of this workflow, wrapped as callable tools.
        #[serde(default)]
        agent_tools: Vec<String>,
        /// OpenAPI spec references forwarded to the invoker as opaque
        /// tool metadata.
        #[serde(default)]
        openapi_tools: Vec<OpenApiToolConfig>,
        /// JSON-Schema-shaped structured output constraint.
        #[serde(default)]
        output_schema: Option<serde_json::Value>,
        /// JSON-Schema-shaped input constraint (informational passthrough).
        #[serde(default)]
        input_schema: Option<serde_json::Value>,
        #[serde(default)]
        planner: Option<PlannerChoice>,
    },
    /// Invokes a named callable from the process-wide function registry
    /// with state slots passed as keyword arguments.
    Code {
        /// Registered function path, e.g. `pricing.parse_params`.
        function: String,
    },
    /// Evaluates a sandboxed expression over the named state slots.
    Expression {
        /// Restricted expression source; compiled at hydration.
        expression: String,
    },
    /// Invokes one registry tool with templated configuration.
    Tool {
        /// Registry tool name.
        tool: String,
        /// Tool parameters. String values may contain `{key}` placeholders
        /// resolved against session state at invocation time.
        #[serde(default)]
        tool_config: HashMap<String, serde_json::Value>,
    },
    /// Runs its children one after another in declared order.
    Sequential { sub_agents: Vec<String> },
    /// Runs all children concurrently and collects every result.
    Parallel { sub_agents: Vec<String> },
    /// Repeats its children as a unit until `max_iterations` or the
    /// `exit_loop` signal.
    Loop {
        sub_agents: Vec<String>,
        max_iterations: usize,
    },
}

impl AgentKind {
    /// Tag string as it appears in YAML, used in validation error paths.
    pub fn tag(&self) -> &'static str {
        match self {
            AgentKind::Model { .. } => "model",
            AgentKind::Code { .. } => "code",
            AgentKind::Expression { .. } => "expression",
            AgentKind::Tool { .. } => "tool",
            AgentKind::Sequential { .. } => "sequential",
            AgentKind::Parallel { .. } => "parallel",
            AgentKind::Loop { .. } => "loop",
        }
    }
}

/// Planner selection for model agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannerChoice {
    /// Plan-then-act: a structured planning preamble is prepended to the
    /// instruction and the response is expected in tagged sections.
    PlanReact,
    /// Model-native planning (thinking) is requested from the invoker.
    BuiltIn,
}

/// Reference to an OpenAPI spec with its auth configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OpenApiToolConfig {
    /// Path to the spec file, relative to the package's `specs/` directory.
    pub spec_path: String,
    #[serde(default)]
    pub auth: OpenApiAuthConfig,
}

/// Auth shape for an OpenAPI toolset. Environment lookups fail soft:
/// a missing variable produces an empty credential so the failure
/// surfaces on use, not at boot.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OpenApiAuthConfig {
    #[serde(default)]
    pub scheme: AuthScheme,
    /// Env var holding the bearer token (`scheme: bearer`).
    #[serde(default)]
    pub token_env: Option<String>,
    /// Env var holding the API key (`scheme: apikey`).
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Header name the API key is sent in. Defaults to `X-API-Key`.
    #[serde(default)]
    pub header: Option<String>,
    /// Env vars and token URL for `scheme: oauth2`.
    #[serde(default)]
    pub client_id_env: Option<String>,
    #[serde(default)]
    pub client_secret_env: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
}

/// Supported OpenAPI auth schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    None,
    Bearer,
    Apikey,
    Oauth2,
}

impl Default for AuthScheme {
    fn default() -> Self {
        AuthScheme::None
    }
}

/// Top-level composition of the declared agents.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestrationConfig {
    /// What a sequential composite does when a child emits an error event.
    /// Applies workflow-wide. Defaults to halting on the first error.
    #[serde(default)]
    pub on_error: ErrorPolicy,
    #[serde(flatten)]
    pub mode: OrchestrationMode,
}

/// The six orchestration modes.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OrchestrationMode {
    Sequential {
        agents: Vec<String>,
    },
    Parallel {
        agents: Vec<String>,
    },
    Loop {
        agents: Vec<String>,
        max_iterations: usize,
    },
    /// Dependency-graph scheduling: nodes execute in topological waves.
    Dag {
        nodes: Vec<DagNodeConfig>,
    },
    /// A single agent driven by the plan-then-act planner.
    React {
        agent: String,
        #[serde(default)]
        planner: Option<PlannerChoice>,
    },
    /// A router model agent that delegates to the listed agents, each
    /// wrapped as a callable tool.
    LlmRouted {
        agents: Vec<String>,
        router: String,
    },
}

impl OrchestrationMode {
    /// Tag string as it appears in YAML.
    pub fn tag(&self) -> &'static str {
        match self {
            OrchestrationMode::Sequential { .. } => "sequential",
            OrchestrationMode::Parallel { .. } => "parallel",
            OrchestrationMode::Loop { .. } => "loop",
            OrchestrationMode::Dag { .. } => "dag",
            OrchestrationMode::React { .. } => "react",
            OrchestrationMode::LlmRouted { .. } => "llm_routed",
        }
    }
}

/// One node of a DAG orchestration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DagNodeConfig {
    /// Declared agent name this node runs.
    pub agent: String,
    /// Names of nodes that must complete before this one starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Error policy for sequential composites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Stop after the first child error event (default).
    Halt,
    /// Keep running remaining children; downstream agents observe the
    /// missing state key and fail on their own terms.
    Continue,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        ErrorPolicy::Halt
    }
}

/// Per-workflow runtime service selection, read once per run when the
/// runner is constructed.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub session_service: SessionServiceKind,
    /// File path for the `sqlite` session service.
    #[serde(default)]
    pub session_db_path: Option<String>,
    /// Engine URL for the `database` session service. Required there.
    #[serde(default)]
    pub session_db_url: Option<String>,
    #[serde(default)]
    pub memory_service: MemoryServiceKind,
    #[serde(default)]
    pub artifact_service: ArtifactServiceKind,
    #[serde(default)]
    pub artifact_dir: Option<String>,
    /// Names from the fixed plugin factory table. Factories with missing
    /// configuration are skipped silently.
    #[serde(default)]
    pub plugins: Vec<String>,
    #[serde(default)]
    pub context_cache_ttl_secs: Option<u64>,
    #[serde(default)]
    pub compaction_threshold: Option<usize>,
    #[serde(default)]
    pub resumable: bool,
    /// IANA timezone name injected into session state. Defaults to `UTC`.
    #[serde(default)]
    pub timezone: Option<String>,
}

/// Session persistence backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionServiceKind {
    /// Process-local, lost on shutdown.
    InMemory,
    /// File-backed at `session_db_path`; one process at a time.
    Sqlite,
    /// SQL engine at `session_db_url`.
    Database,
}

impl Default for SessionServiceKind {
    fn default() -> Self {
        SessionServiceKind::InMemory
    }
}

/// Memory service backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryServiceKind {
    None,
    InMemory,
}

impl Default for MemoryServiceKind {
    fn default() -> Self {
        MemoryServiceKind::None
    }
}

/// Artifact service backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactServiceKind {
    None,
    InMemory,
    File,
}

impl Default for ArtifactServiceKind {
    fn default() -> Self {
        ArtifactServiceKind::None
    }
}

/// A2A discovery opt-in block.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct A2AConfig {
    pub version: String,
    #[serde(default)]
    pub skills: Vec<SkillDef>,
}

/// Declarative capability descriptor published on the agent card.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SkillDef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Errors produced while loading workflow packages.
#[derive(Debug)]
pub enum WorkflowError {
    /// Filesystem failure reading a package.
    Io(String),
    /// YAML did not parse into the definition shape (unknown tags land
    /// here too).
    Parse(String),
    /// The definition parsed but failed cross-reference validation.
    Validation(ValidationError),
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowError::Io(msg) => write!(f, "workflow io error: {}", msg),
            WorkflowError::Parse(msg) => write!(f, "workflow parse error: {}", msg),
            WorkflowError::Validation(err) => write!(f, "workflow validation error: {}", err),
        }
    }
}

impl Error for WorkflowError {}

/// Load and validate a single workflow package directory.
///
/// The directory must contain a `workflow.yaml`; an optional `specs/`
/// subdirectory holds OpenAPI specs referenced by `openapi_tools`.
pub fn load_package(dir: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let file = dir.join(WORKFLOW_FILE);
    let text = fs::read_to_string(&file)
        .map_err(|e| WorkflowError::Io(format!("{}: {}", file.display(), e)))?;
    WorkflowDefinition::from_yaml_str(&text)
}

/// Scan a directory of workflow packages, returning each validated
/// definition together with its package path.
///
/// A `.env` file is searched from `dir` upward to the filesystem root and
/// loaded (nearest wins) before any definition is parsed, so environment
/// references inside auth configuration resolve consistently.
pub fn load_workflow_dir(dir: &Path) -> Result<Vec<(WorkflowDefinition, PathBuf)>, WorkflowError> {
    load_dotenv_from(dir);

    let entries =
        fs::read_dir(dir).map_err(|e| WorkflowError::Io(format!("{}: {}", dir.display(), e)))?;

    let mut out = Vec::new();
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir() && p.join(WORKFLOW_FILE).is_file())
        .collect();
    paths.sort();

    for package in paths {
        let def = load_package(&package)?;
        log::info!("loaded workflow '{}' from {}", def.name, package.display());
        out.push((def, package));
    }
    Ok(out)
}

/// Parse and validate a single definition file (not a package directory).
/// Backs the external CLI's `validate` command: the returned error carries
/// the field-scoped path operators need.
pub fn validate_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let text = fs::read_to_string(path)
        .map_err(|e| WorkflowError::Io(format!("{}: {}", path.display(), e)))?;
    WorkflowDefinition::from_yaml_str(&text)
}

/// Walk from `start` up to the filesystem root looking for a `.env` file;
/// load the nearest one found. Absence is not an error.
pub fn load_dotenv_from(start: &Path) {
    let mut current = Some(start);
    while let Some(dir) = current {
        let candidate = dir.join(".env");
        if candidate.is_file() {
            match dotenvy::from_path(&candidate) {
                Ok(()) => log::debug!("loaded environment from {}", candidate.display()),
                Err(e) => log::warn!("failed to load {}: {}", candidate.display(), e),
            }
            return;
        }
        current = dir.parent();
    }
}

/// Scaffold a minimal workflow package at `dir/name`.
///
/// Writes a `workflow.yaml` with a single model agent under sequential
/// orchestration, ready to edit. Used by the external CLI's `init`.
pub fn init_package(dir: &Path, name: &str) -> Result<PathBuf, WorkflowError> {
    let package = dir.join(name);
    fs::create_dir_all(&package)
        .map_err(|e| WorkflowError::Io(format!("{}: {}", package.display(), e)))?;
    let file = package.join(WORKFLOW_FILE);
    let contents = format!(
        "name: {name}\n\
         description: Describe what this workflow does.\n\
         runtime:\n\
         \x20 session_service: in_memory\n\
         agents:\n\
         \x20 - name: responder\n\
         \x20   kind: model\n\
         \x20   model_id: gpt-4o-mini\n\
         \x20   instruction: \"Answer the user. Today is {{current_date}}.\"\n\
         \x20   output_key: answer\n\
         orchestration:\n\
         \x20 mode: sequential\n\
         \x20 agents: [responder]\n",
        name = name
    );
    fs::write(&file, contents)
        .map_err(|e| WorkflowError::Io(format!("{}: {}", file.display(), e)))?;
    Ok(package)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
name: demo
description: Minimal demo workflow.
agents:
  - name: greet
    kind: expression
    expression: '"hello " + who'
    input_keys: [who]
    output_key: greeting
orchestration:
  mode: sequential
  agents: [greet]
"#;

    #[test]
    fn parses_minimal_definition() {
        let def = WorkflowDefinition::from_yaml_str(MINIMAL).unwrap();
        assert_eq!(def.name, "demo");
        assert_eq!(def.agents.len(), 1);
        assert_eq!(def.agents[0].kind.tag(), "expression");
        assert_eq!(def.orchestration.mode.tag(), "sequential");
        assert_eq!(def.orchestration.on_error, ErrorPolicy::Halt);
    }

    #[test]
    fn unknown_kind_is_a_parse_error() {
        let text = MINIMAL.replace("kind: expression", "kind: quantum");
        match WorkflowDefinition::from_yaml_str(&text) {
            Err(WorkflowError::Parse(_)) => {}
            other => panic!("expected parse error, got {:?}", other.map(|d| d.name)),
        }
    }

    #[test]
    fn unknown_session_service_is_rejected() {
        let text = MINIMAL.replace(
            "description: Minimal demo workflow.",
            "description: x\nruntime:\n  session_service: redis",
        );
        assert!(matches!(
            WorkflowDefinition::from_yaml_str(&text),
            Err(WorkflowError::Parse(_))
        ));
    }

    #[test]
    fn dag_nodes_parse_with_dependencies() {
        let text = r#"
name: diamond
agents:
  - name: a
    kind: expression
    expression: '"a"'
    output_key: a
  - name: b
    kind: expression
    expression: '"b"'
    output_key: b
orchestration:
  mode: dag
  nodes:
    - agent: a
    - agent: b
      depends_on: [a]
"#;
        let def = WorkflowDefinition::from_yaml_str(text).unwrap();
        match &def.orchestration.mode {
            OrchestrationMode::Dag { nodes } => {
                assert_eq!(nodes.len(), 2);
                assert_eq!(nodes[1].depends_on, vec!["a".to_string()]);
            }
            other => panic!("expected dag mode, got {}", other.tag()),
        }
    }

    #[test]
    fn init_package_writes_a_loadable_workflow() {
        let tmp = tempfile::tempdir().unwrap();
        let package = init_package(tmp.path(), "starter").unwrap();
        let def = load_package(&package).unwrap();
        assert_eq!(def.name, "starter");
    }
}
