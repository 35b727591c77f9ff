//! The tool invocation contract.
//!
//! Every tool (bundled, custom, or built-in) exposes the same surface:
//! an asynchronous `execute(context, params)` returning a JSON mapping.
//! Tools never fail by exception for recoverable problems; they return a
//! mapping with an `error` field instead, which lets downstream agents
//! branch on `state[key]["error"]` (see the tool agent contract).
//!
//! Complex inputs are passed as JSON-encoded strings and parsed inside the
//! tool with [`safe_parse_json`], which falls back to a caller-specified
//! default instead of failing.

use crate::agentflow::event::ActionSignals;
use crate::agentflow::session::SessionState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Execution context handed to every tool call.
///
/// Exposes a read/write view of session state and the action channel used
/// for signals such as loop exit. Cloning shares both.
#[derive(Clone)]
pub struct ToolContext {
    pub invocation_id: String,
    pub state: SessionState,
    pub signals: Arc<ActionSignals>,
}

impl ToolContext {
    pub fn new(
        invocation_id: impl Into<String>,
        state: SessionState,
        signals: Arc<ActionSignals>,
    ) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            state,
            signals,
        }
    }
}

/// Declared type of a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolParameterType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

/// One typed parameter of a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ToolParameterType,
    pub description: Option<String>,
    pub required: bool,
}

impl ToolParameter {
    pub fn new(name: impl Into<String>, param_type: ToolParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: None,
            required: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Identity and interface description of a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
}

impl ToolMetadata {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, param: ToolParameter) -> Self {
        self.parameters.push(param);
        self
    }
}

/// Errors for tool registration and resolution.
#[derive(Debug, Clone)]
pub enum ToolError {
    /// No custom registration and no built-in under that name.
    NotFound(String),
    /// Registration attempted with an empty name.
    InvalidName,
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::NotFound(name) => write!(f, "tool not found: {}", name),
            ToolError::InvalidName => write!(f, "tool name must be a non-empty string"),
        }
    }
}

impl Error for ToolError {}

/// A tool usable by agents.
///
/// `execute` must always return a mapping; recoverable failures are
/// `{"error": ...}` mappings produced with [`error_value`].
#[async_trait]
pub trait Tool: Send + Sync {
    fn metadata(&self) -> &ToolMetadata;

    async fn execute(&self, ctx: &ToolContext, params: Value) -> Value;
}

/// Build the conventional error mapping.
pub fn error_value(message: impl Into<String>) -> Value {
    json!({ "error": message.into() })
}

/// Parse a JSON-encoded string, returning `default` when the input is not
/// valid JSON. Non-string complex inputs that arrive pre-parsed are passed
/// through unchanged.
pub fn safe_parse_json(input: &Value, default: Value) -> Value {
    match input {
        Value::String(s) => serde_json::from_str(s).unwrap_or(default),
        other => other.clone(),
    }
}

/// Adapter turning an async closure into a [`Tool`].
///
/// Used by the built-in catalog and convenient for tests.
pub struct FnTool {
    metadata: ToolMetadata,
    handler: Arc<
        dyn Fn(ToolContext, Value) -> futures_util::future::BoxFuture<'static, Value>
            + Send
            + Sync,
    >,
}

impl FnTool {
    pub fn new<F>(metadata: ToolMetadata, handler: F) -> Self
    where
        F: Fn(ToolContext, Value) -> futures_util::future::BoxFuture<'static, Value>
            + Send
            + Sync
            + 'static,
    {
        Self {
            metadata,
            handler: Arc::new(handler),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn execute(&self, ctx: &ToolContext, params: Value) -> Value {
        (self.handler)(ctx.clone(), params).await
    }
}

/// A name-only entry for capabilities the model invoker executes natively
/// (e.g. provider-hosted search). Calling it from the core is an error
/// mapping, not a panic.
pub struct PassthroughTool {
    metadata: ToolMetadata,
}

impl PassthroughTool {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            metadata: ToolMetadata::new(name, description),
        }
    }
}

#[async_trait]
impl Tool for PassthroughTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn execute(&self, _ctx: &ToolContext, _params: Value) -> Value {
        error_value(format!(
            "tool '{}' is executed natively by the model invoker",
            self.metadata.name
        ))
    }
}
