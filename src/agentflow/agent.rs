//! The executable agent tree.
//!
//! [`Agent`] is a tagged sum over the seven agent kinds: four leaves that
//! perform work and three composites plus the DAG scheduler that schedule
//! children. One `execute` dispatcher per variant keeps the event/state
//! contract uniform without virtual dispatch; composites hold their
//! children as `Arc<Agent>` handles with no back-references.
//!
//! # The leaf contract
//!
//! Every leaf execution reads its input keys from session state and then
//! either
//!
//! - writes `output_key` into state **and** emits one success event whose
//!   `state_delta` carries the same mapping, or
//! - emits exactly one error event with an empty delta, leaving state
//!   untouched.
//!
//! Errors never escape `execute` as Rust errors; composites observe the
//! returned [`AgentOutcome`] and downstream agents observe missing state
//! keys.

use crate::agentflow::callbacks::{CodeFunction, HookPoint, ResolvedCallbacks};
use crate::agentflow::composite::{LoopAgent, ParallelAgent, SequentialAgent};
use crate::agentflow::dag::DagAgent;
use crate::agentflow::event::{ActionSignals, Event};
use crate::agentflow::expression::Sandbox;
use crate::agentflow::model::{
    GenerationConfig, ModelInvoker, ModelMessage, ModelRequest, TokenUsage,
};
use crate::agentflow::planner::{self, Planner};
use crate::agentflow::plugin::Plugin;
use crate::agentflow::session::Session;
use crate::agentflow::template;
use crate::agentflow::tool_protocol::{Tool, ToolContext, ToolMetadata};
use crate::agentflow::workflow::ErrorPolicy;
use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Cap on tool round-trips inside one model-agent execution.
const MAX_TOOL_ITERATIONS: usize = 5;

/// How one agent execution ended. Composites branch on this; it never
/// carries data; data travels through events and session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentOutcome {
    Success,
    Error,
}

impl AgentOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, AgentOutcome::Error)
    }
}

/// Everything one invocation shares across its agent tree.
pub struct InvocationContext {
    pub invocation_id: String,
    pub session: Session,
    /// The caller's message, delivered to model agents as the user turn.
    pub user_message: String,
    pub signals: Arc<ActionSignals>,
    pub plugins: Vec<Arc<dyn Plugin>>,
    events: mpsc::Sender<Event>,
    /// Sequential composites' reaction to child errors.
    pub on_error: ErrorPolicy,
}

impl InvocationContext {
    pub fn new(
        invocation_id: impl Into<String>,
        session: Session,
        user_message: impl Into<String>,
        plugins: Vec<Arc<dyn Plugin>>,
        events: mpsc::Sender<Event>,
        on_error: ErrorPolicy,
    ) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            session,
            user_message: user_message.into(),
            signals: Arc::new(ActionSignals::new()),
            plugins,
            events,
            on_error,
        }
    }

    /// Emit an event: reconcile its state delta into session state, notify
    /// plugins, then stream it to the caller. A dropped receiver means the
    /// caller went away; the invocation unwinds quietly.
    pub async fn emit(&self, event: Event) {
        self.session.state.apply_delta(&event.actions.state_delta).await;
        for plugin in &self.plugins {
            plugin.on_event(&event).await;
        }
        if self.events.send(event).await.is_err() {
            log::debug!("event receiver dropped for invocation {}", self.invocation_id);
        }
    }

    /// Run the `after_model` plugin hooks.
    pub async fn after_model(&self, model: &str, usage: &TokenUsage) {
        for plugin in &self.plugins {
            plugin.after_model(model, usage).await;
        }
    }

    /// Run the `before_tool` plugin hooks.
    pub async fn before_tool(&self, tool_name: &str) {
        for plugin in &self.plugins {
            plugin.before_tool(tool_name).await;
        }
    }

    /// Tool-facing view of this invocation.
    pub fn tool_context(&self) -> ToolContext {
        ToolContext::new(
            self.invocation_id.clone(),
            self.session.state.clone(),
            self.signals.clone(),
        )
    }
}

/// An executable unit of a workflow.
pub enum Agent {
    Model(ModelAgent),
    Code(CodeAgent),
    Expression(ExpressionAgent),
    Tool(ToolAgent),
    Sequential(SequentialAgent),
    Parallel(ParallelAgent),
    Loop(LoopAgent),
    Dag(DagAgent),
}

impl Agent {
    pub fn name(&self) -> &str {
        match self {
            Agent::Model(a) => &a.name,
            Agent::Code(a) => &a.name,
            Agent::Expression(a) => &a.name,
            Agent::Tool(a) => &a.name,
            Agent::Sequential(a) => &a.name,
            Agent::Parallel(a) => &a.name,
            Agent::Loop(a) => &a.name,
            Agent::Dag(a) => &a.name,
        }
    }

    /// Execute this agent within an invocation. Boxed because composite
    /// variants recurse through their children.
    pub fn execute<'a>(&'a self, ctx: &'a InvocationContext) -> BoxFuture<'a, AgentOutcome> {
        Box::pin(async move {
            match self {
                Agent::Model(a) => a.run(ctx).await,
                Agent::Code(a) => a.run(ctx).await,
                Agent::Expression(a) => a.run(ctx).await,
                Agent::Tool(a) => a.run(ctx).await,
                Agent::Sequential(a) => a.run(ctx).await,
                Agent::Parallel(a) => a.run(ctx).await,
                Agent::Loop(a) => a.run(ctx).await,
                Agent::Dag(a) => a.run(ctx).await,
            }
        })
    }
}

/// Another workflow agent exposed to a model agent as a callable tool.
pub struct AgentTool {
    pub metadata: ToolMetadata,
    pub agent: Arc<Agent>,
    /// The wrapped agent's output key, read back as the tool result.
    pub output_key: Option<String>,
}

impl AgentTool {
    /// Run the wrapped agent and surface its output as a tool result
    /// mapping.
    async fn invoke(&self, ctx: &InvocationContext) -> Value {
        let outcome = self.agent.execute(ctx).await;
        if outcome.is_error() {
            return json!({
                "error": format!("agent '{}' failed", self.agent.name()),
            });
        }
        match &self.output_key {
            Some(key) => match ctx.session.state.get(key).await {
                Some(value) => json!({ "result": value }),
                None => json!({ "result": Value::Null }),
            },
            None => json!({ "result": Value::Null }),
        }
    }
}

// ---------------------------------------------------------------------------
// Model agent
// ---------------------------------------------------------------------------

/// LLM-backed leaf agent.
///
/// Resolves its instruction template against session state, offers its
/// bound tools to the invoker, loops on tool calls up to a fixed cap, and
/// records the final answer (optionally schema-constrained) under its
/// output key.
pub struct ModelAgent {
    pub name: String,
    pub description: String,
    pub instruction: String,
    pub output_key: String,
    pub invoker: Arc<dyn ModelInvoker>,
    pub generation: GenerationConfig,
    pub tools: Vec<Arc<dyn Tool>>,
    pub agent_tools: Vec<AgentTool>,
    /// Opaque tool schemas (OpenAPI passthrough) offered to the invoker
    /// but not executable by the core.
    pub extra_tool_metadata: Vec<ToolMetadata>,
    pub output_schema: Option<Value>,
    pub input_schema: Option<Value>,
    pub planner: Option<Planner>,
    pub callbacks: ResolvedCallbacks,
}

impl ModelAgent {
    async fn run(&self, ctx: &InvocationContext) -> AgentOutcome {
        self.callbacks.fire(HookPoint::BeforeAgent, &self.name, json!({}));

        let snapshot = ctx.session.state.snapshot().await;
        let mut instruction = template::resolve_text(&self.instruction, &snapshot);
        if let Some(schema) = &self.output_schema {
            instruction.push_str(&format!(
                "\n\nRespond with a single JSON object that conforms to this schema:\n{}",
                schema
            ));
        }

        let mut request = ModelRequest {
            instruction,
            messages: vec![ModelMessage::new("user", ctx.user_message.clone())],
            tools: self.tool_schemas(),
            generation: self.generation.clone(),
            output_schema: self.output_schema.clone(),
            thinking: false,
        };
        if let Some(planner) = &self.planner {
            planner.apply(&mut request);
        }

        let mut final_text = String::new();
        for iteration in 0..MAX_TOOL_ITERATIONS {
            self.callbacks.fire(
                HookPoint::BeforeModel,
                &self.name,
                json!({ "iteration": iteration + 1 }),
            );

            let response = match self.invoker.invoke(request.clone()).await {
                Ok(r) => r,
                Err(e) => {
                    let message = format!("model invocation failed: {}", e);
                    log::error!("agent '{}': {}", self.name, message);
                    let event = Event::failure(&self.name, &ctx.invocation_id, message);
                    ctx.emit(event).await;
                    self.callbacks
                        .fire(HookPoint::AfterAgent, &self.name, json!({"outcome": "error"}));
                    return AgentOutcome::Error;
                }
            };

            if let Some(usage) = &response.usage {
                ctx.after_model(self.invoker.model_name(), usage).await;
            }
            self.callbacks.fire(
                HookPoint::AfterModel,
                &self.name,
                json!({ "model": self.invoker.model_name() }),
            );

            match response.tool_call {
                Some(call) => {
                    let result = self.dispatch_tool(ctx, &call.name, call.params.clone()).await;
                    request.messages.push(ModelMessage::new(
                        "assistant",
                        format!("[tool_call] {} {}", call.name, call.params),
                    ));
                    request.messages.push(ModelMessage::new(
                        "tool",
                        format!("{} returned: {}", call.name, result),
                    ));
                    if iteration + 1 == MAX_TOOL_ITERATIONS {
                        log::warn!(
                            "agent '{}' hit the tool iteration cap of {}",
                            self.name,
                            MAX_TOOL_ITERATIONS
                        );
                        final_text = response.text;
                    }
                }
                None => {
                    final_text = response.text;
                    break;
                }
            }
        }

        let answer = match self.planner {
            Some(Planner::PlanReact) => planner::extract_final_answer(&final_text).to_string(),
            _ => final_text,
        };

        let output_value = match &self.output_schema {
            Some(schema) => match structured_output(&answer, schema) {
                Ok(value) => value,
                Err(message) => {
                    let event = Event::failure(&self.name, &ctx.invocation_id, message);
                    ctx.emit(event).await;
                    self.callbacks
                        .fire(HookPoint::AfterAgent, &self.name, json!({"outcome": "error"}));
                    return AgentOutcome::Error;
                }
            },
            None => Value::String(answer.clone()),
        };

        let mut delta = HashMap::new();
        delta.insert(self.output_key.clone(), output_value);
        let event = Event::success(&self.name, &ctx.invocation_id, "model", answer, delta);
        ctx.emit(event).await;
        self.callbacks
            .fire(HookPoint::AfterAgent, &self.name, json!({"outcome": "success"}));
        AgentOutcome::Success
    }

    fn tool_schemas(&self) -> Vec<ToolMetadata> {
        let mut schemas: Vec<ToolMetadata> =
            self.tools.iter().map(|t| t.metadata().clone()).collect();
        schemas.extend(self.agent_tools.iter().map(|t| t.metadata.clone()));
        schemas.extend(self.extra_tool_metadata.iter().cloned());
        schemas
    }

    /// Route a model-requested tool call to a bound tool or agent tool.
    async fn dispatch_tool(&self, ctx: &InvocationContext, name: &str, params: Value) -> Value {
        ctx.before_tool(name).await;
        self.callbacks
            .fire(HookPoint::BeforeTool, &self.name, json!({ "tool": name }));

        let result = if let Some(tool) = self
            .tools
            .iter()
            .find(|t| t.metadata().name == name)
        {
            tool.execute(&ctx.tool_context(), params).await
        } else if let Some(agent_tool) =
            self.agent_tools.iter().find(|t| t.metadata.name == name)
        {
            agent_tool.invoke(ctx).await
        } else {
            json!({ "error": format!("tool '{}' is not bound to agent '{}'", name, self.name) })
        };

        self.callbacks
            .fire(HookPoint::AfterTool, &self.name, json!({ "tool": name }));
        result
    }
}

/// Parse a schema-constrained answer and check its required keys.
fn structured_output(answer: &str, schema: &Value) -> Result<Value, String> {
    let trimmed = strip_code_fences(answer);
    let parsed: Value = serde_json::from_str(trimmed)
        .map_err(|e| format!("structured output is not valid JSON: {}", e))?;
    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required {
            if let Some(key) = key.as_str() {
                if parsed.get(key).is_none() {
                    return Err(format!("structured output is missing required key '{}'", key));
                }
            }
        }
    }
    Ok(parsed)
}

/// Models love Markdown fences around JSON; tolerate them.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open.strip_suffix("```").unwrap_or(without_open).trim()
}

// ---------------------------------------------------------------------------
// Code agent
// ---------------------------------------------------------------------------

/// Invokes a registered callable with state slots as keyword arguments.
pub struct CodeAgent {
    pub name: String,
    pub function_path: String,
    pub function: CodeFunction,
    pub input_keys: Vec<String>,
    pub output_key: String,
    pub callbacks: ResolvedCallbacks,
}

impl CodeAgent {
    async fn run(&self, ctx: &InvocationContext) -> AgentOutcome {
        self.callbacks.fire(HookPoint::BeforeAgent, &self.name, json!({}));
        let args = ctx.session.state.slice(&self.input_keys).await;

        match self.function.call(args).await {
            Ok(value) => {
                let mut delta = HashMap::new();
                delta.insert(self.output_key.clone(), value.clone());
                let text = template::stringify(&value);
                let event = Event::success(&self.name, &ctx.invocation_id, "agent", text, delta);
                ctx.emit(event).await;
                self.callbacks
                    .fire(HookPoint::AfterAgent, &self.name, json!({"outcome": "success"}));
                AgentOutcome::Success
            }
            Err(message) => {
                let message = format!("function '{}' failed: {}", self.function_path, message);
                log::error!("agent '{}': {}", self.name, message);
                ctx.emit(Event::failure(&self.name, &ctx.invocation_id, message))
                    .await;
                self.callbacks
                    .fire(HookPoint::AfterAgent, &self.name, json!({"outcome": "error"}));
                AgentOutcome::Error
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Expression agent
// ---------------------------------------------------------------------------

/// Evaluates a sandboxed expression over its input keys.
///
/// The expression was compiled (and whitelist-checked) at hydration; only
/// evaluation-time failures can occur here and they become error events.
pub struct ExpressionAgent {
    pub name: String,
    pub sandbox: Sandbox,
    pub input_keys: Vec<String>,
    pub output_key: String,
    pub callbacks: ResolvedCallbacks,
}

impl ExpressionAgent {
    async fn run(&self, ctx: &InvocationContext) -> AgentOutcome {
        self.callbacks.fire(HookPoint::BeforeAgent, &self.name, json!({}));
        let slice = ctx.session.state.slice(&self.input_keys).await;

        match self.sandbox.eval(&slice) {
            Ok(value) => {
                let mut delta = HashMap::new();
                delta.insert(self.output_key.clone(), value.clone());
                let text = template::stringify(&value);
                let event = Event::success(&self.name, &ctx.invocation_id, "agent", text, delta);
                ctx.emit(event).await;
                self.callbacks
                    .fire(HookPoint::AfterAgent, &self.name, json!({"outcome": "success"}));
                AgentOutcome::Success
            }
            Err(e) => {
                log::error!("agent '{}': {}", self.name, e);
                ctx.emit(Event::failure(&self.name, &ctx.invocation_id, e.to_string()))
                    .await;
                self.callbacks
                    .fire(HookPoint::AfterAgent, &self.name, json!({"outcome": "error"}));
                AgentOutcome::Error
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tool agent
// ---------------------------------------------------------------------------

/// Invokes one registry tool with templated configuration.
///
/// The tool's returned mapping becomes the output value as-is, including
/// `{"error": ...}` mappings, which is what lets downstream agents branch
/// on `state[key]["error"]`.
pub struct ToolAgent {
    pub name: String,
    pub tool: Arc<dyn Tool>,
    pub tool_config: HashMap<String, Value>,
    pub output_key: String,
    pub callbacks: ResolvedCallbacks,
}

impl ToolAgent {
    async fn run(&self, ctx: &InvocationContext) -> AgentOutcome {
        self.callbacks.fire(HookPoint::BeforeAgent, &self.name, json!({}));
        let snapshot = ctx.session.state.snapshot().await;

        let mut params = serde_json::Map::new();
        for (key, value) in &self.tool_config {
            params.insert(key.clone(), template::resolve_value(value, &snapshot));
        }

        let tool_name = self.tool.metadata().name.clone();
        ctx.before_tool(&tool_name).await;
        self.callbacks
            .fire(HookPoint::BeforeTool, &self.name, json!({ "tool": tool_name }));

        let result = self
            .tool
            .execute(&ctx.tool_context(), Value::Object(params))
            .await;

        self.callbacks
            .fire(HookPoint::AfterTool, &self.name, json!({ "tool": tool_name }));

        let mut delta = HashMap::new();
        delta.insert(self.output_key.clone(), result.clone());
        let text = template::stringify(&result);
        let event = Event::success(&self.name, &ctx.invocation_id, "tool", text, delta);
        ctx.emit(event).await;
        self.callbacks
            .fire(HookPoint::AfterAgent, &self.name, json!({"outcome": "success"}));
        AgentOutcome::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_code_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn structured_output_checks_required_keys() {
        let schema = json!({"type": "object", "required": ["base", "target"]});
        assert!(structured_output("{\"base\": \"USD\", \"target\": \"COP\"}", &schema).is_ok());
        let err = structured_output("{\"base\": \"USD\"}", &schema).unwrap_err();
        assert!(err.contains("target"));
        assert!(structured_output("not json", &schema).is_err());
    }
}
