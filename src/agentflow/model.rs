//! Provider-agnostic model invocation.
//!
//! The core never talks to a concrete LLM vendor. A [`ModelInvoker`]
//! consumes an instruction, messages, and tool schemas and produces text,
//! an optional tool call, and token counts; where those come from is the
//! embedding platform's business. Tests plug in scripted invokers the same
//! way.
//!
//! Model identifiers with a provider prefix (`anthropic/claude-…`,
//! `openai/gpt-…`) are served through [`CrossProviderAdapter`], which
//! normalizes generation parameters to the target provider's accepted
//! ranges before delegating. Identifiers without a prefix go to the
//! platform's native [`ModelProvider`] factory unchanged.

use crate::agentflow::tool_protocol::ToolMetadata;
use async_trait::async_trait;
use serde_json::Value;
use std::error::Error;
use std::sync::Arc;

/// Token accounting for one model call.
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub cached_tokens: usize,
    pub total_tokens: usize,
}

/// Per-agent generation settings.
#[derive(Debug, Clone, Default)]
pub struct GenerationConfig {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
}

/// One message of a model conversation.
#[derive(Debug, Clone)]
pub struct ModelMessage {
    /// `user`, `assistant`, or `tool`.
    pub role: String,
    pub text: String,
}

impl ModelMessage {
    pub fn new(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            text: text.into(),
        }
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub name: String,
    pub params: Value,
}

/// Everything an invoker needs for one round-trip.
#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    /// System instruction, already template-resolved.
    pub instruction: String,
    /// Conversation turns, oldest first.
    pub messages: Vec<ModelMessage>,
    /// Tool schemas offered for native function calling.
    pub tools: Vec<ToolMetadata>,
    pub generation: GenerationConfig,
    /// Structured-output constraint the response must satisfy.
    pub output_schema: Option<Value>,
    /// Request model-native planning (set by the `built_in` planner).
    pub thinking: bool,
}

/// The invoker's answer.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub text: String,
    /// Present when the model chose to call a tool instead of answering.
    pub tool_call: Option<ToolCallRequest>,
    pub usage: Option<TokenUsage>,
}

/// Trait-driven abstraction over a concrete model backend.
///
/// Implementations must be thread-safe so one invoker can serve
/// concurrent invocations; the invoker itself is stateless between calls.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn invoke(
        &self,
        request: ModelRequest,
    ) -> Result<ModelResponse, Box<dyn Error + Send + Sync>>;

    /// Identifier used to select the upstream model.
    fn model_name(&self) -> &str;
}

/// Factory for native invokers, supplied by the embedding platform.
pub trait ModelProvider: Send + Sync {
    /// Build an invoker for a bare (unprefixed) model identifier.
    fn native(
        &self,
        model_id: &str,
    ) -> Result<Arc<dyn ModelInvoker>, Box<dyn Error + Send + Sync>>;
}

/// Resolve a model identifier into an invoker.
///
/// `provider/model` identifiers wrap the native invoker for `model` in a
/// [`CrossProviderAdapter`] keyed by `provider`; anything else is native.
pub fn resolve_model(
    provider: &dyn ModelProvider,
    model_id: &str,
) -> Result<Arc<dyn ModelInvoker>, Box<dyn Error + Send + Sync>> {
    match model_id.split_once('/') {
        Some((prefix, rest)) if !prefix.is_empty() && !rest.is_empty() => {
            let inner = provider.native(rest)?;
            Ok(Arc::new(CrossProviderAdapter::new(
                inner,
                prefix,
                model_id,
            )))
        }
        _ => provider.native(model_id),
    }
}

/// Wraps a native invoker to serve a prefixed, cross-provider model id.
///
/// The adapter's job is parameter hygiene: each provider accepts a
/// different generation-parameter surface, and sending an unsupported
/// knob is a hard request error on some of them.
pub struct CrossProviderAdapter {
    inner: Arc<dyn ModelInvoker>,
    provider: String,
    model_id: String,
}

impl CrossProviderAdapter {
    pub fn new(
        inner: Arc<dyn ModelInvoker>,
        provider: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            provider: provider.into(),
            model_id: model_id.into(),
        }
    }

    /// Clamp/drop generation parameters per provider family.
    fn normalize(&self, generation: &mut GenerationConfig) {
        match self.provider.as_str() {
            "openai" => {
                // temperature range 0..=2; top_k is not part of the API
                if let Some(t) = generation.temperature.as_mut() {
                    *t = t.max(0.0).min(2.0);
                }
                generation.top_k = None;
            }
            "anthropic" => {
                // temperature range 0..=1; max_tokens is mandatory
                if let Some(t) = generation.temperature.as_mut() {
                    *t = t.max(0.0).min(1.0);
                }
                if generation.max_tokens.is_none() {
                    generation.max_tokens = Some(1024);
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl ModelInvoker for CrossProviderAdapter {
    async fn invoke(
        &self,
        mut request: ModelRequest,
    ) -> Result<ModelResponse, Box<dyn Error + Send + Sync>> {
        self.normalize(&mut request.generation);
        self.inner.invoke(request).await
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoInvoker {
        name: String,
    }

    #[async_trait]
    impl ModelInvoker for EchoInvoker {
        async fn invoke(
            &self,
            request: ModelRequest,
        ) -> Result<ModelResponse, Box<dyn Error + Send + Sync>> {
            Ok(ModelResponse {
                text: format!(
                    "temp={:?} top_k={:?} max={:?}",
                    request.generation.temperature,
                    request.generation.top_k,
                    request.generation.max_tokens
                ),
                tool_call: None,
                usage: None,
            })
        }

        fn model_name(&self) -> &str {
            &self.name
        }
    }

    struct EchoProvider;

    impl ModelProvider for EchoProvider {
        fn native(
            &self,
            model_id: &str,
        ) -> Result<Arc<dyn ModelInvoker>, Box<dyn Error + Send + Sync>> {
            Ok(Arc::new(EchoInvoker {
                name: model_id.to_string(),
            }))
        }
    }

    #[test]
    fn bare_model_id_is_native() {
        let invoker = resolve_model(&EchoProvider, "gemini-2.0-flash").unwrap();
        assert_eq!(invoker.model_name(), "gemini-2.0-flash");
    }

    #[test]
    fn prefixed_model_id_gets_the_adapter() {
        let invoker = resolve_model(&EchoProvider, "anthropic/claude-sonnet").unwrap();
        assert_eq!(invoker.model_name(), "anthropic/claude-sonnet");
    }

    #[tokio::test]
    async fn openai_adapter_drops_top_k_and_clamps_temperature() {
        let invoker = resolve_model(&EchoProvider, "openai/gpt-4o").unwrap();
        let mut request = ModelRequest::default();
        request.generation.temperature = Some(3.5);
        request.generation.top_k = Some(40);
        let response = invoker.invoke(request).await.unwrap();
        assert!(response.text.contains("temp=Some(2.0)"));
        assert!(response.text.contains("top_k=None"));
    }

    #[tokio::test]
    async fn anthropic_adapter_defaults_max_tokens() {
        let invoker = resolve_model(&EchoProvider, "anthropic/claude-sonnet").unwrap();
        let response = invoker.invoke(ModelRequest::default()).await.unwrap();
        assert!(response.text.contains("max=Some(1024)"));
    }
}
