//! Named tool registry with a fixed built-in catalog.
//!
//! Custom tools self-register during [`ToolRegistry::discover`]: the
//! bundled tool modules contribute their registrations there, and the
//! embedding platform can add its own with [`ToolRegistry::register`]
//! before boot completes. Resolution prefers a custom registration and
//! falls back to the built-in catalog; unknown names fail with
//! [`ToolError::NotFound`].
//!
//! Duplicate registrations overwrite silently (last registration wins,
//! deterministically by registration order). The registry is shared
//! read-only after boot: the hydrator holds it behind an `Arc` and no
//! writes happen once workflows are being served.

use crate::agentflow::tool_protocol::{
    FnTool, PassthroughTool, Tool, ToolError, ToolMetadata,
};
use crate::agentflow::tools;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of tools addressable by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    discovered: bool,
}

impl ToolRegistry {
    /// An empty registry. Call [`discover`](ToolRegistry::discover) to
    /// pull in the bundled custom tools.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its metadata name. Overwrites silently on
    /// duplicates; rejects empty names.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.metadata().name.clone();
        if name.trim().is_empty() {
            return Err(ToolError::InvalidName);
        }
        if self.tools.insert(name.clone(), tool).is_some() {
            log::debug!("tool '{}' re-registered (last registration wins)", name);
        }
        Ok(())
    }

    /// One-time scan that registers every bundled custom tool. Calling it
    /// again is a no-op.
    pub fn discover(&mut self) {
        if self.discovered {
            return;
        }
        self.discovered = true;
        for tool in tools::bundled() {
            // Bundled tools all carry non-empty names.
            let _ = self.register(tool);
        }
        log::info!("tool registry discovered {} bundled tools", self.tools.len());
    }

    /// Resolve names into invocables: custom registration first, then the
    /// built-in catalog.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<Arc<dyn Tool>>, ToolError> {
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            if let Some(tool) = self.tools.get(name) {
                out.push(tool.clone());
            } else if let Some(tool) = builtin(name) {
                out.push(tool);
            } else {
                return Err(ToolError::NotFound(name.clone()));
            }
        }
        Ok(out)
    }

    /// Resolve a single name.
    pub fn resolve_one(&self, name: &str) -> Result<Arc<dyn Tool>, ToolError> {
        let names = [name.to_string()];
        Ok(self.resolve(&names)?.remove(0))
    }

    /// Metadata of every addressable tool (custom registrations plus the
    /// built-in catalog), sorted by name. Used by CLI listing and A2A
    /// surfaces.
    pub fn metadata(&self) -> Vec<ToolMetadata> {
        let mut seen: HashMap<String, ToolMetadata> = self
            .tools
            .values()
            .map(|t| (t.metadata().name.clone(), t.metadata().clone()))
            .collect();
        for name in BUILTIN_NAMES {
            if !seen.contains_key(*name) {
                if let Some(tool) = builtin(name) {
                    seen.insert(tool.metadata().name.clone(), tool.metadata().clone());
                }
            }
        }
        let mut out: Vec<ToolMetadata> = seen.into_iter().map(|(_, m)| m).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

/// Names in the fixed, non-extensible built-in catalog.
pub const BUILTIN_NAMES: &[&str] = &["exit_loop", "google_search", "load_memory"];

/// Construct a built-in tool by name.
///
/// `exit_loop` sets the loop-termination flag on the shared action
/// context; the rest are opaque passthroughs the model invoker may offer
/// natively.
pub fn builtin(name: &str) -> Option<Arc<dyn Tool>> {
    match name {
        "exit_loop" => Some(Arc::new(FnTool::new(
            ToolMetadata::new(
                "exit_loop",
                "Terminate the enclosing loop after the current iteration.",
            ),
            |ctx, _params| {
                Box::pin(async move {
                    ctx.signals.request_exit_loop();
                    json!({ "status": "loop exit requested" })
                })
            },
        ))),
        "google_search" => Some(Arc::new(PassthroughTool::new(
            "google_search",
            "Provider-hosted web search, executed natively by the model invoker.",
        ))),
        "load_memory" => Some(Arc::new(PassthroughTool::new(
            "load_memory",
            "Recall entries from the long-term memory service.",
        ))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentflow::event::ActionSignals;
    use crate::agentflow::session::SessionState;
    use crate::agentflow::tool_protocol::ToolContext;

    #[test]
    fn resolve_prefers_custom_over_builtin() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(FnTool::new(
                ToolMetadata::new("exit_loop", "Custom override"),
                |_ctx, _p| Box::pin(async { json!({"custom": true}) }),
            )))
            .unwrap();

        let resolved = registry.resolve_one("exit_loop").unwrap();
        assert_eq!(resolved.metadata().description, "Custom override");
    }

    #[test]
    fn unknown_name_fails() {
        let registry = ToolRegistry::new();
        match registry.resolve(&["nope".to_string()]) {
            Err(ToolError::NotFound(name)) => assert_eq!(name, "nope"),
            other => panic!("expected NotFound, got {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn last_registration_wins() {
        let mut registry = ToolRegistry::new();
        for description in ["first", "second"] {
            registry
                .register(Arc::new(FnTool::new(
                    ToolMetadata::new("dup", description),
                    |_ctx, _p| Box::pin(async { json!({}) }),
                )))
                .unwrap();
        }
        assert_eq!(registry.resolve_one("dup").unwrap().metadata().description, "second");
    }

    #[test]
    fn discover_is_idempotent() {
        let mut registry = ToolRegistry::new();
        registry.discover();
        let count = registry.metadata().len();
        registry.discover();
        assert_eq!(registry.metadata().len(), count);
    }

    #[tokio::test]
    async fn exit_loop_builtin_raises_the_signal() {
        let tool = builtin("exit_loop").unwrap();
        let signals = Arc::new(ActionSignals::new());
        let ctx = ToolContext::new("inv", SessionState::new(), signals.clone());
        tool.execute(&ctx, json!({})).await;
        assert!(signals.exit_requested());
    }
}
