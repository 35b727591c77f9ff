//! Runner plugins: observational hooks over an invocation's lifecycle.
//!
//! A [`Plugin`] receives callbacks as the runner drives the agent tree.
//! All hooks default to no-ops, so implementations only override what they
//! care about; all hooks are purely observational and must not mutate
//! session state.
//!
//! Plugins are constructed per run from the fixed factory table in
//! [`build_plugins`]. Factory names whose required configuration is absent
//! produce no plugin and are skipped silently, so a workflow can list
//! `bigquery_analytics` unconditionally and only pay for it where the
//! export target is configured.

use crate::agentflow::event::Event;
use crate::agentflow::model::TokenUsage;
use crate::agentflow::workflow::RuntimeConfig;
use async_trait::async_trait;
use std::sync::Arc;

/// Observational hooks over one invocation. One plugin instance belongs
/// to exactly one runner.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Invocation is about to start.
    async fn before_run(&self) {}

    /// A model call completed with the given usage.
    async fn after_model(&self, _model: &str, _usage: &TokenUsage) {}

    /// A tool is about to execute.
    async fn before_tool(&self, _tool_name: &str) {}

    /// An event was emitted by some agent.
    async fn on_event(&self, _event: &Event) {}

    /// Invocation finished (successfully or not).
    async fn after_run(&self) {}
}

/// Coarse progress logging on the `log` crate (`logging` factory).
pub struct LoggingPlugin;

#[async_trait]
impl Plugin for LoggingPlugin {
    fn name(&self) -> &str {
        "logging"
    }

    async fn before_run(&self) {
        log::info!("run started");
    }

    async fn after_model(&self, model: &str, usage: &TokenUsage) {
        log::info!(
            "model call: model={} total_tokens={}",
            model,
            usage.total_tokens
        );
    }

    async fn before_tool(&self, tool_name: &str) {
        log::info!("tool call: {}", tool_name);
    }

    async fn after_run(&self) {
        log::info!("run finished");
    }
}

/// Per-event debug logging (`debug_logging` factory).
pub struct DebugLoggingPlugin;

#[async_trait]
impl Plugin for DebugLoggingPlugin {
    fn name(&self) -> &str {
        "debug_logging"
    }

    async fn on_event(&self, event: &Event) {
        log::debug!(
            "event author={} error={} delta_keys={:?}",
            event.author,
            event.is_error(),
            event.actions.state_delta.keys().collect::<Vec<_>>()
        );
    }
}

/// Factory names with configuration requirements this build does not
/// carry; listing them is allowed and produces no plugin.
const CONFIG_GATED: &[&str] = &[
    "reflect_and_retry",
    "context_filter",
    "save_files_as_artifacts",
    "multimodal_tool_results",
    "bigquery_analytics",
];

/// Instantiate the plugins a workflow requested. Unknown names are logged
/// and skipped; config-gated factories without configuration are skipped
/// silently.
pub fn build_plugins(runtime: &RuntimeConfig) -> Vec<Arc<dyn Plugin>> {
    let mut out: Vec<Arc<dyn Plugin>> = Vec::new();
    for name in &runtime.plugins {
        match name.as_str() {
            "logging" => out.push(Arc::new(LoggingPlugin)),
            "debug_logging" => out.push(Arc::new(DebugLoggingPlugin)),
            gated if CONFIG_GATED.contains(&gated) => {
                log::debug!("plugin '{}' has no configuration; skipped", gated);
            }
            unknown => {
                log::warn!("unknown plugin factory '{}'; skipped", unknown);
            }
        }
    }
    out
}
