//! Per-invocation usage metrics.
//!
//! A [`MetricsCollector`] is a [`Plugin`] that accumulates aggregate
//! counters through the runner's hooks and finalizes a [`UsageSummary`]
//! when the run ends. One collector instance is bound to one runner
//! instance; collectors are never shared across invocations; that
//! isolation is what keeps two concurrent runs' token counts from
//! contaminating each other.

use crate::agentflow::event::Event;
use crate::agentflow::model::TokenUsage;
use crate::agentflow::plugin::Plugin;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Mutex;
use std::time::Instant;

/// Aggregate counters for one invocation.
///
/// Always populated in run results; a run that ended early carries the
/// partial counters accumulated up to that point.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageSummary {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub cached_tokens: usize,
    pub total_tokens: usize,
    pub duration_ms: u64,
    /// Number of events observed.
    pub steps: usize,
    pub llm_calls: usize,
    pub tool_calls: usize,
    /// Identifier of the last model that answered, if any.
    pub model: Option<String>,
}

struct CollectorState {
    started: Option<Instant>,
    summary: UsageSummary,
}

/// Observational collector behind the metrics hooks.
pub struct MetricsCollector {
    state: Mutex<CollectorState>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CollectorState {
                started: None,
                summary: UsageSummary::default(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of the counters. The duration is live until `after_run`
    /// stamps it.
    pub fn summary(&self) -> UsageSummary {
        let guard = self.lock();
        let mut summary = guard.summary.clone();
        if summary.duration_ms == 0 {
            if let Some(started) = guard.started {
                summary.duration_ms = started.elapsed().as_millis() as u64;
            }
        }
        summary
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for MetricsCollector {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn before_run(&self) {
        self.lock().started = Some(Instant::now());
    }

    async fn after_model(&self, model: &str, usage: &TokenUsage) {
        let mut guard = self.lock();
        let summary = &mut guard.summary;
        summary.input_tokens += usage.prompt_tokens;
        summary.output_tokens += usage.completion_tokens;
        summary.cached_tokens += usage.cached_tokens;
        summary.total_tokens += usage.total_tokens;
        summary.llm_calls += 1;
        summary.model = Some(model.to_string());
    }

    async fn before_tool(&self, tool_name: &str) {
        self.lock().summary.tool_calls += 1;
        log::info!("tool call: {}", tool_name);
    }

    async fn on_event(&self, _event: &Event) {
        self.lock().summary.steps += 1;
    }

    async fn after_run(&self) {
        let mut guard = self.lock();
        if let Some(started) = guard.started {
            guard.summary.duration_ms = started.elapsed().as_millis() as u64;
        }
        let s = &guard.summary;
        log::info!(
            "run complete: llm_calls={} tool_calls={} steps={} tokens={} duration_ms={}",
            s.llm_calls,
            s.tool_calls,
            s.steps,
            s.total_tokens,
            s.duration_ms
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accumulates_counters() {
        let collector = MetricsCollector::new();
        collector.before_run().await;

        let usage = TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 20,
            cached_tokens: 10,
            total_tokens: 120,
        };
        collector.after_model("gpt-4o-mini", &usage).await;
        collector.after_model("gpt-4o-mini", &usage).await;
        collector.before_tool("http_fetch").await;
        collector
            .on_event(&Event::failure("a", "inv", "boom"))
            .await;
        collector.after_run().await;

        let summary = collector.summary();
        assert_eq!(summary.llm_calls, 2);
        assert_eq!(summary.tool_calls, 1);
        assert_eq!(summary.steps, 1);
        assert_eq!(summary.input_tokens, 200);
        assert_eq!(summary.total_tokens, 240);
        assert_eq!(summary.model.as_deref(), Some("gpt-4o-mini"));
    }

    #[tokio::test]
    async fn collectors_are_independent() {
        let a = MetricsCollector::new();
        let b = MetricsCollector::new();
        a.after_model("m", &TokenUsage {
            prompt_tokens: 1,
            completion_tokens: 1,
            cached_tokens: 0,
            total_tokens: 2,
        })
        .await;
        assert_eq!(a.summary().llm_calls, 1);
        assert_eq!(b.summary().llm_calls, 0);
    }
}
