//! The execution driver: one runner per invocation.
//!
//! A [`Driver`] is created once per hydrated workflow and owns the
//! long-lived services (session, artifact, memory) selected by the
//! workflow's runtime configuration. Every invocation gets a fresh
//! [`Runner`] from [`Driver::build_runner`]: runner construction is cheap
//! object assembly, and the per-run plugin set (notably the
//! [`MetricsCollector`]) keeps per-invocation counters that would be
//! corrupted if two invocations ever shared a runner. Runners are never
//! reused or shared.
//!
//! Session lifecycle: a missing `session_id` creates a new session; a
//! supplied one is reused when present and created otherwise. In both
//! cases the wall-clock keys `current_date`, `current_datetime` and
//! `timezone` are refreshed in session state before any agent executes,
//! so instruction templates and expressions can always rely on them.
//!
//! Failure surface: [`TransportError`] is the only error class that
//! terminates a run without producing an event stream. Agent-level
//! failures stay inside the stream as error events, and the usage summary
//! is populated either way (with partial counters if the run ended early).

use crate::agentflow::agent::{Agent, InvocationContext};
use crate::agentflow::event::Event;
use crate::agentflow::hydrator::HydratedWorkflow;
use crate::agentflow::metrics::{MetricsCollector, UsageSummary};
use crate::agentflow::plugin::{build_plugins, Plugin};
use crate::agentflow::session::{
    build_artifact_service, build_memory_service, build_session_service, ArtifactService,
    MemoryService, Session, SessionService, TransportError,
};
use crate::agentflow::workflow::{ErrorPolicy, RuntimeConfig};
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Event-channel depth; emission backpressures against slow consumers.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// The structured result of a completed run.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Text of the final event; may be empty when the run produced none.
    pub content: String,
    /// Author of the final event, or the root agent's name.
    pub author: String,
    /// Always populated, partial if the run ended early.
    pub usage: UsageSummary,
    pub session_id: String,
}

/// Per-workflow execution driver.
///
/// Holds the workflow's root agent and the services that must outlive
/// individual invocations (session reuse only works if the session store
/// does). Construct once, then mint a runner per invocation.
pub struct Driver {
    root: Arc<Agent>,
    runtime: RuntimeConfig,
    on_error: ErrorPolicy,
    session_service: Arc<dyn SessionService>,
    artifact_service: Option<Arc<dyn ArtifactService>>,
    memory_service: Option<Arc<dyn MemoryService>>,
}

impl Driver {
    /// Assemble the driver for a hydrated workflow. `base_dir` anchors
    /// relative artifact directories.
    pub fn new(workflow: &HydratedWorkflow, base_dir: &Path) -> Result<Self, TransportError> {
        let runtime = workflow.definition.runtime.clone();
        Ok(Self {
            root: workflow.root.clone(),
            session_service: build_session_service(&runtime)?,
            artifact_service: build_artifact_service(&runtime, base_dir)?,
            memory_service: build_memory_service(&runtime),
            on_error: workflow.definition.orchestration.on_error,
            runtime,
        })
    }

    /// Build a fresh runner for one invocation: the shared services plus
    /// a per-run plugin set with its own metrics collector.
    pub fn build_runner(&self) -> Runner {
        let metrics = Arc::new(MetricsCollector::new());
        let mut plugins: Vec<Arc<dyn Plugin>> = build_plugins(&self.runtime);
        plugins.push(metrics.clone());
        Runner {
            root: self.root.clone(),
            session_service: self.session_service.clone(),
            artifact_service: self.artifact_service.clone(),
            memory_service: self.memory_service.clone(),
            plugins,
            metrics,
            on_error: self.on_error,
            timezone: self
                .runtime
                .timezone
                .clone()
                .unwrap_or_else(|| "UTC".to_string()),
        }
    }

    /// Run one message through the workflow and collect the result.
    pub async fn run(
        &self,
        user_id: &str,
        message: &str,
        session_id: Option<&str>,
    ) -> Result<RunResult, TransportError> {
        self.build_runner().run(user_id, message, session_id).await
    }

    /// Same lifecycle as [`run`](Driver::run), but events are yielded to
    /// the caller as they arrive. Dropping the receiver cancels cleanly.
    pub async fn run_streaming(
        &self,
        user_id: &str,
        message: &str,
        session_id: Option<&str>,
    ) -> Result<mpsc::Receiver<Event>, TransportError> {
        self.build_runner()
            .run_streaming(user_id, message, session_id)
            .await
    }

    /// The long-lived memory service, if the workflow opted into one.
    pub fn memory_service(&self) -> Option<&Arc<dyn MemoryService>> {
        self.memory_service.as_ref()
    }
}

/// One invocation's runner: root agent, services, plugins, and a fresh
/// metrics collector. Never shared across invocations.
pub struct Runner {
    root: Arc<Agent>,
    session_service: Arc<dyn SessionService>,
    artifact_service: Option<Arc<dyn ArtifactService>>,
    memory_service: Option<Arc<dyn MemoryService>>,
    plugins: Vec<Arc<dyn Plugin>>,
    metrics: Arc<MetricsCollector>,
    on_error: ErrorPolicy,
    timezone: String,
}

impl Runner {
    /// Drive the agent tree to completion and assemble the result.
    pub async fn run(
        &self,
        user_id: &str,
        message: &str,
        session_id: Option<&str>,
    ) -> Result<RunResult, TransportError> {
        let session = self.resolve_session(user_id, session_id).await?;
        let session_id = session.id.clone();

        for plugin in &self.plugins {
            plugin.before_run().await;
        }

        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let invocation_id = uuid::Uuid::new_v4().to_string();
        let ctx = InvocationContext::new(
            invocation_id,
            session.clone(),
            message,
            self.plugins.clone(),
            tx,
            self.on_error,
        );

        let root = self.root.clone();
        let execute = async move {
            let outcome = root.execute(&ctx).await;
            // Dropping the context closes the event channel.
            drop(ctx);
            outcome
        };
        let collect = async {
            let mut events: Vec<Event> = Vec::new();
            while let Some(event) = rx.recv().await {
                events.push(event);
            }
            events
        };
        let (outcome, mut events) = tokio::join!(execute, collect);
        if let Some(last) = events.last_mut() {
            last.is_final = true;
        }

        for plugin in &self.plugins {
            plugin.after_run().await;
        }
        self.session_service.save(&session).await?;

        log::debug!(
            "run of '{}' finished: outcome={:?} events={}",
            self.root.name(),
            outcome,
            events.len()
        );

        let (content, author) = match events.last() {
            Some(event) => (event.text(), event.author.clone()),
            None => (String::new(), self.root.name().to_string()),
        };
        Ok(RunResult {
            content,
            author,
            usage: self.metrics.summary(),
            session_id,
        })
    }

    /// Stream events to the caller as they arrive. The stream closes when
    /// the run finishes; there is no stream-level error event.
    pub async fn run_streaming(
        self,
        user_id: &str,
        message: &str,
        session_id: Option<&str>,
    ) -> Result<mpsc::Receiver<Event>, TransportError> {
        let session = self.resolve_session(user_id, session_id).await?;

        for plugin in &self.plugins {
            plugin.before_run().await;
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let invocation_id = uuid::Uuid::new_v4().to_string();
        let ctx = InvocationContext::new(
            invocation_id,
            session.clone(),
            message,
            self.plugins.clone(),
            tx,
            self.on_error,
        );

        let root = self.root.clone();
        let plugins = self.plugins.clone();
        let session_service = self.session_service.clone();
        tokio::spawn(async move {
            root.execute(&ctx).await;
            drop(ctx);
            for plugin in &plugins {
                plugin.after_run().await;
            }
            if let Err(e) = session_service.save(&session).await {
                log::error!("failed to persist session after streaming run: {}", e);
            }
        });

        Ok(rx)
    }

    /// Usage counters accumulated so far by this runner's collector.
    pub fn usage(&self) -> UsageSummary {
        self.metrics.summary()
    }

    /// The artifact service, if any.
    pub fn artifact_service(&self) -> Option<&Arc<dyn ArtifactService>> {
        self.artifact_service.as_ref()
    }

    /// The memory service, if any.
    pub fn memory_service(&self) -> Option<&Arc<dyn MemoryService>> {
        self.memory_service.as_ref()
    }

    /// Reuse or create the session, then refresh the wall-clock keys so
    /// they are present before any agent executes.
    async fn resolve_session(
        &self,
        user_id: &str,
        session_id: Option<&str>,
    ) -> Result<Session, TransportError> {
        let session = match session_id {
            Some(id) => match self.session_service.get(user_id, id).await? {
                Some(existing) => existing,
                None => {
                    self.session_service
                        .create(user_id, id, clock_state(&self.timezone))
                        .await?
                }
            },
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                self.session_service
                    .create(user_id, &id, clock_state(&self.timezone))
                    .await?
            }
        };
        // Refresh on reuse: a session that slept overnight should not
        // keep telling agents yesterday's date.
        for (key, value) in clock_state(&self.timezone) {
            session.state.set(key, value).await;
        }
        Ok(session)
    }
}

/// The wall-clock keys injected into every session.
fn clock_state(timezone: &str) -> HashMap<String, Value> {
    let now = Utc::now();
    let mut state = HashMap::new();
    state.insert(
        "current_date".to_string(),
        json!(now.format("%Y-%m-%d").to_string()),
    );
    state.insert(
        "current_datetime".to_string(),
        json!(now.to_rfc3339_opts(SecondsFormat::Secs, true)),
    );
    state.insert("timezone".to_string(), json!(timezone));
    state
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_state_has_the_three_keys() {
        let state = clock_state("America/Bogota");
        assert!(state["current_date"].as_str().unwrap().len() == 10);
        assert!(state["current_datetime"].as_str().unwrap().contains('T'));
        assert_eq!(state["timezone"], json!("America/Bogota"));
    }
}
