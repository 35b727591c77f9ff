//! The event/state contract shared by every agent.
//!
//! An [`Event`] is the unit of inter-agent and outward-facing observation.
//! Each leaf agent emits exactly one event per execution: on success the
//! event carries a `state_delta` with the agent's `output_key`, on failure
//! the delta is empty and [`Event::error`] is set. Composite agents emit
//! no events of their own except the terminal error event of the DAG
//! scheduler.
//!
//! [`ActionSignals`] is the per-invocation side channel for flags that
//! flow against the tree structure, currently only the loop-exit signal
//! raised by the `exit_loop` tool.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// One text part of an event's content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    /// Originating role, e.g. `model`, `tool`, `agent`.
    pub role: String,
    /// The text payload.
    pub text: String,
}

/// State changes carried by an event, reconciled into session state at
/// emission time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventActions {
    /// Key -> value writes applied to session state. Empty on error events.
    pub state_delta: HashMap<String, Value>,
}

/// An observation emitted by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Name of the emitting agent.
    pub author: String,
    /// Invocation this event belongs to.
    pub invocation_id: String,
    /// Text parts with their roles.
    pub content: Vec<Part>,
    pub actions: EventActions,
    /// Set on the last event of an invocation.
    pub is_final: bool,
    /// Present on error events; success events leave it `None`.
    pub error: Option<String>,
}

impl Event {
    /// Build a success event whose delta carries the agent's output.
    pub fn success(
        author: impl Into<String>,
        invocation_id: impl Into<String>,
        role: impl Into<String>,
        text: impl Into<String>,
        state_delta: HashMap<String, Value>,
    ) -> Self {
        Self {
            author: author.into(),
            invocation_id: invocation_id.into(),
            content: vec![Part {
                role: role.into(),
                text: text.into(),
            }],
            actions: EventActions { state_delta },
            is_final: false,
            error: None,
        }
    }

    /// Build an error event: non-empty text, empty delta.
    pub fn failure(
        author: impl Into<String>,
        invocation_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        Self {
            author: author.into(),
            invocation_id: invocation_id.into(),
            content: vec![Part {
                role: "agent".to_string(),
                text: message.clone(),
            }],
            actions: EventActions::default(),
            is_final: false,
            error: Some(message),
        }
    }

    /// Mark this event as the last of its invocation.
    pub fn finalized(mut self) -> Self {
        self.is_final = true;
        self
    }

    /// Concatenated text of all parts.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("")
    }

    /// Whether this is an error event.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Per-invocation carrier for cross-cutting signals.
///
/// Owned by the invocation context and shared with tools through the
/// [`ToolContext`](crate::agentflow::tool_protocol::ToolContext). Loop
/// composites poll [`exit_requested`](ActionSignals::exit_requested) after
/// every child and clear it when they stop.
#[derive(Debug, Default)]
pub struct ActionSignals {
    exit_loop: AtomicBool,
}

impl ActionSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raised by the `exit_loop` built-in tool.
    pub fn request_exit_loop(&self) {
        self.exit_loop.store(true, Ordering::SeqCst);
    }

    /// Whether a loop exit has been requested since the last clear.
    pub fn exit_requested(&self) -> bool {
        self.exit_loop.load(Ordering::SeqCst)
    }

    /// Reset the signal; called by the loop that honored it.
    pub fn clear_exit(&self) {
        self.exit_loop.store(false, Ordering::SeqCst);
    }
}
