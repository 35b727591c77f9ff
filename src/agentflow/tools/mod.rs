//! Bundled custom tools.
//!
//! These register themselves into the [`ToolRegistry`](crate::agentflow::tool_registry::ToolRegistry)
//! during `discover()`. Workflow authors reference them by name from
//! `tools:` lists on model agents or as the `tool:` of a tool agent.
//!
//! # Available Tools
//!
//! - **http_fetch**: SSRF-guarded HTTP client for REST lookups
//!   - GET and POST with JSON payloads and custom headers
//!   - Hard-coded deny-list for loopback/link-local/private destinations,
//!     with an explicit `allow_private` opt-out for lab setups
//!   - Streamed response reading with a size cap

pub mod http_fetch;

pub use http_fetch::HttpFetchTool;

use crate::agentflow::tool_protocol::Tool;
use std::sync::Arc;

/// Every bundled custom tool, in registration order.
pub fn bundled() -> Vec<Arc<dyn Tool>> {
    vec![Arc::new(HttpFetchTool::new())]
}
