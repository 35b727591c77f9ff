// src/lib.rs

// Import the top-level `agentflow` module.
pub mod agentflow;

// Re-exporting key items for easier external access.
pub use agentflow::agent::{Agent, AgentOutcome, InvocationContext};
pub use agentflow::event::{Event, EventActions, Part};
pub use agentflow::hydrator::{HydratedWorkflow, Hydrator};
pub use agentflow::model::{ModelInvoker, ModelProvider, ModelRequest, ModelResponse, TokenUsage};
pub use agentflow::runner::{Driver, RunResult, Runner};
pub use agentflow::workflow::WorkflowDefinition;
