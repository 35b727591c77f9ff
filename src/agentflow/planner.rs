//! Planners shape how a model agent approaches a single turn.
//!
//! Two planners are available, selected per model agent (or forced by the
//! `react` orchestration mode):
//!
//! - [`Planner::PlanReact`] prepends a plan-then-act protocol to the
//!   instruction. The model is asked to structure its output into tagged
//!   sections; [`extract_final_answer`] recovers the answer section when
//!   recording the agent's output.
//! - [`Planner::BuiltIn`] requests the invoker's native planning
//!   ("thinking") channel and leaves the instruction untouched.
//!
//! Absence of a planner leaves the request as-is.

use crate::agentflow::model::ModelRequest;
use crate::agentflow::workflow::PlannerChoice;

/// Section tag opening the planning block.
pub const PLANNING_TAG: &str = "/*PLANNING*/";
/// Section tag opening an action block.
pub const ACTION_TAG: &str = "/*ACTION*/";
/// Section tag opening a reasoning block.
pub const REASONING_TAG: &str = "/*REASONING*/";
/// Section tag opening the final answer block.
pub const FINAL_ANSWER_TAG: &str = "/*FINAL_ANSWER*/";

/// Protocol preamble injected by the plan-react planner.
const PLAN_REACT_PREAMBLE: &str = "\
Answer by planning first and acting second, using these tagged sections:\n\
/*PLANNING*/ lay out the steps needed to fulfil the request.\n\
/*ACTION*/ carry out one step, calling a tool if one applies.\n\
/*REASONING*/ reflect on the result and revise the plan if needed.\n\
Repeat ACTION/REASONING until the plan is complete, then finish with:\n\
/*FINAL_ANSWER*/ the answer alone, with no other sections.\n";

/// A resolved planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Planner {
    PlanReact,
    BuiltIn,
}

impl Planner {
    /// Map the declarative choice to a planner; `None` means none.
    pub fn from_choice(choice: Option<PlannerChoice>) -> Option<Planner> {
        match choice {
            Some(PlannerChoice::PlanReact) => Some(Planner::PlanReact),
            Some(PlannerChoice::BuiltIn) => Some(Planner::BuiltIn),
            None => None,
        }
    }

    /// Apply the planner to an outgoing request.
    pub fn apply(&self, request: &mut ModelRequest) {
        match self {
            Planner::PlanReact => {
                request.instruction = if request.instruction.is_empty() {
                    PLAN_REACT_PREAMBLE.to_string()
                } else {
                    format!("{}\n\n{}", PLAN_REACT_PREAMBLE, request.instruction)
                };
            }
            Planner::BuiltIn => {
                request.thinking = true;
            }
        }
    }
}

/// Recover the final-answer section from a plan-react response.
///
/// Falls back to the whole text when the model did not use the protocol,
/// so a planner never turns a usable answer into an empty one.
pub fn extract_final_answer(text: &str) -> &str {
    match text.rfind(FINAL_ANSWER_TAG) {
        Some(pos) => text[pos + FINAL_ANSWER_TAG.len()..].trim(),
        None => text.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_react_prepends_protocol() {
        let mut request = ModelRequest::default();
        request.instruction = "Summarize the report.".to_string();
        Planner::PlanReact.apply(&mut request);
        assert!(request.instruction.starts_with("Answer by planning first"));
        assert!(request.instruction.ends_with("Summarize the report."));
        assert!(!request.thinking);
    }

    #[test]
    fn built_in_requests_thinking() {
        let mut request = ModelRequest::default();
        Planner::BuiltIn.apply(&mut request);
        assert!(request.thinking);
        assert!(request.instruction.is_empty());
    }

    #[test]
    fn extracts_final_answer_section() {
        let text = format!(
            "{} step 1 {} do it {} looks right {} 42",
            PLANNING_TAG, ACTION_TAG, REASONING_TAG, FINAL_ANSWER_TAG
        );
        assert_eq!(extract_final_answer(&text), "42");
        assert_eq!(extract_final_answer("plain answer"), "plain answer");
    }
}
