//! Intent lifecycle state machine
//!
//! ```text
//! proposed → classified
//! classified → awaiting_approval | approved
//! awaiting_approval → approved | rejected | canceled
//! approved → running | canceled
//! running → completed | failed | blocked | waiting_for_input
//! blocked → running | canceled
//! waiting_for_input → running | canceled
//! ```
//!
//! Terminals: `completed`, `failed`, `rejected`, `canceled`.

use super::model::IntentState;
use super::IntentError;

/// The set of states reachable from `state` in one transition.
pub fn valid_transitions(state: IntentState) -> &'static [IntentState] {
    use IntentState::*;
    match state {
        Proposed => &[Classified],
        Classified => &[AwaitingApproval, Approved],
        AwaitingApproval => &[Approved, Rejected, Canceled],
        Approved => &[Running, Canceled],
        Running => &[Completed, Failed, Blocked, WaitingForInput],
        Blocked => &[Running, Canceled],
        WaitingForInput => &[Running, Canceled],
        Completed | Failed | Rejected | Canceled => &[],
    }
}

/// Whether `from → to` is a legal transition.
pub fn can_transition(from: IntentState, to: IntentState) -> bool {
    valid_transitions(from).contains(&to)
}

/// Validate a transition, surfacing the offending edge on failure.
pub fn check(from: IntentState, to: IntentState) -> Result<(), IntentError> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(IntentError::InvalidTransition { from, to })
    }
}
