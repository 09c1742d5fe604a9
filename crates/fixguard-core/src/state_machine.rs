//! Proposal state machine
//!
//! Every state change goes through [`validate_transition`]; anything not in
//! [`allowed_transitions`] is an [`StateMachineError::IllegalTransition`].

use crate::types::ProposalState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        from: ProposalState,
        to: ProposalState,
    },
}

/// Validates a state transition.
///
/// # Errors
/// Returns [`StateMachineError::IllegalTransition`] if `to` is not reachable
/// from `from` in one step
pub fn validate_transition(from: ProposalState, to: ProposalState) -> Result<(), StateMachineError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(StateMachineError::IllegalTransition { from, to })
    }
}

#[must_use]
pub fn allowed_transitions(from: ProposalState) -> &'static [ProposalState] {
    use ProposalState::*;
    match from {
        Created => &[Classified],
        Classified => &[AutoApproved, PendingReview],
        PendingReview => &[Approved, Rejected],
        AutoApproved | Approved => &[Validating],
        Validating => &[SandboxPassed, SandboxFailed],
        SandboxPassed => &[Applying, TamperBlocked],
        Applying => &[Committed, RolledBack],
        // Manual rollback
        Committed => &[RolledBack],
        Rejected | SandboxFailed | TamperBlocked | RolledBack => &[],
    }
}
