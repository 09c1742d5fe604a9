//! Error types for FixGuard core
//!
//! Covers:
//! - Proposal construction and state machine violations
//! - Tampering caught by the emergency safeguard
//! - Apply failures and lock contention
//! - Persistence and configuration

use crate::config::ConfigError;
use crate::proposal::ProposalError;
use crate::safeguard::TamperIncident;
use crate::state_machine::StateMachineError;
use crate::store::StoreError;
use crate::types::{ProposalId, ProposalState, TerminalStatus};
use fixguard_sandbox::SandboxError;
use fixguard_transaction::TransactionError;
use std::time::Duration;

/// Main pipeline error type
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid proposal: {0}")]
    InvalidProposal(#[from] ProposalError),

    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    /// Emergency safeguard mismatch
    #[error(transparent)]
    TamperDetected(Box<TamperIncident>),

    /// I/O or verification failure during commit
    #[error("apply failed for {proposal_id}: {reason}")]
    ApplyFailure {
        proposal_id: ProposalId,
        reason: String,
    },

    /// File-set contention exceeded the configured bound
    #[error("file-set lock not acquired within {waited:?}")]
    LockTimeout { waited: Duration },

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("transaction error: {0}")]
    Transaction(TransactionError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Operation not possible in the proposal's current state
    #[error("proposal {proposal_id} is {state}: {reason}")]
    WrongState {
        proposal_id: ProposalId,
        state: ProposalState,
        reason: &'static str,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl From<TamperIncident> for PipelineError {
    fn from(incident: TamperIncident) -> Self {
        Self::TamperDetected(Box::new(incident))
    }
}

impl From<TransactionError> for PipelineError {
    fn from(error: TransactionError) -> Self {
        match error {
            TransactionError::LockTimeout { waited } => Self::LockTimeout { waited },
            TransactionError::Cancelled => Self::Cancelled,
            other => Self::Transaction(other),
        }
    }
}

impl PipelineError {
    /// Only lock contention is retried automatically
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    /// Status a proposal ends in because of this error, if it is terminal
    #[must_use]
    pub fn terminal_status(&self) -> Option<TerminalStatus> {
        match self {
            Self::TamperDetected(_) => Some(TerminalStatus::TamperBlocked),
            Self::ApplyFailure { .. } => Some(TerminalStatus::RolledBack),
            _ => None,
        }
    }
}
