//! Feedback events
//!
//! Outcome events sent to the external feedback/memory store. The store is
//! opaque to the pipeline; the only thing read back is an optional initial
//! safety score seed.

use crate::types::{Issue, ProposalId, Stage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened at a decision point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackOutcome {
    AutoApproved,
    Approved,
    Rejected,
    SandboxPassed,
    SandboxFailed,
    TamperBlocked,
    Committed,
    RolledBack,
}

/// One outcome event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackEvent {
    pub proposal_id: ProposalId,
    pub stage: Stage,
    pub outcome: FeedbackOutcome,
    pub timestamp: DateTime<Utc>,
    /// Whether the store may learn from this outcome
    pub learnable: bool,
    /// Set when the safeguard caught tampering; never learnable
    pub circumvention_attempt: bool,
}

impl FeedbackEvent {
    /// Ordinary, learnable outcome
    #[must_use]
    pub fn outcome(proposal_id: ProposalId, stage: Stage, outcome: FeedbackOutcome) -> Self {
        Self {
            proposal_id,
            stage,
            outcome,
            timestamp: Utc::now(),
            learnable: true,
            circumvention_attempt: false,
        }
    }

    /// Tamper incident caught by the safeguard
    #[must_use]
    pub fn circumvention(proposal_id: ProposalId) -> Self {
        Self {
            proposal_id,
            stage: Stage::Safeguard,
            outcome: FeedbackOutcome::TamperBlocked,
            timestamp: Utc::now(),
            learnable: false,
            circumvention_attempt: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("feedback sink failed: {0}")]
pub struct FeedbackError(pub String);

/// External feedback/memory store
#[async_trait]
pub trait FeedbackSink: Send + Sync {
    /// # Errors
    /// Delivery failures are logged by the pipeline and never change a
    /// proposal's outcome
    async fn emit(&self, event: FeedbackEvent) -> Result<(), FeedbackError>;

    /// Initial safety score for a proposal built from `issue`
    fn seed(&self, _issue: &Issue) -> Option<u8> {
        None
    }
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NullFeedback;

#[async_trait]
impl FeedbackSink for NullFeedback {
    async fn emit(&self, _event: FeedbackEvent) -> Result<(), FeedbackError> {
        Ok(())
    }
}
