//! FixGuard Core - safe application of automated code fixes
//!
//! Every AI-generated fix passes through the same gates before it may touch
//! the workspace:
//! - Threat classification into a risk tier and safety score
//! - Auto-approval for cosmetic, high-confidence fixes; human review otherwise
//! - Validation in a network-isolated sandbox copy of the workspace
//! - An emergency safeguard that re-verifies the decision log right before
//!   commit
//! - An all-or-nothing transaction with snapshot rollback
//!
//! # Example
//!
//! ```rust,ignore
//! use fixguard_core::{Issue, Pipeline, PipelineConfig, PipelineContext};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = PipelineContext::builder(PipelineConfig::load(Path::new("fixguard.toml"))?)
//!     .with_reviewer(reviewer)
//!     .build()?;
//! let pipeline = Pipeline::new(ctx);
//!
//! let proposal = pipeline.propose(Issue::replace("LINT-7", "src/app.py", "trailing spaces", fixed))?;
//! let batch = pipeline.process(vec![proposal]).await;
//! println!("{} committed", batch.count(TerminalStatus::Committed));
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

// Core modules
pub mod approval;
pub mod config;
pub mod context;
pub mod error;
pub mod feedback;
pub mod pipeline;
pub mod proposal;
pub mod safeguard;
pub mod state_machine;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod verifier;

// Re-exports for convenience
pub use approval::{
    ApprovalController, ApprovalOutcome, ChannelReviewer, Decision, PolicyReviewer, ReviewError,
    ReviewRequest, Reviewer, Verdict,
};
pub use config::{ConfigError, LockConfig, PipelineConfig, PostApplyConfig};
pub use context::{ContextBuilder, PipelineContext};
pub use error::PipelineError;
pub use feedback::{FeedbackError, FeedbackEvent, FeedbackOutcome, FeedbackSink, NullFeedback};
pub use pipeline::{BatchReport, Pipeline, ProposalReport, RollbackStatus};
pub use proposal::{
    DecisionEntry, DecisionLog, EntryDetail, FixProposal, LogIntegrityError, Outcome,
    ProposalBuilder, ProposalError,
};
pub use safeguard::{Clearance, EmergencySafeguard, FailedCheck, SafeguardCheck, TamperIncident};
pub use state_machine::{allowed_transitions, validate_transition, StateMachineError};
pub use store::{AuditLog, AuditRecord, ProposalStore, StoreError};
pub use types::{
    Issue, IssueFile, ProposalId, ProposalState, Stage, SuggestedPatch, TerminalStatus,
};
pub use verifier::CommandVerifier;

pub use fixguard_classifier::RiskTier;
pub use fixguard_sandbox::{CancellationToken, SandboxPolicy, ValidationCommand};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving a FixGuard pipeline
    pub use crate::{
        BatchReport, Decision, FixProposal, Issue, Pipeline, PipelineConfig, PipelineContext,
        PipelineError, ProposalId, ProposalReport, ProposalState, Reviewer, TerminalStatus,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
