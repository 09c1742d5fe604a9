//! Fix proposals and their decision log
//!
//! The decision log is append-only and hash-chained with SHA-256: each
//! entry commits to its predecessor, and the first entry to the proposal
//! id, so an entry edited, removed or transplanted from another proposal
//! breaks [`DecisionLog::verify_integrity`].

use crate::state_machine::{validate_transition, StateMachineError};
use crate::types::{Issue, ProposalId, ProposalState, Stage, SuggestedPatch, TerminalStatus};
use chrono::{DateTime, Utc};
use fixguard_artifact::{
    ContentHash, FilePatch, PatchError, PatchSet, PathError, TargetPath,
};
use fixguard_classifier::RiskTier;
use fixguard_transaction::TransactionEvent;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// What a decision entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Created,
    Classified,
    AutoApproved,
    ReviewRequested,
    /// Reviewer replaced the patch; carries its re-classification
    Modified,
    Approved,
    Rejected,
    ValidationStarted,
    SandboxPassed,
    SandboxFailed,
    Cleared,
    TamperBlocked,
    /// File-set lock not granted; proposal requeued
    LockTimeout,
    ApplyStarted,
    /// Step inside a transaction (write, verification, restore)
    TransactionStep,
    Committed,
    RolledBack,
    RollbackFailed,
}

impl Outcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Classified => "classified",
            Self::AutoApproved => "auto_approved",
            Self::ReviewRequested => "review_requested",
            Self::Modified => "modified",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::ValidationStarted => "validation_started",
            Self::SandboxPassed => "sandbox_passed",
            Self::SandboxFailed => "sandbox_failed",
            Self::Cleared => "cleared",
            Self::TamperBlocked => "tamper_blocked",
            Self::LockTimeout => "lock_timeout",
            Self::ApplyStarted => "apply_started",
            Self::TransactionStep => "transaction_step",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::RollbackFailed => "rollback_failed",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage data the emergency safeguard replays
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryDetail {
    /// Score the proposal started from; every classification folds into it
    Creation {
        safety_seed: u8,
    },
    Classification {
        risk_tier: RiskTier,
        safety_score: u8,
        matched: Vec<String>,
        critical_match: bool,
        fail_closed: bool,
    },
    Approval {
        patch_digest: ContentHash,
        sequence: u64,
        automatic: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reviewer: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
    },
    Sandbox {
        resolved_digest: ContentHash,
        /// Base content each file was resolved against (`None` = absent)
        bases: Vec<(TargetPath, Option<ContentHash>)>,
        commands: usize,
        violations: Vec<String>,
        wall_clock_ms: u64,
    },
    Clearance {
        resolved_digest: ContentHash,
        risk_tier: RiskTier,
        safety_score: u8,
    },
    Tamper {
        failed_checks: Vec<String>,
    },
    Transaction {
        event: TransactionEvent,
    },
    Rollback {
        files: Vec<TargetPath>,
    },
}

/// One audit record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionEntry {
    pub sequence: u64,
    pub stage: Stage,
    pub outcome: Outcome,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<EntryDetail>,
    /// Hex SHA-256 of the previous entry (or of the proposal id)
    pub prev_hash: String,
    pub hash: String,
}

/// Decision log integrity failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("decision log broken at entry {index}: {reason}")]
pub struct LogIntegrityError {
    pub index: usize,
    pub reason: &'static str,
}

/// Append-only, hash-chained audit trail of one proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionLog {
    proposal_id: ProposalId,
    entries: Vec<DecisionEntry>,
}

impl DecisionLog {
    #[must_use]
    pub fn new(proposal_id: ProposalId) -> Self {
        Self {
            proposal_id,
            entries: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn proposal_id(&self) -> ProposalId {
        self.proposal_id
    }

    /// Append an entry, chaining it to the previous one
    pub fn append(
        &mut self,
        stage: Stage,
        outcome: Outcome,
        reason: impl Into<String>,
        detail: Option<EntryDetail>,
    ) -> &DecisionEntry {
        let prev_hash = self
            .entries
            .last()
            .map_or_else(|| genesis(self.proposal_id), |e| e.hash.clone());
        let mut entry = DecisionEntry {
            sequence: self.entries.len() as u64,
            stage,
            outcome,
            timestamp: Utc::now(),
            reason: reason.into(),
            detail,
            prev_hash,
            hash: String::new(),
        };
        entry.hash = compute_hash(&entry);
        self.entries.push(entry);
        &self.entries[self.entries.len() - 1]
    }

    #[inline]
    #[must_use]
    pub fn entries(&self) -> &[DecisionEntry] {
        &self.entries
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn last(&self) -> Option<&DecisionEntry> {
        self.entries.last()
    }

    /// Most recent entry with `outcome`
    #[must_use]
    pub fn last_of(&self, outcome: Outcome) -> Option<&DecisionEntry> {
        self.entries.iter().rev().find(|e| e.outcome == outcome)
    }

    /// Recompute every link of the chain
    ///
    /// # Errors
    /// Returns the first entry whose sequence, link or hash is wrong
    pub fn verify_integrity(&self) -> Result<(), LogIntegrityError> {
        let mut prev = genesis(self.proposal_id);
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.sequence != index as u64 {
                return Err(LogIntegrityError { index, reason: "sequence gap" });
            }
            if entry.prev_hash != prev {
                return Err(LogIntegrityError { index, reason: "broken link" });
            }
            if entry.hash != compute_hash(entry) {
                return Err(LogIntegrityError { index, reason: "hash mismatch" });
            }
            prev.clone_from(&entry.hash);
        }
        Ok(())
    }
}

fn genesis(proposal_id: ProposalId) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"fixguard-decision-log");
    hasher.update(proposal_id.0.to_bytes());
    hex::encode(hasher.finalize())
}

fn compute_hash(entry: &DecisionEntry) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entry.sequence.to_le_bytes());
    hasher.update(entry.stage.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(entry.outcome.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(entry.timestamp.to_rfc3339().as_bytes());
    hasher.update([0]);
    hasher.update(entry.reason.as_bytes());
    hasher.update([0]);
    if let Some(detail) = &entry.detail {
        // Field order is fixed by the type, so the encoding is stable
        hasher.update(serde_json::to_vec(detail).unwrap_or_default());
    }
    hasher.update([0]);
    hasher.update(entry.prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// The unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixProposal {
    pub id: ProposalId,
    /// Ordered, non-empty; equals the patch set's targets
    pub target_files: Vec<TargetPath>,
    pub patch: PatchSet,
    /// Opaque reference to the originating issue
    pub source_issue_ref: String,
    pub safety_score: u8,
    /// Unset until classified; never lowered afterwards
    pub risk_tier: Option<RiskTier>,
    pub state: ProposalState,
    pub decision_log: DecisionLog,
    /// Log entries already written to the audit log
    #[serde(skip)]
    pub(crate) audited: usize,
}

impl FixProposal {
    /// Fresh proposal in `CREATED`
    ///
    /// # Errors
    /// Returns [`ProposalError`] if the patch is empty or the seed is out of
    /// range
    pub fn new(
        patch: PatchSet,
        source_issue_ref: impl Into<String>,
        safety_seed: u8,
    ) -> Result<Self, ProposalError> {
        if patch.is_empty() {
            return Err(ProposalError::NoTargets);
        }
        if safety_seed > 100 {
            return Err(ProposalError::SeedOutOfRange(safety_seed));
        }
        let id = ProposalId::new();
        let source_issue_ref = source_issue_ref.into();
        let mut decision_log = DecisionLog::new(id);
        decision_log.append(
            Stage::Builder,
            Outcome::Created,
            format!("proposal built from {source_issue_ref}"),
            Some(EntryDetail::Creation { safety_seed }),
        );
        Ok(Self {
            id,
            target_files: patch.targets().cloned().collect(),
            patch,
            source_issue_ref,
            safety_score: safety_seed,
            risk_tier: None,
            state: ProposalState::Created,
            decision_log,
            audited: 0,
        })
    }

    /// Move to `to`, recording why
    ///
    /// # Errors
    /// Returns [`StateMachineError::IllegalTransition`]; nothing is recorded
    /// then
    pub fn transition(
        &mut self,
        to: ProposalState,
        stage: Stage,
        outcome: Outcome,
        reason: impl Into<String>,
        detail: Option<EntryDetail>,
    ) -> Result<(), StateMachineError> {
        validate_transition(self.state, to)?;
        self.state = to;
        self.decision_log.append(stage, outcome, reason, detail);
        Ok(())
    }

    /// Record an entry without changing state
    pub fn record(
        &mut self,
        stage: Stage,
        outcome: Outcome,
        reason: impl Into<String>,
        detail: Option<EntryDetail>,
    ) {
        self.decision_log.append(stage, outcome, reason, detail);
    }

    #[inline]
    #[must_use]
    pub fn terminal_status(&self) -> Option<TerminalStatus> {
        self.state.terminal_status()
    }

    /// Score recorded at creation; 0 when the creation entry lacks one
    #[must_use]
    pub fn safety_seed(&self) -> u8 {
        match self.decision_log.entries().first().and_then(|e| e.detail.as_ref()) {
            Some(EntryDetail::Creation { safety_seed }) => *safety_seed,
            _ => 0,
        }
    }

    /// Latest approval: `(patch digest, sequence, automatic)`
    #[must_use]
    pub fn approval(&self) -> Option<(ContentHash, u64, bool)> {
        self.decision_log.entries().iter().rev().find_map(|e| match &e.detail {
            Some(EntryDetail::Approval {
                patch_digest,
                sequence,
                automatic,
                ..
            }) => Some((*patch_digest, *sequence, *automatic)),
            _ => None,
        })
    }

    /// Whether any classification ever recorded a CRITICAL pattern match
    #[must_use]
    pub fn had_critical_match(&self) -> bool {
        self.decision_log.entries().iter().any(|e| {
            matches!(
                e.detail,
                Some(EntryDetail::Classification {
                    critical_match: true,
                    ..
                })
            )
        })
    }

    /// Whether the patch targets equal `target_files`
    #[must_use]
    pub fn targets_consistent(&self) -> bool {
        self.patch.targets().eq(self.target_files.iter())
    }

    /// Reason attached to the most recent entry
    #[must_use]
    pub fn last_reason(&self) -> &str {
        self.decision_log.last().map_or("", |e| e.reason.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProposalError {
    #[error("proposal has no target files")]
    NoTargets,

    #[error("invalid target path {path:?}: {source}")]
    InvalidPath {
        path: String,
        #[source]
        source: PathError,
    },

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error("safety seed {0} is outside 0..=100")]
    SeedOutOfRange(u8),
}

/// Builds proposals from issues
#[derive(Debug, Clone)]
pub struct ProposalBuilder {
    issue: Issue,
    feedback_seed: Option<u8>,
    default_seed: u8,
}

impl ProposalBuilder {
    #[must_use]
    pub fn from_issue(issue: Issue) -> Self {
        Self {
            issue,
            feedback_seed: None,
            default_seed: 80,
        }
    }

    /// Seed supplied by the feedback store (used when the issue has none)
    #[inline]
    #[must_use]
    pub fn with_feedback_seed(mut self, seed: Option<u8>) -> Self {
        self.feedback_seed = seed;
        self
    }

    /// Seed used when neither the issue nor the feedback store has one
    #[inline]
    #[must_use]
    pub fn with_default_seed(mut self, seed: u8) -> Self {
        self.default_seed = seed;
        self
    }

    /// Validate and build
    ///
    /// # Errors
    /// Returns [`ProposalError`] for invalid paths, duplicate targets, empty
    /// patches or an out-of-range seed
    pub fn build(self) -> Result<FixProposal, ProposalError> {
        let Self {
            issue,
            feedback_seed,
            default_seed,
        } = self;

        let mut patches = Vec::with_capacity(1 + issue.files.len());
        patches.push(file_patch(&issue.file, &issue.suggested_patch)?);
        for extra in &issue.files {
            patches.push(file_patch(&extra.path, &extra.patch)?);
        }
        let patch = PatchSet::new(patches)?;

        let seed = issue.confidence.or(feedback_seed).unwrap_or(default_seed);
        FixProposal::new(patch, issue.id, seed)
    }
}

fn file_patch(path: &str, patch: &SuggestedPatch) -> Result<FilePatch, ProposalError> {
    let target = TargetPath::new(path).map_err(|source| ProposalError::InvalidPath {
        path: path.to_string(),
        source,
    })?;
    Ok(match patch {
        SuggestedPatch::Replace { content } => FilePatch::replace(target, content.clone()),
        SuggestedPatch::UnifiedDiff { diff } => FilePatch::diff(target, diff.clone()),
    })
}
