//! Core types for FixGuard
//!
//! Defines the fundamental records of the pipeline:
//! - Proposal identifiers
//! - Issues received from the detection engine
//! - Lifecycle states and terminal statuses
//! - Pipeline stages

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Unique proposal identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProposalId(pub Ulid);

impl ProposalId {
    /// Generate new proposal ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ProposalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProposalId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// Suggested content change for one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SuggestedPatch {
    /// Full replacement content
    Replace { content: String },
    /// Unified diff against the current content
    UnifiedDiff { diff: String },
}

/// Additional file touched by an issue's fix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueFile {
    pub path: String,
    pub patch: SuggestedPatch,
}

/// Issue reported by the external detection engine (read-only input)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    /// Opaque id, carried into the proposal as its source reference
    pub id: String,
    pub file: String,
    pub description: String,
    pub suggested_patch: SuggestedPatch,
    /// Optional initial safety score seed (0-100)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<IssueFile>,
}

impl Issue {
    /// Issue whose fix replaces `file` with `content`
    #[must_use]
    pub fn replace(
        id: impl Into<String>,
        file: impl Into<String>,
        description: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            file: file.into(),
            description: description.into(),
            suggested_patch: SuggestedPatch::Replace {
                content: content.into(),
            },
            confidence: None,
            files: Vec::new(),
        }
    }

    /// Issue whose fix is a unified diff of `file`
    #[must_use]
    pub fn diff(
        id: impl Into<String>,
        file: impl Into<String>,
        description: impl Into<String>,
        diff: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            file: file.into(),
            description: description.into(),
            suggested_patch: SuggestedPatch::UnifiedDiff { diff: diff.into() },
            confidence: None,
            files: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_confidence(mut self, confidence: u8) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Also patch `path`
    #[must_use]
    pub fn with_file(mut self, path: impl Into<String>, patch: SuggestedPatch) -> Self {
        self.files.push(IssueFile {
            path: path.into(),
            patch,
        });
        self
    }
}

/// Proposal lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalState {
    Created,
    Classified,
    AutoApproved,
    PendingReview,
    Approved,
    Rejected,
    Validating,
    SandboxPassed,
    SandboxFailed,
    TamperBlocked,
    Applying,
    Committed,
    RolledBack,
}

impl ProposalState {
    pub const ALL: [Self; 13] = [
        Self::Created,
        Self::Classified,
        Self::AutoApproved,
        Self::PendingReview,
        Self::Approved,
        Self::Rejected,
        Self::Validating,
        Self::SandboxPassed,
        Self::SandboxFailed,
        Self::TamperBlocked,
        Self::Applying,
        Self::Committed,
        Self::RolledBack,
    ];

    /// Terminal status, if this state ends the pipeline
    ///
    /// `Committed` is terminal even though a manual rollback may follow.
    #[must_use]
    pub fn terminal_status(self) -> Option<TerminalStatus> {
        match self {
            Self::Committed => Some(TerminalStatus::Committed),
            Self::Rejected => Some(TerminalStatus::Rejected),
            Self::SandboxFailed => Some(TerminalStatus::SandboxFailed),
            Self::TamperBlocked => Some(TerminalStatus::TamperBlocked),
            Self::RolledBack => Some(TerminalStatus::RolledBack),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self.terminal_status().is_some()
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Classified => "CLASSIFIED",
            Self::AutoApproved => "AUTO_APPROVED",
            Self::PendingReview => "PENDING_REVIEW",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Validating => "VALIDATING",
            Self::SandboxPassed => "SANDBOX_PASSED",
            Self::SandboxFailed => "SANDBOX_FAILED",
            Self::TamperBlocked => "TAMPER_BLOCKED",
            Self::Applying => "APPLYING",
            Self::Committed => "COMMITTED",
            Self::RolledBack => "ROLLED_BACK",
        }
    }
}

impl fmt::Display for ProposalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final status surfaced per proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalStatus {
    Committed,
    Rejected,
    SandboxFailed,
    RolledBack,
    TamperBlocked,
}

impl TerminalStatus {
    #[must_use]
    pub fn state(self) -> ProposalState {
        match self {
            Self::Committed => ProposalState::Committed,
            Self::Rejected => ProposalState::Rejected,
            Self::SandboxFailed => ProposalState::SandboxFailed,
            Self::RolledBack => ProposalState::RolledBack,
            Self::TamperBlocked => ProposalState::TamperBlocked,
        }
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.state().fmt(f)
    }
}

/// Pipeline stage that produced a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Builder,
    Classifier,
    Approval,
    Sandbox,
    Safeguard,
    Transaction,
    /// Operator-triggered actions (manual rollback, crash recovery)
    Operator,
}

impl Stage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Builder => "builder",
            Self::Classifier => "classifier",
            Self::Approval => "approval",
            Self::Sandbox => "sandbox",
            Self::Safeguard => "safeguard",
            Self::Transaction => "transaction",
            Self::Operator => "operator",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proposal_id_round_trips_through_string() {
        let id = ProposalId::new();
        assert_eq!(id.to_string().parse::<ProposalId>().unwrap(), id);
    }

    #[test]
    fn terminal_states_map_both_ways() {
        for state in ProposalState::ALL {
            if let Some(status) = state.terminal_status() {
                assert_eq!(status.state(), state);
            }
        }
        assert!(!ProposalState::Applying.is_terminal());
        assert_eq!(ProposalState::SandboxPassed.to_string(), "SANDBOX_PASSED");
    }

    #[test]
    fn issue_deserializes_with_optional_fields_missing() {
        let json = r#"{
            "id": "ISSUE-7",
            "file": "src/lib.rs",
            "description": "trailing whitespace",
            "suggested_patch": {"kind": "replace", "content": "fn a() {}\n"}
        }"#;
        let issue: Issue = serde_json::from_str(json).unwrap();
        assert_eq!(issue.confidence, None);
        assert!(issue.files.is_empty());
    }
}
