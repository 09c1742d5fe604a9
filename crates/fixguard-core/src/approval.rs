//! Approval controller
//!
//! Drives a proposal from `CREATED` to an approval decision:
//!
//! ```text
//! CREATED -> CLASSIFIED -> AUTO_APPROVED
//!                       -> PENDING_REVIEW -> APPROVED | REJECTED
//! ```
//!
//! Auto-approval needs a COSMETIC tier, a score at or above the threshold
//! and no CRITICAL match anywhere in the proposal's history. Everything
//! else waits for a [`Reviewer`]; waiting is bounded and every failure to
//! get an answer rejects the proposal.

use crate::proposal::{EntryDetail, FixProposal, Outcome};
use crate::state_machine::StateMachineError;
use crate::types::{ProposalState, Stage};
use async_trait::async_trait;
use fixguard_artifact::PatchSet;
use fixguard_classifier::{Classification, RiskTier, ThreatClassifier};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reviewer's verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Approve,
    Reject,
    /// Approve a replacement patch over the same files
    Modify(PatchSet),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub verdict: Verdict,
    pub comment: Option<String>,
    pub reviewer: Option<String>,
}

impl Decision {
    #[must_use]
    pub fn approve() -> Self {
        Self {
            verdict: Verdict::Approve,
            comment: None,
            reviewer: None,
        }
    }

    #[must_use]
    pub fn reject(comment: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Reject,
            comment: Some(comment.into()),
            reviewer: None,
        }
    }

    #[must_use]
    pub fn modify(patch: PatchSet, comment: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Modify(patch),
            comment: Some(comment.into()),
            reviewer: None,
        }
    }

    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    #[must_use]
    pub fn with_reviewer(mut self, reviewer: impl Into<String>) -> Self {
        self.reviewer = Some(reviewer.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReviewError {
    #[error("reviewer unavailable: {0}")]
    Unavailable(String),

    /// The response side went away without answering
    #[error("review request dropped without a decision")]
    Dropped,

    #[error("reviewer failed: {0}")]
    Failed(String),
}

/// Interactive review seam: a human prompt, a UI bridge or a policy
#[async_trait]
pub trait Reviewer: Send + Sync {
    /// # Errors
    /// Any error rejects the proposal
    async fn present(&self, proposal: &FixProposal) -> Result<Decision, ReviewError>;
}

/// Automated policy function as a reviewer
pub struct PolicyReviewer<F> {
    name: String,
    policy: F,
}

impl<F> PolicyReviewer<F>
where
    F: Fn(&FixProposal) -> Decision + Send + Sync,
{
    pub fn new(name: impl Into<String>, policy: F) -> Self {
        Self {
            name: name.into(),
            policy,
        }
    }
}

impl<F> std::fmt::Debug for PolicyReviewer<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyReviewer").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> Reviewer for PolicyReviewer<F>
where
    F: Fn(&FixProposal) -> Decision + Send + Sync,
{
    async fn present(&self, proposal: &FixProposal) -> Result<Decision, ReviewError> {
        let mut decision = (self.policy)(proposal);
        if decision.reviewer.is_none() {
            decision.reviewer = Some(self.name.clone());
        }
        Ok(decision)
    }
}

/// A review waiting for an answer from outside the pipeline
#[derive(Debug)]
pub struct ReviewRequest {
    pub proposal: FixProposal,
    responder: oneshot::Sender<Decision>,
}

impl ReviewRequest {
    /// Answer the request; returns `false` if the pipeline stopped waiting
    pub fn respond(self, decision: Decision) -> bool {
        self.responder.send(decision).is_ok()
    }
}

/// Bridges review requests to an external UI over a channel
///
/// Dropping a [`ReviewRequest`] unanswered rejects the proposal.
#[derive(Debug, Clone)]
pub struct ChannelReviewer {
    sender: mpsc::Sender<ReviewRequest>,
}

impl ChannelReviewer {
    /// Reviewer plus the receiving end the UI drains
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ReviewRequest>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Reviewer for ChannelReviewer {
    async fn present(&self, proposal: &FixProposal) -> Result<Decision, ReviewError> {
        let (responder, response) = oneshot::channel();
        let request = ReviewRequest {
            proposal: proposal.clone(),
            responder,
        };
        self.sender
            .send(request)
            .await
            .map_err(|_| ReviewError::Unavailable("review channel closed".into()))?;
        response.await.map_err(|_| ReviewError::Dropped)
    }
}

/// Result of driving a proposal through approval
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    AutoApproved,
    PendingReview,
    Approved,
    Rejected { reason: String },
}

/// Classification, routing and review
pub struct ApprovalController {
    classifier: Arc<ThreatClassifier>,
    reviewer: Arc<dyn Reviewer>,
    threshold: u8,
    review_timeout: Duration,
    sequence: Arc<AtomicU64>,
}

impl std::fmt::Debug for ApprovalController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalController")
            .field("threshold", &self.threshold)
            .field("review_timeout", &self.review_timeout)
            .finish_non_exhaustive()
    }
}

impl ApprovalController {
    /// `sequence` hands out approval numbers; share it with anything else
    /// that approves into the same workspace
    pub fn new(
        classifier: Arc<ThreatClassifier>,
        reviewer: Arc<dyn Reviewer>,
        threshold: u8,
        review_timeout: Duration,
        sequence: Arc<AtomicU64>,
    ) -> Self {
        Self {
            classifier,
            reviewer,
            threshold,
            review_timeout,
            sequence,
        }
    }

    #[inline]
    #[must_use]
    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    /// Next approval number; also orders manual rollbacks in the lock queue
    pub(crate) fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// `CREATED -> CLASSIFIED`
    ///
    /// # Errors
    /// Returns error if the proposal is not in `CREATED`
    pub fn classify(&self, proposal: &mut FixProposal, root: &Path) -> Result<(), StateMachineError> {
        let classification = self.classifier.classify_patch(&proposal.patch, root);
        let (tier, score, detail) = fold_classification(proposal, &classification);
        let reason = describe(&classification);
        proposal.transition(
            ProposalState::Classified,
            Stage::Classifier,
            Outcome::Classified,
            reason,
            Some(detail),
        )?;
        proposal.risk_tier = Some(tier);
        proposal.safety_score = score;
        info!(
            proposal_id = %proposal.id,
            risk_tier = %tier,
            safety_score = score,
            matches = classification.matches.len(),
            "proposal classified"
        );
        Ok(())
    }

    /// `CLASSIFIED -> AUTO_APPROVED | PENDING_REVIEW`
    ///
    /// # Errors
    /// Returns error if the proposal is not in `CLASSIFIED`
    pub fn route(&self, proposal: &mut FixProposal) -> Result<ApprovalOutcome, StateMachineError> {
        let tier = proposal.risk_tier.unwrap_or(RiskTier::Critical);
        let blockers = self.auto_approval_blockers(proposal, tier);

        if blockers.is_empty() {
            let sequence = self.next_sequence();
            proposal.transition(
                ProposalState::AutoApproved,
                Stage::Approval,
                Outcome::AutoApproved,
                format!("cosmetic change with safety score {}", proposal.safety_score),
                Some(EntryDetail::Approval {
                    patch_digest: proposal.patch.digest(),
                    sequence,
                    automatic: true,
                    reviewer: None,
                    comment: None,
                }),
            )?;
            info!(proposal_id = %proposal.id, sequence, "auto-approved");
            return Ok(ApprovalOutcome::AutoApproved);
        }

        proposal.transition(
            ProposalState::PendingReview,
            Stage::Approval,
            Outcome::ReviewRequested,
            blockers.join("; "),
            None,
        )?;
        debug!(proposal_id = %proposal.id, risk_tier = %tier, "review required");
        Ok(ApprovalOutcome::PendingReview)
    }

    fn auto_approval_blockers(&self, proposal: &FixProposal, tier: RiskTier) -> Vec<String> {
        let mut blockers = Vec::new();
        if tier != RiskTier::Cosmetic {
            blockers.push(format!("risk tier {tier} requires review"));
        }
        if proposal.safety_score < self.threshold {
            blockers.push(format!(
                "safety score {} below threshold {}",
                proposal.safety_score, self.threshold
            ));
        }
        if proposal.had_critical_match() {
            blockers.push("critical pattern match requires review".to_string());
        }
        blockers
    }

    /// `PENDING_REVIEW -> APPROVED | REJECTED`
    ///
    /// Timeout, cancellation, reviewer errors and a dropped response all
    /// reject.
    ///
    /// # Errors
    /// Returns error if the proposal is not in `PENDING_REVIEW`
    pub async fn review(
        &self,
        proposal: &mut FixProposal,
        root: &Path,
        cancel: &CancellationToken,
    ) -> Result<ApprovalOutcome, StateMachineError> {
        if proposal.state != ProposalState::PendingReview {
            return Err(StateMachineError::IllegalTransition {
                from: proposal.state,
                to: ProposalState::Approved,
            });
        }

        let answer = tokio::select! {
            () = cancel.cancelled() => Err("cancelled by operator".to_string()),
            answer = tokio::time::timeout(self.review_timeout, self.reviewer.present(proposal)) => {
                match answer {
                    Err(_) => Err(format!("no decision within {:?}", self.review_timeout)),
                    Ok(Err(e)) => Err(e.to_string()),
                    Ok(Ok(decision)) => Ok(decision),
                }
            }
        };

        let decision = match answer {
            Ok(decision) => decision,
            Err(reason) => {
                warn!(proposal_id = %proposal.id, %reason, "review failed closed");
                return self.reject(proposal, reason, None);
            }
        };

        let Decision {
            verdict,
            comment,
            reviewer,
        } = decision;
        match verdict {
            Verdict::Reject => {
                let reason = comment.clone().unwrap_or_else(|| "rejected by reviewer".to_string());
                self.reject(proposal, reason, reviewer)
            }
            Verdict::Approve => self.approve(proposal, comment, reviewer),
            Verdict::Modify(patch) => {
                if !patch.targets().eq(proposal.target_files.iter()) {
                    return self.reject(
                        proposal,
                        "modified patch touches a different file set".to_string(),
                        reviewer,
                    );
                }
                proposal.patch = patch;
                let classification = self.classifier.classify_patch(&proposal.patch, root);
                let (tier, score, detail) = fold_classification(proposal, &classification);
                proposal.record(
                    Stage::Classifier,
                    Outcome::Modified,
                    format!("reviewer patch re-classified: {}", describe(&classification)),
                    Some(detail),
                );
                proposal.risk_tier = Some(tier);
                proposal.safety_score = score;
                self.approve(proposal, comment, reviewer)
            }
        }
    }

    fn approve(
        &self,
        proposal: &mut FixProposal,
        comment: Option<String>,
        reviewer: Option<String>,
    ) -> Result<ApprovalOutcome, StateMachineError> {
        let sequence = self.next_sequence();
        let reason = comment.clone().unwrap_or_else(|| "approved by reviewer".to_string());
        proposal.transition(
            ProposalState::Approved,
            Stage::Approval,
            Outcome::Approved,
            reason,
            Some(EntryDetail::Approval {
                patch_digest: proposal.patch.digest(),
                sequence,
                automatic: false,
                reviewer,
                comment,
            }),
        )?;
        info!(proposal_id = %proposal.id, sequence, "approved");
        Ok(ApprovalOutcome::Approved)
    }

    fn reject(
        &self,
        proposal: &mut FixProposal,
        reason: String,
        reviewer: Option<String>,
    ) -> Result<ApprovalOutcome, StateMachineError> {
        let recorded = match &reviewer {
            Some(name) => format!("{reason} ({name})"),
            None => reason.clone(),
        };
        proposal.transition(
            ProposalState::Rejected,
            Stage::Approval,
            Outcome::Rejected,
            recorded,
            None,
        )?;
        info!(proposal_id = %proposal.id, %reason, "rejected");
        Ok(ApprovalOutcome::Rejected { reason })
    }
}

/// New tier and score after `classification`
///
/// The tier never drops. The score is always the creation seed adjusted by
/// this classification alone, so a re-classified patch is not charged for
/// the patch it replaced.
fn fold_classification(
    proposal: &FixProposal,
    classification: &Classification,
) -> (RiskTier, u8, EntryDetail) {
    let tier = proposal
        .risk_tier
        .map_or(classification.risk_tier, |t| t.raise(classification.risk_tier));
    let score = classification.apply_to_score(proposal.safety_seed());
    let detail = EntryDetail::Classification {
        risk_tier: tier,
        safety_score: score,
        matched: classification
            .matched_ids()
            .into_iter()
            .map(str::to_string)
            .collect(),
        critical_match: classification.has_critical_match(),
        fail_closed: classification.is_fail_closed(),
    };
    (tier, score, detail)
}

fn describe(classification: &Classification) -> String {
    if let Some(failure) = &classification.failure {
        return format!("unclassifiable patch, failing closed: {failure}");
    }
    let ids = classification.matched_ids();
    if ids.is_empty() {
        format!("{} with no pattern matches", classification.risk_tier)
    } else {
        format!("{} matched {}", classification.risk_tier, ids.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proposal::ProposalBuilder;
    use crate::types::Issue;
    use fixguard_artifact::{FilePatch, TargetPath};
    use fixguard_classifier::ClassifierConfig;
    use std::fs;

    struct Harness {
        root: tempfile::TempDir,
        controller: ApprovalController,
    }

    fn harness(reviewer: Arc<dyn Reviewer>, timeout: Duration) -> Harness {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("a.py"), "x = 1\n").unwrap();
        let controller = ApprovalController::new(
            Arc::new(ThreatClassifier::new(ClassifierConfig::default())),
            reviewer,
            95,
            timeout,
            Arc::new(AtomicU64::new(1)),
        );
        Harness { root, controller }
    }

    fn proposal(content: &str, confidence: u8) -> FixProposal {
        ProposalBuilder::from_issue(
            Issue::replace("I-1", "a.py", "fix", content).with_confidence(confidence),
        )
        .build()
        .unwrap()
    }

    fn approve_all() -> Arc<dyn Reviewer> {
        Arc::new(PolicyReviewer::new("policy", |_: &FixProposal| Decision::approve()))
    }

    #[tokio::test]
    async fn cosmetic_high_score_is_auto_approved() {
        let h = harness(approve_all(), Duration::from_secs(1));
        let mut p = proposal("x  =  1\n", 99);
        h.controller.classify(&mut p, h.root.path()).unwrap();
        assert_eq!(p.risk_tier, Some(RiskTier::Cosmetic));
        assert_eq!(h.controller.route(&mut p).unwrap(), ApprovalOutcome::AutoApproved);
        let (digest, sequence, automatic) = p.approval().unwrap();
        assert_eq!(digest, p.patch.digest());
        assert_eq!(sequence, 1);
        assert!(automatic);
    }

    #[tokio::test]
    async fn low_score_needs_review() {
        let h = harness(approve_all(), Duration::from_secs(1));
        let mut p = proposal("x  =  1\n", 94);
        h.controller.classify(&mut p, h.root.path()).unwrap();
        assert_eq!(h.controller.route(&mut p).unwrap(), ApprovalOutcome::PendingReview);
        assert!(p.last_reason().contains("below threshold 95"));
    }

    #[tokio::test]
    async fn critical_match_forces_review_even_with_perfect_score() {
        let h = harness(approve_all(), Duration::from_secs(1));
        let mut p = proposal("import os\nos.system(cmd)\n", 100);
        h.controller.classify(&mut p, h.root.path()).unwrap();
        assert_eq!(p.risk_tier, Some(RiskTier::Critical));
        assert!(p.had_critical_match());
        assert_eq!(h.controller.route(&mut p).unwrap(), ApprovalOutcome::PendingReview);
    }

    #[tokio::test]
    async fn review_timeout_rejects() {
        struct Silent;
        #[async_trait]
        impl Reviewer for Silent {
            async fn present(&self, _p: &FixProposal) -> Result<Decision, ReviewError> {
                std::future::pending().await
            }
        }
        let h = harness(Arc::new(Silent), Duration::from_millis(30));
        let mut p = proposal("x = 2\n", 50);
        h.controller.classify(&mut p, h.root.path()).unwrap();
        h.controller.route(&mut p).unwrap();
        let outcome = h
            .controller
            .review(&mut p, h.root.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, ApprovalOutcome::Rejected { .. }));
        assert_eq!(p.state, ProposalState::Rejected);
    }

    #[tokio::test]
    async fn dropped_channel_request_rejects() {
        let (reviewer, mut requests) = ChannelReviewer::channel(4);
        let h = harness(Arc::new(reviewer), Duration::from_secs(5));
        let mut p = proposal("x = 2\n", 50);
        h.controller.classify(&mut p, h.root.path()).unwrap();
        h.controller.route(&mut p).unwrap();

        let ui = tokio::spawn(async move {
            let request = requests.recv().await.unwrap();
            drop(request);
        });
        let outcome = h
            .controller
            .review(&mut p, h.root.path(), &CancellationToken::new())
            .await
            .unwrap();
        ui.await.unwrap();
        assert!(matches!(outcome, ApprovalOutcome::Rejected { ref reason } if reason.contains("dropped")));
    }

    #[tokio::test]
    async fn channel_reviewer_approval_is_recorded_verbatim() {
        let (reviewer, mut requests) = ChannelReviewer::channel(4);
        let h = harness(Arc::new(reviewer), Duration::from_secs(5));
        let mut p = proposal("x = 2\n", 50);
        h.controller.classify(&mut p, h.root.path()).unwrap();
        h.controller.route(&mut p).unwrap();

        tokio::spawn(async move {
            let request = requests.recv().await.unwrap();
            assert_eq!(request.proposal.state, ProposalState::PendingReview);
            request.respond(Decision::approve().with_comment("looks right").with_reviewer("alice"));
        });
        let outcome = h
            .controller
            .review(&mut p, h.root.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, ApprovalOutcome::Approved);
        let entry = p.decision_log.last().unwrap();
        assert_eq!(entry.reason, "looks right");
        assert!(matches!(
            &entry.detail,
            Some(EntryDetail::Approval { reviewer: Some(r), automatic: false, .. }) if r == "alice"
        ));
    }

    #[tokio::test]
    async fn modification_is_reclassified_and_tier_never_drops() {
        let modified = PatchSet::single(FilePatch::replace(
            TargetPath::new("a.py").unwrap(),
            "x  =  1\n",
        ));
        let reviewer = Arc::new(PolicyReviewer::new("policy", move |_: &FixProposal| {
            Decision::modify(modified.clone(), "use the cosmetic version")
        }));
        let h = harness(reviewer, Duration::from_secs(1));
        let mut p = proposal("x = requests.get(url)\n", 90);
        h.controller.classify(&mut p, h.root.path()).unwrap();
        let tier = p.risk_tier.unwrap();
        assert!(tier >= RiskTier::High);
        h.controller.route(&mut p).unwrap();

        let outcome = h
            .controller
            .review(&mut p, h.root.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, ApprovalOutcome::Approved);
        // Cosmetic replacement, but the recorded tier stays
        assert_eq!(p.risk_tier, Some(tier));
        assert_eq!(p.approval().unwrap().0, p.patch.digest());
        assert!(p.decision_log.last_of(Outcome::Modified).is_some());
    }

    #[tokio::test]
    async fn modification_scores_from_the_seed() {
        let modified = PatchSet::single(FilePatch::replace(
            TargetPath::new("a.py").unwrap(),
            "x = requests.get(url, timeout=5)\n",
        ));
        let replacement = modified.clone();
        let reviewer = Arc::new(PolicyReviewer::new("policy", move |_: &FixProposal| {
            Decision::modify(replacement.clone(), "add a timeout")
        }));
        let h = harness(reviewer, Duration::from_secs(1));
        let mut p = proposal("x = requests.get(url)\n", 90);
        h.controller.classify(&mut p, h.root.path()).unwrap();
        let first = p.safety_score;
        assert!(first < 90);
        h.controller.route(&mut p).unwrap();
        h.controller
            .review(&mut p, h.root.path(), &CancellationToken::new())
            .await
            .unwrap();

        // Same pattern fires on the replacement: charged once, from the seed
        let reclassified = ThreatClassifier::new(ClassifierConfig::default())
            .classify_patch(&modified, h.root.path());
        assert_eq!(p.safety_score, reclassified.apply_to_score(90));
        assert_eq!(p.safety_score, first);
        assert!(matches!(
            p.decision_log.last_of(Outcome::Modified).and_then(|e| e.detail.as_ref()),
            Some(EntryDetail::Classification { safety_score, .. }) if *safety_score == first
        ));
    }

    #[tokio::test]
    async fn modification_over_other_files_is_rejected() {
        let other = PatchSet::single(FilePatch::replace(TargetPath::new("b.py").unwrap(), "y\n"));
        let reviewer = Arc::new(PolicyReviewer::new("policy", move |_: &FixProposal| {
            Decision::modify(other.clone(), "moved")
        }));
        let h = harness(reviewer, Duration::from_secs(1));
        let mut p = proposal("x = 2\n", 50);
        h.controller.classify(&mut p, h.root.path()).unwrap();
        h.controller.route(&mut p).unwrap();
        let outcome = h
            .controller
            .review(&mut p, h.root.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, ApprovalOutcome::Rejected { .. }));
    }
}
