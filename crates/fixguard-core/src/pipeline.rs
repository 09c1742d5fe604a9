//! Pipeline orchestration
//!
//! Drives proposals through every stage:
//!
//! ```text
//! classify -> route -> review -> sandbox -> safeguard -> transaction
//! ```
//!
//! Each proposal is persisted after every transition, so a proposal handed
//! back to [`Pipeline::process`] continues from its recorded state. Up to
//! `max_parallel` proposals run at once; applies over overlapping files are
//! serialized by the file-set lock in approval order.

use crate::approval::ApprovalOutcome;
use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::feedback::{FeedbackEvent, FeedbackOutcome};
use crate::proposal::{EntryDetail, FixProposal, Outcome, ProposalBuilder};
use crate::safeguard::{EmergencySafeguard, FailedCheck, SafeguardCheck, TamperIncident};
use crate::types::{Issue, ProposalId, ProposalState, Stage, TerminalStatus};
use chrono::Utc;
use dashmap::DashMap;
use fixguard_artifact::{read_optional, ContentHash, ResolvedPatch, TargetPath};
use fixguard_transaction::{
    ApplyRequest, FileSetGuard, RollbackReport, SnapshotState, TransactionError, TransactionEvent,
    TransactionOutcome,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What happened to the files of a rolled-back proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rollback", rename_all = "snake_case")]
pub enum RollbackStatus {
    /// Every written file was restored from the snapshot
    Restored,
    /// Stopped before the first write; nothing to restore
    NothingWritten,
    /// Some files could not be restored
    Incomplete { reason: String },
}

/// Per-proposal result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalReport {
    pub proposal_id: ProposalId,
    /// `None` while the proposal is still open (requeued or failed to persist)
    pub status: Option<TerminalStatus>,
    /// Stage of the last decision
    pub stage: Stage,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackStatus>,
}

impl ProposalReport {
    fn of(proposal: &FixProposal) -> Self {
        let last = proposal.decision_log.last();
        Self {
            proposal_id: proposal.id,
            status: proposal.terminal_status(),
            stage: last.map_or(Stage::Builder, |e| e.stage),
            reason: proposal.last_reason().to_string(),
            rollback: rollback_status(proposal),
        }
    }

    fn open(proposal: &FixProposal, stage: Stage, reason: impl Into<String>) -> Self {
        Self {
            proposal_id: proposal.id,
            status: None,
            stage,
            reason: reason.into(),
            rollback: None,
        }
    }
}

/// Result of a batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// One report per submitted proposal, in submission order
    pub reports: Vec<ProposalReport>,
    /// Proposals left open because the file-set lock was not granted
    pub requeued: Vec<ProposalId>,
}

impl BatchReport {
    #[must_use]
    pub fn get(&self, id: ProposalId) -> Option<&ProposalReport> {
        self.reports.iter().find(|r| r.proposal_id == id)
    }

    /// Number of proposals that ended in `status`
    #[must_use]
    pub fn count(&self, status: TerminalStatus) -> usize {
        self.reports.iter().filter(|r| r.status == Some(status)).count()
    }
}

/// How a run over one proposal ended
enum Flow {
    /// Terminal state reached
    Done,
    /// Still open; may be submitted again
    Requeued { stage: Stage, reason: String },
}

struct Shared {
    ctx: PipelineContext,
    in_flight: DashMap<ProposalId, CancellationToken>,
    permits: Arc<Semaphore>,
}

/// The FixGuard pipeline
#[derive(Clone)]
pub struct Pipeline {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("in_flight", &self.shared.in_flight.len())
            .finish_non_exhaustive()
    }
}

/// Removes the cancellation token when a proposal leaves the pipeline
struct InFlight<'a> {
    map: &'a DashMap<ProposalId, CancellationToken>,
    id: ProposalId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.id);
    }
}

impl Pipeline {
    #[must_use]
    pub fn new(ctx: PipelineContext) -> Self {
        let permits = Arc::new(Semaphore::new(ctx.config.max_parallel.max(1)));
        Self {
            shared: Arc::new(Shared {
                ctx,
                in_flight: DashMap::new(),
                permits,
            }),
        }
    }

    #[inline]
    #[must_use]
    pub fn context(&self) -> &PipelineContext {
        &self.shared.ctx
    }

    fn ctx(&self) -> &PipelineContext {
        &self.shared.ctx
    }

    /// Build a proposal from `issue` and persist it in `CREATED`
    ///
    /// # Errors
    /// Returns error for an invalid issue or a persistence failure
    pub fn propose(&self, issue: Issue) -> Result<FixProposal, PipelineError> {
        let seed = self.ctx().feedback.seed(&issue);
        let mut proposal = ProposalBuilder::from_issue(issue)
            .with_feedback_seed(seed)
            .with_default_seed(self.ctx().config.default_safety_seed)
            .build()?;
        self.persist(&mut proposal)?;
        info!(
            proposal_id = %proposal.id,
            source = %proposal.source_issue_ref,
            files = proposal.target_files.len(),
            safety_score = proposal.safety_score,
            "proposal created"
        );
        Ok(proposal)
    }

    /// Load a persisted proposal
    ///
    /// # Errors
    /// Returns error if it does not exist or cannot be read
    pub fn load(&self, id: ProposalId) -> Result<FixProposal, PipelineError> {
        Ok(self.ctx().store.load(id)?)
    }

    /// Run every proposal to a terminal state (or requeue it)
    pub async fn process(&self, proposals: Vec<FixProposal>) -> BatchReport {
        let order: Vec<ProposalId> = proposals.iter().map(|p| p.id).collect();
        let mut tasks = JoinSet::new();
        for proposal in proposals {
            let pipeline = self.clone();
            let permits = Arc::clone(&self.shared.permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                pipeline.process_one(proposal).await
            });
        }

        let mut finished = HashMap::with_capacity(order.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => {
                    finished.insert(report.proposal_id, report);
                }
                Err(e) => error!(error = %e, "proposal task failed"),
            }
        }

        let mut batch = BatchReport::default();
        for id in order {
            let report = finished.remove(&id).unwrap_or_else(|| ProposalReport {
                proposal_id: id,
                status: None,
                stage: Stage::Operator,
                reason: "processing task aborted".to_string(),
                rollback: None,
            });
            if report.status.is_none() {
                batch.requeued.push(id);
            }
            batch.reports.push(report);
        }
        info!(
            proposals = batch.reports.len(),
            committed = batch.count(TerminalStatus::Committed),
            requeued = batch.requeued.len(),
            "batch finished"
        );
        batch
    }

    /// Run one proposal from its current state
    pub async fn process_one(&self, mut proposal: FixProposal) -> ProposalReport {
        let id = proposal.id;
        if proposal.state.is_terminal() {
            return ProposalReport::of(&proposal);
        }
        let Some(token) = self.register(id) else {
            return ProposalReport::open(&proposal, Stage::Operator, "proposal is already being processed");
        };
        let _in_flight = InFlight {
            map: &self.shared.in_flight,
            id,
        };

        match self.drive(&mut proposal, &token).await {
            Ok(Flow::Done) => ProposalReport::of(&proposal),
            Ok(Flow::Requeued { stage, reason }) => {
                info!(proposal_id = %id, state = %proposal.state, %reason, "proposal requeued");
                ProposalReport::open(&proposal, stage, reason)
            }
            Err(e) => {
                error!(
                    proposal_id = %id,
                    state = %proposal.state,
                    entries = proposal.decision_log.len(),
                    last_decision = proposal.last_reason(),
                    error = %e,
                    "proposal processing failed"
                );
                let mut report = ProposalReport::of(&proposal);
                report.reason = e.to_string();
                report
            }
        }
    }

    fn register(&self, id: ProposalId) -> Option<CancellationToken> {
        match self.shared.in_flight.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                slot.insert(token.clone());
                Some(token)
            }
        }
    }

    /// Signal an in-flight proposal to stop
    ///
    /// A review in progress rejects, a sandbox run fails and an apply rolls
    /// back. Returns `false` if the proposal is not in flight.
    pub fn cancel(&self, id: ProposalId) -> bool {
        match self.shared.in_flight.get(&id) {
            Some(token) => {
                token.cancel();
                info!(proposal_id = %id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    async fn drive(
        &self,
        proposal: &mut FixProposal,
        cancel: &CancellationToken,
    ) -> Result<Flow, PipelineError> {
        let ctx = self.ctx();
        let root = ctx.config.workspace_root.as_path();
        loop {
            debug!(proposal_id = %proposal.id, state = %proposal.state, "advancing proposal");
            match proposal.state {
                ProposalState::Created => {
                    ctx.approval.classify(proposal, root)?;
                    self.persist(proposal)?;
                }
                ProposalState::Classified => {
                    let routed = ctx.approval.route(proposal)?;
                    self.persist(proposal)?;
                    if routed == ApprovalOutcome::AutoApproved {
                        self.emit(proposal, Stage::Approval, FeedbackOutcome::AutoApproved).await;
                    }
                }
                ProposalState::PendingReview => {
                    let outcome = ctx.approval.review(proposal, root, cancel).await?;
                    self.persist(proposal)?;
                    let feedback = match outcome {
                        ApprovalOutcome::Rejected { .. } => FeedbackOutcome::Rejected,
                        _ => FeedbackOutcome::Approved,
                    };
                    self.emit(proposal, Stage::Approval, feedback).await;
                }
                ProposalState::AutoApproved
                | ProposalState::Approved
                | ProposalState::Validating => self.validate(proposal, cancel).await?,
                ProposalState::SandboxPassed => {
                    if let Flow::Requeued { stage, reason } = self.apply(proposal, cancel).await? {
                        return Ok(Flow::Requeued { stage, reason });
                    }
                }
                ProposalState::Applying => self.reconcile(proposal).await?,
                ProposalState::Rejected
                | ProposalState::SandboxFailed
                | ProposalState::TamperBlocked
                | ProposalState::Committed
                | ProposalState::RolledBack => return Ok(Flow::Done),
            }
        }
    }

    /// `AUTO_APPROVED | APPROVED | VALIDATING -> SANDBOX_PASSED | SANDBOX_FAILED`
    async fn validate(
        &self,
        proposal: &mut FixProposal,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let ctx = self.ctx();
        let root = ctx.config.workspace_root.as_path();
        if proposal.state != ProposalState::Validating {
            proposal.transition(
                ProposalState::Validating,
                Stage::Sandbox,
                Outcome::ValidationStarted,
                format!(
                    "running {} validation command(s)",
                    ctx.sandbox.policy().commands.len()
                ),
                None,
            )?;
            self.persist(proposal)?;
        }

        let resolved = match proposal.patch.resolve_from(root) {
            Ok(resolved) => resolved,
            Err(e) => {
                return self
                    .sandbox_failed(proposal, format!("patch does not apply to the workspace: {e}"), None)
                    .await;
            }
        };

        match ctx.sandbox.validate(&resolved, root, cancel).await {
            Ok(result) if result.passed => {
                let reason = result.reason();
                proposal.transition(
                    ProposalState::SandboxPassed,
                    Stage::Sandbox,
                    Outcome::SandboxPassed,
                    reason,
                    Some(EntryDetail::Sandbox {
                        resolved_digest: resolved.digest(),
                        bases: bases_of(&resolved),
                        commands: result.commands.len(),
                        violations: Vec::new(),
                        wall_clock_ms: result.usage.wall_clock_ms,
                    }),
                )?;
                self.persist(proposal)?;
                info!(
                    proposal_id = %proposal.id,
                    commands = result.commands.len(),
                    wall_clock_ms = result.usage.wall_clock_ms,
                    "sandbox passed"
                );
                self.emit(proposal, Stage::Sandbox, FeedbackOutcome::SandboxPassed).await;
                Ok(())
            }
            Ok(result) => {
                let detail = EntryDetail::Sandbox {
                    resolved_digest: resolved.digest(),
                    bases: bases_of(&resolved),
                    commands: result.commands.len(),
                    violations: result.violations.iter().map(ToString::to_string).collect(),
                    wall_clock_ms: result.usage.wall_clock_ms,
                };
                self.sandbox_failed(proposal, result.reason(), Some(detail)).await
            }
            Err(e) => {
                self.sandbox_failed(proposal, format!("sandbox could not run: {e}"), None)
                    .await
            }
        }
    }

    async fn sandbox_failed(
        &self,
        proposal: &mut FixProposal,
        reason: String,
        detail: Option<EntryDetail>,
    ) -> Result<(), PipelineError> {
        warn!(proposal_id = %proposal.id, %reason, "sandbox failed");
        proposal.transition(
            ProposalState::SandboxFailed,
            Stage::Sandbox,
            Outcome::SandboxFailed,
            reason,
            detail,
        )?;
        self.persist(proposal)?;
        self.emit(proposal, Stage::Sandbox, FeedbackOutcome::SandboxFailed).await;
        Ok(())
    }

    /// `SANDBOX_PASSED -> TAMPER_BLOCKED | APPLYING -> COMMITTED | ROLLED_BACK`
    async fn apply(
        &self,
        proposal: &mut FixProposal,
        cancel: &CancellationToken,
    ) -> Result<Flow, PipelineError> {
        let ctx = self.ctx();
        let guard = match self.acquire(proposal, cancel).await? {
            Ok(guard) => guard,
            Err(flow) => return Ok(flow),
        };

        // Workspace moved on since validation: nothing may be written
        if let Some(stale) = self.stale_base(proposal)? {
            proposal.transition(
                ProposalState::Applying,
                Stage::Transaction,
                Outcome::ApplyStarted,
                "re-checking validated bases",
                None,
            )?;
            proposal.transition(
                ProposalState::RolledBack,
                Stage::Transaction,
                Outcome::RolledBack,
                format!("stale base for {stale}: workspace changed after validation; nothing written"),
                None,
            )?;
            self.persist(proposal)?;
            warn!(proposal_id = %proposal.id, target = %stale, "stale base, apply abandoned");
            self.emit(proposal, Stage::Transaction, FeedbackOutcome::RolledBack).await;
            return Ok(Flow::Done);
        }

        let resolved = match proposal.patch.resolve_from(&ctx.config.workspace_root) {
            Ok(resolved) => resolved,
            Err(e) => {
                // Bases are unchanged, so the patch itself must have changed
                let incident = TamperIncident {
                    proposal_id: proposal.id,
                    failed: vec![FailedCheck {
                        check: SafeguardCheck::ResolvedDigest,
                        detail: format!("patch no longer resolves against validated bases: {e}"),
                    }],
                    detected_at: Utc::now(),
                };
                return self.tamper_blocked(proposal, &incident).await;
            }
        };

        let audited = ctx.store.audit().entries_for(proposal.id)?;
        if let Err(incident) = ctx.safeguard.enforce(proposal, &resolved, &audited) {
            return self.tamper_blocked(proposal, &incident).await;
        }

        proposal.transition(
            ProposalState::Applying,
            Stage::Transaction,
            Outcome::ApplyStarted,
            format!("applying {} file(s)", resolved.files().len()),
            None,
        )?;
        self.persist(proposal)?;

        self.transact(proposal, &guard, &resolved, cancel).await?;
        drop(guard);
        Ok(Flow::Done)
    }

    /// File-set lock with bounded, backed-off retries
    ///
    /// The inner `Err` is the flow to return when the lock is not granted.
    async fn acquire(
        &self,
        proposal: &mut FixProposal,
        cancel: &CancellationToken,
    ) -> Result<Result<FileSetGuard, Flow>, PipelineError> {
        let ctx = self.ctx();
        let lock = &ctx.config.lock;
        // Unapproved proposals queue last; the safeguard blocks them anyway
        let sequence = proposal.approval().map_or(u64::MAX, |(_, sequence, _)| sequence);
        let mut attempt = 0;
        loop {
            let error = match ctx
                .transactions
                .acquire(sequence, proposal.target_files.iter().cloned(), cancel)
                .await
            {
                Ok(guard) => {
                    debug!(proposal_id = %proposal.id, sequence, "file-set lock acquired");
                    return Ok(Ok(guard));
                }
                Err(e) => PipelineError::from(e),
            };

            if matches!(error, PipelineError::Cancelled) {
                return Ok(Err(Flow::Requeued {
                    stage: Stage::Transaction,
                    reason: "cancelled while waiting for the file-set lock".to_string(),
                }));
            }
            if !error.is_retryable() {
                return Err(error);
            }
            if attempt >= lock.max_retries {
                let reason = format!("{error}; requeued after {} retries", lock.max_retries);
                proposal.record(Stage::Transaction, Outcome::LockTimeout, reason.clone(), None);
                self.persist(proposal)?;
                warn!(proposal_id = %proposal.id, attempts = attempt + 1, "file-set lock not granted");
                return Ok(Err(Flow::Requeued {
                    stage: Stage::Transaction,
                    reason,
                }));
            }

            let backoff = lock.backoff(attempt);
            attempt += 1;
            debug!(proposal_id = %proposal.id, attempt, ?backoff, "lock timeout, backing off");
            tokio::select! {
                () = cancel.cancelled() => {
                    return Ok(Err(Flow::Requeued {
                        stage: Stage::Transaction,
                        reason: "cancelled while waiting for the file-set lock".to_string(),
                    }));
                }
                () = tokio::time::sleep(backoff) => {}
            }
        }
    }

    /// First target whose on-disk content differs from the validated base
    fn stale_base(&self, proposal: &FixProposal) -> Result<Option<TargetPath>, PipelineError> {
        let root = &self.ctx().config.workspace_root;
        let Some(bases) = proposal
            .decision_log
            .last_of(Outcome::SandboxPassed)
            .and_then(|e| match &e.detail {
                Some(EntryDetail::Sandbox { bases, .. }) => Some(bases),
                _ => None,
            })
        else {
            return Ok(None);
        };
        for (target, expected) in bases {
            let path = target.resolve(root);
            let current = read_optional(&path)
                .map_err(|source| TransactionError::Io { path, source })?
                .map(|bytes| ContentHash::compute(&bytes));
            if current != *expected {
                return Ok(Some(target.clone()));
            }
        }
        Ok(None)
    }

    async fn tamper_blocked(
        &self,
        proposal: &mut FixProposal,
        incident: &TamperIncident,
    ) -> Result<Flow, PipelineError> {
        if proposal.state != ProposalState::TamperBlocked {
            EmergencySafeguard::block(proposal, incident);
        }
        self.persist(proposal)?;
        if let Err(e) = self
            .ctx()
            .feedback
            .emit(FeedbackEvent::circumvention(proposal.id))
            .await
        {
            warn!(proposal_id = %proposal.id, error = %e, "feedback delivery failed");
        }
        Ok(Flow::Done)
    }

    /// Run the transaction and record its events
    async fn transact(
        &self,
        proposal: &mut FixProposal,
        guard: &FileSetGuard,
        resolved: &ResolvedPatch,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let ctx = self.ctx();
        let request = ApplyRequest::from_resolved(proposal.id.to_string(), resolved);
        let report = match ctx
            .transactions
            .apply(guard, &request, ctx.verifier.as_ref(), cancel)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                let reason = format!("apply aborted before writing: {e}");
                warn!(proposal_id = %proposal.id, %reason, "apply aborted");
                proposal.transition(
                    ProposalState::RolledBack,
                    Stage::Transaction,
                    Outcome::RolledBack,
                    reason,
                    None,
                )?;
                self.persist(proposal)?;
                self.emit(proposal, Stage::Transaction, FeedbackOutcome::RolledBack).await;
                return Ok(());
            }
        };

        for event in &report.events {
            proposal.record(
                Stage::Transaction,
                Outcome::TransactionStep,
                describe_event(event),
                Some(EntryDetail::Transaction {
                    event: event.clone(),
                }),
            );
        }

        let feedback = match report.outcome {
            TransactionOutcome::Committed => {
                proposal.transition(
                    ProposalState::Committed,
                    Stage::Transaction,
                    Outcome::Committed,
                    format!("{} file(s) committed", resolved.files().len()),
                    None,
                )?;
                info!(proposal_id = %proposal.id, files = resolved.files().len(), "committed");
                FeedbackOutcome::Committed
            }
            TransactionOutcome::RolledBack { reason } => {
                proposal.transition(
                    ProposalState::RolledBack,
                    Stage::Transaction,
                    Outcome::RolledBack,
                    reason,
                    None,
                )?;
                FeedbackOutcome::RolledBack
            }
            TransactionOutcome::RollbackFailed { reason, failures } => {
                let failed: Vec<String> = failures.iter().map(TargetPath::as_string).collect();
                error!(proposal_id = %proposal.id, failed = ?failed, "rollback incomplete");
                proposal.record(
                    Stage::Transaction,
                    Outcome::RollbackFailed,
                    format!("could not restore {}", failed.join(", ")),
                    None,
                );
                proposal.transition(
                    ProposalState::RolledBack,
                    Stage::Transaction,
                    Outcome::RolledBack,
                    format!("{reason}; rollback incomplete"),
                    None,
                )?;
                FeedbackOutcome::RolledBack
            }
        };
        self.persist(proposal)?;
        self.emit(proposal, Stage::Transaction, feedback).await;
        Ok(())
    }

    /// Settle a proposal found in `APPLYING` from its snapshot
    async fn reconcile(&self, proposal: &mut FixProposal) -> Result<(), PipelineError> {
        let tx = &self.ctx().transactions;
        let id = proposal.id.to_string();
        tx.recover_one(&id).await?;

        let (to, outcome, reason, detail) = match tx.snapshots().load(&id) {
            Ok(snapshot) => match snapshot.state {
                SnapshotState::Committed { .. } => (
                    ProposalState::Committed,
                    Outcome::Committed,
                    "apply had committed before the interruption",
                    None,
                ),
                SnapshotState::Restored { .. } => (
                    ProposalState::RolledBack,
                    Outcome::RolledBack,
                    "interrupted apply restored from snapshot",
                    Some(EntryDetail::Rollback {
                        files: snapshot.targets().cloned().collect(),
                    }),
                ),
                SnapshotState::Active => {
                    return Err(PipelineError::ApplyFailure {
                        proposal_id: proposal.id,
                        reason: "transaction still in flight after recovery".to_string(),
                    });
                }
            },
            Err(TransactionError::SnapshotNotFound(_)) => (
                ProposalState::RolledBack,
                Outcome::RolledBack,
                "interrupted before the snapshot; nothing written",
                None,
            ),
            Err(e) => return Err(e.into()),
        };
        proposal.transition(to, Stage::Operator, outcome, reason, detail)?;
        self.persist(proposal)?;
        info!(proposal_id = %proposal.id, state = %to, "reconciled interrupted apply");
        let feedback = if to == ProposalState::Committed {
            FeedbackOutcome::Committed
        } else {
            FeedbackOutcome::RolledBack
        };
        self.emit(proposal, Stage::Operator, feedback).await;
        Ok(())
    }

    /// Undo a committed proposal from its retained snapshot
    ///
    /// A proposal already rolled back is left untouched.
    ///
    /// # Errors
    /// - [`PipelineError::WrongState`] unless the proposal is committed or
    ///   rolled back
    /// - [`PipelineError::Transaction`] if the snapshot is gone, a file
    ///   changed after commit, or a restore failed
    pub async fn rollback(&self, id: ProposalId) -> Result<ProposalReport, PipelineError> {
        let ctx = self.ctx();
        let mut proposal = ctx.store.load(id)?;
        match proposal.state {
            ProposalState::RolledBack => {
                debug!(proposal_id = %id, "already rolled back");
                return Ok(ProposalReport::of(&proposal));
            }
            ProposalState::Committed => {}
            state => {
                return Err(PipelineError::WrongState {
                    proposal_id: id,
                    state,
                    reason: "only committed proposals can be rolled back",
                });
            }
        }

        let Some(token) = self.register(id) else {
            return Err(PipelineError::WrongState {
                proposal_id: id,
                state: proposal.state,
                reason: "proposal is already being processed",
            });
        };
        let _in_flight = InFlight {
            map: &self.shared.in_flight,
            id,
        };

        let sequence = ctx.approval.next_sequence();
        let (reason, files) = match ctx.transactions.rollback(&id.to_string(), sequence, &token).await {
            Ok(RollbackReport::Restored { files }) => {
                (format!("manual rollback restored {} file(s)", files.len()), files)
            }
            Ok(RollbackReport::AlreadyRestored) => {
                ("snapshot had already been restored".to_string(), Vec::new())
            }
            Err(e) => {
                warn!(proposal_id = %id, error = %e, "manual rollback refused");
                return Err(e.into());
            }
        };
        proposal.transition(
            ProposalState::RolledBack,
            Stage::Operator,
            Outcome::RolledBack,
            reason,
            Some(EntryDetail::Rollback { files }),
        )?;
        self.persist(&mut proposal)?;
        info!(proposal_id = %id, "manual rollback complete");
        self.emit(&proposal, Stage::Operator, FeedbackOutcome::RolledBack).await;
        Ok(ProposalReport::of(&proposal))
    }

    /// Finish transactions a crash left in flight and settle the proposals
    /// that were applying
    ///
    /// # Errors
    /// Returns error if the journal, snapshots or proposal records cannot
    /// be read
    pub async fn recover(&self) -> Result<Vec<ProposalReport>, PipelineError> {
        let ctx = self.ctx();
        let recovered = ctx.transactions.recover().await?;
        for txn in &recovered {
            info!(txn_id = %txn.txn_id, outcome = ?txn.outcome, "transaction recovered");
        }

        let mut reports = Vec::new();
        for mut proposal in ctx.store.list()? {
            if proposal.state != ProposalState::Applying {
                continue;
            }
            match self.reconcile(&mut proposal).await {
                Ok(()) => reports.push(ProposalReport::of(&proposal)),
                Err(e) => {
                    error!(proposal_id = %proposal.id, error = %e, "recovery failed");
                    reports.push(ProposalReport::open(&proposal, Stage::Operator, e.to_string()));
                }
            }
        }
        Ok(reports)
    }

    /// Drop snapshots whose retention window has passed
    ///
    /// # Errors
    /// Returns error on I/O failure
    pub fn purge_expired_snapshots(&self) -> Result<Vec<String>, PipelineError> {
        let purged = self.ctx().transactions.purge_expired(Utc::now())?;
        if !purged.is_empty() {
            info!(count = purged.len(), "purged expired snapshots");
        }
        Ok(purged)
    }

    fn persist(&self, proposal: &mut FixProposal) -> Result<(), PipelineError> {
        Ok(self.ctx().store.save(proposal)?)
    }

    /// Feedback failures are logged, never fatal
    async fn emit(&self, proposal: &FixProposal, stage: Stage, outcome: FeedbackOutcome) {
        let event = FeedbackEvent::outcome(proposal.id, stage, outcome);
        if let Err(e) = self.ctx().feedback.emit(event).await {
            warn!(proposal_id = %proposal.id, error = %e, "feedback delivery failed");
        }
    }
}

fn bases_of(resolved: &ResolvedPatch) -> Vec<(TargetPath, Option<ContentHash>)> {
    resolved
        .files()
        .iter()
        .map(|f| (f.target.clone(), f.before_hash))
        .collect()
}

fn describe_event(event: &TransactionEvent) -> String {
    match event {
        TransactionEvent::LockAcquired { sequence } => format!("file-set lock held (sequence {sequence})"),
        TransactionEvent::SnapshotTaken { files, .. } => format!("snapshot of {files} file(s) taken"),
        TransactionEvent::FileWritten { target, hash } => format!("wrote {target} ({})", hash.short()),
        TransactionEvent::WriteFailed { target, reason } => format!("write to {target} failed: {reason}"),
        TransactionEvent::Verified => "post-apply verification passed".to_string(),
        TransactionEvent::VerificationFailed { reason } => format!("post-apply verification failed: {reason}"),
        TransactionEvent::Cancelled => "cancelled by operator".to_string(),
        TransactionEvent::FileRestored { target } => format!("restored {target}"),
        TransactionEvent::RestoreFailed { target, reason } => format!("restore of {target} failed: {reason}"),
        TransactionEvent::Committed { retain_until } => {
            format!("committed; snapshot retained until {}", retain_until.to_rfc3339())
        }
        TransactionEvent::RolledBack => "rolled back".to_string(),
    }
}

/// Rollback outcome of a `ROLLED_BACK` proposal, read from its log
fn rollback_status(proposal: &FixProposal) -> Option<RollbackStatus> {
    if proposal.state != ProposalState::RolledBack {
        return None;
    }
    let entries = proposal.decision_log.entries();
    if let Some(failed) = proposal.decision_log.last_of(Outcome::RollbackFailed) {
        return Some(RollbackStatus::Incomplete {
            reason: failed.reason.clone(),
        });
    }
    let wrote = entries.iter().any(|e| {
        matches!(
            e.detail,
            Some(EntryDetail::Transaction {
                event: TransactionEvent::FileWritten { .. }
            })
        )
    });
    let restored = entries
        .iter()
        .any(|e| matches!(e.detail, Some(EntryDetail::Rollback { .. })));
    Some(if wrote || restored {
        RollbackStatus::Restored
    } else {
        RollbackStatus::NothingWritten
    })
}
