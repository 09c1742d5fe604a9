//! Transaction manager
//!
//! Applies a set of file writes under a held [`FileSetGuard`]:
//!
//! 1. Validate every write (lock coverage, safe path, expected base)
//! 2. Persist a snapshot, then a journal record
//! 3. Write each file atomically
//! 4. Run the post-apply verifier
//! 5. Commit (manifest marked committed, journal cleared) or restore every
//!    file from the snapshot
//!
//! The caller keeps the guard for the whole call, so partially written
//! state is never visible to another transaction.

use crate::error::TransactionError;
use crate::fsops::{atomic_write, check_write_path};
use crate::journal::{Journal, JournalRecord};
use crate::lock::{FileSetGuard, FileSetLock};
use crate::snapshot::{Snapshot, SnapshotState, SnapshotStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fixguard_artifact::{read_optional, ContentHash, ResolvedPatch, TargetPath};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Transaction manager configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionConfig {
    /// Longest wait for the file-set lock
    pub lock_timeout: Duration,
    /// How long a committed snapshot stays available for manual rollback
    pub retention: Duration,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(30),
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// One file to write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileWrite {
    pub target: TargetPath,
    /// On-disk content the bytes were computed against (`None` = absent)
    pub expected_base: Option<ContentHash>,
    pub content: Vec<u8>,
}

/// Everything a transaction writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyRequest {
    pub proposal_id: String,
    pub writes: Vec<FileWrite>,
}

impl ApplyRequest {
    /// Writes taken from resolved bytes, with their bases as preconditions
    #[must_use]
    pub fn from_resolved(proposal_id: impl Into<String>, resolved: &ResolvedPatch) -> Self {
        let writes = resolved
            .files()
            .iter()
            .map(|file| FileWrite {
                target: file.target.clone(),
                expected_base: file.before_hash,
                content: file.after.clone(),
            })
            .collect();
        Self {
            proposal_id: proposal_id.into(),
            writes,
        }
    }

    pub fn targets(&self) -> impl Iterator<Item = &TargetPath> {
        self.writes.iter().map(|w| &w.target)
    }
}

/// Post-apply check failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct VerifyError(pub String);

/// Check run in place after every file is written
#[async_trait]
pub trait PostApplyVerifier: Send + Sync {
    /// # Errors
    /// Returns [`VerifyError`] to roll the transaction back
    async fn verify(&self, root: &Path, cancel: &CancellationToken) -> Result<(), VerifyError>;
}

/// Verifier that accepts everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopVerifier;

#[async_trait]
impl PostApplyVerifier for NoopVerifier {
    async fn verify(&self, _root: &Path, _cancel: &CancellationToken) -> Result<(), VerifyError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransactionEvent {
    LockAcquired { sequence: u64 },
    SnapshotTaken { snapshot_id: String, files: usize },
    FileWritten { target: TargetPath, hash: ContentHash },
    WriteFailed { target: TargetPath, reason: String },
    Verified,
    VerificationFailed { reason: String },
    Cancelled,
    FileRestored { target: TargetPath },
    RestoreFailed { target: TargetPath, reason: String },
    Committed { retain_until: DateTime<Utc> },
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransactionOutcome {
    Committed,
    /// Every file was restored from the snapshot
    RolledBack { reason: String },
    /// Some files could not be restored; the journal record is kept
    RollbackFailed {
        reason: String,
        failures: Vec<TargetPath>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReport {
    pub txn_id: String,
    pub snapshot_id: String,
    pub outcome: TransactionOutcome,
    pub events: Vec<TransactionEvent>,
}

impl TransactionReport {
    #[inline]
    #[must_use]
    pub fn committed(&self) -> bool {
        matches!(self.outcome, TransactionOutcome::Committed)
    }
}

/// Result of a manual rollback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RollbackReport {
    Restored { files: Vec<TargetPath> },
    /// Snapshot was already restored; nothing was touched
    AlreadyRestored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// Files restored to their pre-transaction content
    Restored { files: Vec<TargetPath> },
    /// Crash happened after the commit point; files are post-patch
    AlreadyCommitted,
    /// Restore failed for these files; the record is kept for another try
    Failed { failures: Vec<TargetPath> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveredTransaction {
    pub txn_id: String,
    pub proposal_id: String,
    pub outcome: RecoveryOutcome,
}

/// Snapshot, apply, verify, commit or roll back
#[derive(Debug)]
pub struct TransactionManager {
    root: PathBuf,
    snapshots: SnapshotStore,
    journal: Journal,
    lock: Arc<FileSetLock>,
    config: TransactionConfig,
}

impl TransactionManager {
    /// Manager for files under `root`, persisting under `state_dir`
    ///
    /// # Errors
    /// Returns error if the state directories cannot be created
    pub fn new(
        root: impl Into<PathBuf>,
        state_dir: &Path,
        config: TransactionConfig,
    ) -> Result<Self, TransactionError> {
        Ok(Self {
            root: root.into(),
            snapshots: SnapshotStore::open(state_dir)?,
            journal: Journal::open(state_dir)?,
            lock: FileSetLock::new(),
            config,
        })
    }

    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn lock(&self) -> &Arc<FileSetLock> {
        &self.lock
    }

    #[inline]
    #[must_use]
    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    #[inline]
    #[must_use]
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Wait for the file-set lock over `targets`
    ///
    /// # Errors
    /// Returns [`TransactionError::LockTimeout`] after the configured wait,
    /// or [`TransactionError::Cancelled`]
    pub async fn acquire(
        &self,
        sequence: u64,
        targets: impl IntoIterator<Item = TargetPath>,
        cancel: &CancellationToken,
    ) -> Result<FileSetGuard, TransactionError> {
        tokio::select! {
            () = cancel.cancelled() => Err(TransactionError::Cancelled),
            granted = self.lock.acquire(sequence, targets, self.config.lock_timeout) => {
                granted.map_err(|e| TransactionError::LockTimeout { waited: e.waited })
            }
        }
    }

    /// Apply `request` under `guard`
    ///
    /// Returns a report for every transaction that reached the snapshot;
    /// a rollback is an `Ok` report with a non-committed outcome.
    ///
    /// # Errors
    /// Returns error only when nothing was written
    pub async fn apply(
        &self,
        guard: &FileSetGuard,
        request: &ApplyRequest,
        verifier: &dyn PostApplyVerifier,
        cancel: &CancellationToken,
    ) -> Result<TransactionReport, TransactionError> {
        self.preflight(guard, request)?;
        if cancel.is_cancelled() {
            return Err(TransactionError::Cancelled);
        }

        let txn_id = request.proposal_id.clone();
        match self.snapshots.load(&txn_id) {
            Ok(existing) if existing.is_active() => {
                return Err(TransactionError::SnapshotInFlight(txn_id));
            }
            Ok(_) | Err(TransactionError::SnapshotNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let targets: Vec<TargetPath> = request.targets().cloned().collect();
        let mut snapshot =
            self.snapshots
                .capture(&txn_id, &request.proposal_id, &self.root, &targets)?;
        self.journal.begin(&JournalRecord {
            txn_id: txn_id.clone(),
            snapshot_id: snapshot.id.clone(),
            proposal_id: request.proposal_id.clone(),
            targets,
            started_at: snapshot.created_at,
        })?;

        let mut events = vec![
            TransactionEvent::LockAcquired {
                sequence: guard.sequence(),
            },
            TransactionEvent::SnapshotTaken {
                snapshot_id: snapshot.id.clone(),
                files: snapshot.files.len(),
            },
        ];
        info!(txn_id = %txn_id, files = request.writes.len(), "applying transaction");

        let failure = self.write_and_verify(request, &snapshot, verifier, cancel, &mut events).await;

        let outcome = match failure {
            None => match self.commit(&mut snapshot, request, &mut events) {
                Ok(()) => TransactionOutcome::Committed,
                // Journal still open: recover() will restore
                Err(e) => self.roll_back(&snapshot, e.to_string(), &mut events),
            },
            Some(reason) => self.roll_back(&snapshot, reason, &mut events),
        };

        Ok(TransactionReport {
            txn_id,
            snapshot_id: snapshot.id,
            outcome,
            events,
        })
    }

    fn preflight(&self, guard: &FileSetGuard, request: &ApplyRequest) -> Result<(), TransactionError> {
        for write in &request.writes {
            if !guard.covers(&write.target) {
                return Err(TransactionError::NotLocked(write.target.clone()));
            }
            check_write_path(&self.root, &write.target)?;
            let path = write.target.resolve(&self.root);
            let actual = read_optional(&path)
                .map_err(TransactionError::io(&path))?
                .map(|bytes| ContentHash::compute(&bytes));
            if actual != write.expected_base {
                return Err(TransactionError::StaleBase {
                    target: write.target.clone(),
                    expected: write.expected_base,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Returns the failure reason, if any
    async fn write_and_verify(
        &self,
        request: &ApplyRequest,
        snapshot: &Snapshot,
        verifier: &dyn PostApplyVerifier,
        cancel: &CancellationToken,
        events: &mut Vec<TransactionEvent>,
    ) -> Option<String> {
        for (write, image) in request.writes.iter().zip(&snapshot.files) {
            if cancel.is_cancelled() {
                events.push(TransactionEvent::Cancelled);
                return Some("cancelled during apply".to_string());
            }
            let path = write.target.resolve(&self.root);
            if let Err(e) = atomic_write(&path, &write.content, image.mode) {
                let reason = format!("writing {} failed: {e}", write.target);
                events.push(TransactionEvent::WriteFailed {
                    target: write.target.clone(),
                    reason: e.to_string(),
                });
                return Some(reason);
            }
            events.push(TransactionEvent::FileWritten {
                target: write.target.clone(),
                hash: ContentHash::compute(&write.content),
            });
        }

        let verdict = tokio::select! {
            () = cancel.cancelled() => None,
            verdict = verifier.verify(&self.root, cancel) => Some(verdict),
        };
        match verdict {
            None => {
                events.push(TransactionEvent::Cancelled);
                Some("cancelled during post-apply verification".to_string())
            }
            Some(Ok(())) => {
                events.push(TransactionEvent::Verified);
                None
            }
            Some(Err(e)) => {
                events.push(TransactionEvent::VerificationFailed { reason: e.0.clone() });
                Some(format!("post-apply verification failed: {e}"))
            }
        }
    }

    /// The manifest write is the commit point
    fn commit(
        &self,
        snapshot: &mut Snapshot,
        request: &ApplyRequest,
        events: &mut Vec<TransactionEvent>,
    ) -> Result<(), TransactionError> {
        let retain_until = retain_until(Utc::now(), self.config.retention);
        for (image, write) in snapshot.files.iter_mut().zip(&request.writes) {
            image.after = Some(ContentHash::compute(&write.content));
        }
        snapshot.state = SnapshotState::Committed { retain_until };
        self.snapshots.save(snapshot)?;
        if let Err(e) = self.journal.complete(&snapshot.id) {
            // Recovery sees the committed manifest and only clears the record
            warn!(txn_id = %snapshot.id, error = %e, "could not clear journal record");
        }
        events.push(TransactionEvent::Committed { retain_until });
        info!(txn_id = %snapshot.id, "transaction committed");
        Ok(())
    }

    fn roll_back(
        &self,
        snapshot: &Snapshot,
        reason: String,
        events: &mut Vec<TransactionEvent>,
    ) -> TransactionOutcome {
        warn!(txn_id = %snapshot.id, %reason, "rolling back transaction");
        let failures = self.restore_all(snapshot, events);
        if !failures.is_empty() {
            error!(txn_id = %snapshot.id, failed = failures.len(), "rollback incomplete; left for recovery");
            return TransactionOutcome::RollbackFailed { reason, failures };
        }

        let now = Utc::now();
        let mut restored = snapshot.clone();
        restored.state = SnapshotState::Restored { at: now, retain_until: now };
        let finalized = self
            .snapshots
            .save(&restored)
            .and_then(|()| self.journal.complete(&snapshot.id));
        if let Err(e) = finalized {
            // Files are already restored; a later recover() repeats the restore
            warn!(txn_id = %snapshot.id, error = %e, "could not finalize rolled back transaction");
        }
        events.push(TransactionEvent::RolledBack);
        TransactionOutcome::RolledBack { reason }
    }

    /// Restore every file in reverse order, returning the ones that failed
    fn restore_all(&self, snapshot: &Snapshot, events: &mut Vec<TransactionEvent>) -> Vec<TargetPath> {
        let mut failures = Vec::new();
        for image in snapshot.files.iter().rev() {
            match self.snapshots.restore_file(&snapshot.id, &self.root, image) {
                Ok(()) => events.push(TransactionEvent::FileRestored {
                    target: image.target.clone(),
                }),
                Err(e) => {
                    error!(txn_id = %snapshot.id, target = %image.target, error = %e, "restore failed");
                    events.push(TransactionEvent::RestoreFailed {
                        target: image.target.clone(),
                        reason: e.to_string(),
                    });
                    failures.push(image.target.clone());
                }
            }
        }
        failures
    }

    /// Restore a committed transaction from its retained snapshot
    ///
    /// # Errors
    /// - [`TransactionError::SnapshotNotFound`] if it was never taken or
    ///   has been purged
    /// - [`TransactionError::SnapshotInFlight`] if the transaction has not
    ///   finished
    /// - [`TransactionError::Diverged`] if a file changed after commit
    /// - [`TransactionError::RollbackIncomplete`] if some files could not be
    ///   restored
    pub async fn rollback(
        &self,
        snapshot_id: &str,
        sequence: u64,
        cancel: &CancellationToken,
    ) -> Result<RollbackReport, TransactionError> {
        let snapshot = self.snapshots.load(snapshot_id)?;
        let retain_until = match snapshot.state {
            SnapshotState::Restored { .. } => return Ok(RollbackReport::AlreadyRestored),
            SnapshotState::Active => {
                return Err(TransactionError::SnapshotInFlight(snapshot_id.to_string()));
            }
            SnapshotState::Committed { retain_until } => retain_until,
        };

        let _guard = self.acquire(sequence, snapshot.targets().cloned(), cancel).await?;

        // Re-read under the lock: a concurrent rollback may have finished
        let mut snapshot = self.snapshots.load(snapshot_id)?;
        if matches!(snapshot.state, SnapshotState::Restored { .. }) {
            return Ok(RollbackReport::AlreadyRestored);
        }

        for image in &snapshot.files {
            let path = image.target.resolve(&self.root);
            check_write_path(&self.root, &image.target)?;
            let current = read_optional(&path)
                .map_err(TransactionError::io(&path))?
                .map(|bytes| ContentHash::compute(&bytes));
            if current != image.after {
                return Err(TransactionError::Diverged {
                    target: image.target.clone(),
                });
            }
        }

        let mut events = Vec::new();
        let failures = self.restore_all(&snapshot, &mut events);
        if !failures.is_empty() {
            return Err(TransactionError::RollbackIncomplete {
                id: snapshot_id.to_string(),
                failed: failures.len(),
            });
        }

        snapshot.state = SnapshotState::Restored {
            at: Utc::now(),
            retain_until,
        };
        self.snapshots.save(&snapshot)?;
        info!(snapshot_id, files = snapshot.files.len(), "manual rollback restored snapshot");
        Ok(RollbackReport::Restored {
            files: snapshot.targets().cloned().collect(),
        })
    }

    /// Finish every transaction a crash left in flight
    ///
    /// Each one ends all pre-patch (restored) or all post-patch (already
    /// committed).
    ///
    /// # Errors
    /// Returns error if the journal cannot be read, or a record points at a
    /// snapshot that cannot be loaded
    pub async fn recover(&self) -> Result<Vec<RecoveredTransaction>, TransactionError> {
        let records = self.journal.open_records()?;
        let mut recovered = Vec::with_capacity(records.len());
        for record in records {
            if let Some(done) = self.recover_record(record).await? {
                recovered.push(done);
            }
        }
        Ok(recovered)
    }

    /// Finish the interrupted transaction `txn_id` only
    ///
    /// Other in-flight transactions are left to their owners. `None` when
    /// `txn_id` is not in flight.
    ///
    /// # Errors
    /// Same as [`recover`](Self::recover)
    pub async fn recover_one(&self, txn_id: &str) -> Result<Option<RecoveredTransaction>, TransactionError> {
        match self.journal.record(txn_id)? {
            Some(record) => self.recover_record(record).await,
            None => Ok(None),
        }
    }

    async fn recover_record(
        &self,
        record: JournalRecord,
    ) -> Result<Option<RecoveredTransaction>, TransactionError> {
        let never = CancellationToken::new();
        let _guard = self.acquire(0, record.targets.iter().cloned(), &never).await?;
        // Finalized by its owner while the lock was awaited
        if !self.journal.is_open(&record.txn_id) {
            return Ok(None);
        }
        let snapshot = self.snapshots.load(&record.snapshot_id)?;

        let outcome = if let SnapshotState::Committed { .. } = snapshot.state {
            self.journal.complete(&record.txn_id)?;
            RecoveryOutcome::AlreadyCommitted
        } else {
            let mut events = Vec::new();
            let failures = self.restore_all(&snapshot, &mut events);
            if failures.is_empty() {
                let now = Utc::now();
                let mut restored = snapshot.clone();
                restored.state = SnapshotState::Restored { at: now, retain_until: now };
                self.snapshots.save(&restored)?;
                self.journal.complete(&record.txn_id)?;
                RecoveryOutcome::Restored {
                    files: snapshot.targets().cloned().collect(),
                }
            } else {
                RecoveryOutcome::Failed { failures }
            }
        };

        info!(txn_id = %record.txn_id, outcome = ?outcome, "recovered in-flight transaction");
        Ok(Some(RecoveredTransaction {
            txn_id: record.txn_id,
            proposal_id: record.proposal_id,
            outcome,
        }))
    }

    /// Discard snapshots whose retention ended at or before `now`
    ///
    /// # Errors
    /// Returns error on I/O failure
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>, TransactionError> {
        self.snapshots.purge_expired(now)
    }
}

fn retain_until(now: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Fixture {
        root: tempfile::TempDir,
        state: tempfile::TempDir,
        manager: TransactionManager,
    }

    impl Fixture {
        fn new(files: &[(&str, &str)]) -> Self {
            let root = tempfile::tempdir().unwrap();
            let state = tempfile::tempdir().unwrap();
            for (name, content) in files {
                let path = root.path().join(name);
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                fs::write(path, content).unwrap();
            }
            let manager =
                TransactionManager::new(root.path(), state.path(), TransactionConfig::default())
                    .unwrap();
            Self { root, state, manager }
        }

        fn read(&self, name: &str) -> Option<String> {
            fs::read_to_string(self.root.path().join(name)).ok()
        }

        fn request(&self, id: &str, writes: &[(&str, &str)]) -> ApplyRequest {
            ApplyRequest {
                proposal_id: id.to_string(),
                writes: writes
                    .iter()
                    .map(|(name, content)| {
                        let target = TargetPath::new(name).unwrap();
                        let expected_base = read_optional(&target.resolve(self.root.path()))
                            .unwrap()
                            .map(|b| ContentHash::compute(&b));
                        FileWrite {
                            target,
                            expected_base,
                            content: content.as_bytes().to_vec(),
                        }
                    })
                    .collect(),
            }
        }

        async fn run(
            &self,
            request: &ApplyRequest,
            verifier: &dyn PostApplyVerifier,
        ) -> TransactionReport {
            let cancel = CancellationToken::new();
            let guard = self
                .manager
                .acquire(1, request.targets().cloned(), &cancel)
                .await
                .unwrap();
            self.manager.apply(&guard, request, verifier, &cancel).await.unwrap()
        }
    }

    struct Reject;

    #[async_trait]
    impl PostApplyVerifier for Reject {
        async fn verify(&self, _root: &Path, _cancel: &CancellationToken) -> Result<(), VerifyError> {
            Err(VerifyError("build broke".into()))
        }
    }

    #[tokio::test]
    async fn commit_writes_every_file() {
        let fx = Fixture::new(&[("a.txt", "a0"), ("b/b.txt", "b0")]);
        let request = fx.request("p1", &[("a.txt", "a1"), ("b/b.txt", "b1"), ("c.txt", "c1")]);
        let report = fx.run(&request, &NoopVerifier).await;

        assert!(report.committed());
        assert_eq!(fx.read("a.txt").as_deref(), Some("a1"));
        assert_eq!(fx.read("b/b.txt").as_deref(), Some("b1"));
        assert_eq!(fx.read("c.txt").as_deref(), Some("c1"));
        assert!(fx.manager.journal().open_records().unwrap().is_empty());
        assert!(matches!(
            fx.manager.snapshots().load("p1").unwrap().state,
            SnapshotState::Committed { .. }
        ));
    }

    #[tokio::test]
    async fn failed_verification_restores_every_file() {
        let fx = Fixture::new(&[("a.txt", "a0"), ("b.txt", "b0")]);
        let request = fx.request("p1", &[("a.txt", "a1"), ("b.txt", "b1"), ("new.txt", "n")]);
        let report = fx.run(&request, &Reject).await;

        assert!(matches!(report.outcome, TransactionOutcome::RolledBack { .. }));
        assert_eq!(fx.read("a.txt").as_deref(), Some("a0"));
        assert_eq!(fx.read("b.txt").as_deref(), Some("b0"));
        assert_eq!(fx.read("new.txt"), None);

        let written = report
            .events
            .iter()
            .filter(|e| matches!(e, TransactionEvent::FileWritten { .. }))
            .count();
        let restored = report
            .events
            .iter()
            .filter(|e| matches!(e, TransactionEvent::FileRestored { .. }))
            .count();
        assert_eq!((written, restored), (3, 3));
        assert_eq!(report.events.last(), Some(&TransactionEvent::RolledBack));
    }

    #[tokio::test]
    async fn stale_base_writes_nothing() {
        let fx = Fixture::new(&[("a.txt", "a0"), ("b.txt", "b0")]);
        let request = fx.request("p1", &[("a.txt", "a1"), ("b.txt", "b1")]);
        fs::write(fx.root.path().join("b.txt"), "edited meanwhile").unwrap();

        let cancel = CancellationToken::new();
        let guard = fx
            .manager
            .acquire(1, request.targets().cloned(), &cancel)
            .await
            .unwrap();
        let err = fx
            .manager
            .apply(&guard, &request, &NoopVerifier, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TransactionError::StaleBase { .. }));
        assert_eq!(fx.read("a.txt").as_deref(), Some("a0"));
        assert!(matches!(
            fx.manager.snapshots().load("p1"),
            Err(TransactionError::SnapshotNotFound(_))
        ));
    }

    #[tokio::test]
    async fn unlocked_target_is_refused() {
        let fx = Fixture::new(&[("a.txt", "a0"), ("b.txt", "b0")]);
        let request = fx.request("p1", &[("a.txt", "a1"), ("b.txt", "b1")]);
        let cancel = CancellationToken::new();
        let guard = fx
            .manager
            .acquire(1, [TargetPath::new("a.txt").unwrap()], &cancel)
            .await
            .unwrap();
        let err = fx
            .manager
            .apply(&guard, &request, &NoopVerifier, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TransactionError::NotLocked(_)));
    }

    struct CancelDuringVerify(CancellationToken);

    #[async_trait]
    impl PostApplyVerifier for CancelDuringVerify {
        async fn verify(&self, _root: &Path, cancel: &CancellationToken) -> Result<(), VerifyError> {
            self.0.cancel();
            cancel.cancelled().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn cancellation_during_apply_rolls_back() {
        let fx = Fixture::new(&[("a.txt", "a0")]);
        let request = fx.request("p1", &[("a.txt", "a1")]);
        let cancel = CancellationToken::new();
        let guard = fx
            .manager
            .acquire(1, request.targets().cloned(), &cancel)
            .await
            .unwrap();
        let report = fx
            .manager
            .apply(&guard, &request, &CancelDuringVerify(cancel.clone()), &cancel)
            .await
            .unwrap();
        assert!(matches!(report.outcome, TransactionOutcome::RolledBack { .. }));
        assert!(report.events.contains(&TransactionEvent::Cancelled));
        assert_eq!(fx.read("a.txt").as_deref(), Some("a0"));
    }

    #[tokio::test]
    async fn manual_rollback_is_idempotent() {
        let fx = Fixture::new(&[("a.txt", "a0")]);
        let request = fx.request("p1", &[("a.txt", "a1"), ("new.txt", "n")]);
        assert!(fx.run(&request, &NoopVerifier).await.committed());

        let cancel = CancellationToken::new();
        let first = fx.manager.rollback("p1", 2, &cancel).await.unwrap();
        assert!(matches!(first, RollbackReport::Restored { ref files } if files.len() == 2));
        assert_eq!(fx.read("a.txt").as_deref(), Some("a0"));
        assert_eq!(fx.read("new.txt"), None);

        let second = fx.manager.rollback("p1", 3, &cancel).await.unwrap();
        assert_eq!(second, RollbackReport::AlreadyRestored);
        assert_eq!(fx.read("a.txt").as_deref(), Some("a0"));
    }

    #[tokio::test]
    async fn manual_rollback_refuses_diverged_file() {
        let fx = Fixture::new(&[("a.txt", "a0")]);
        let request = fx.request("p1", &[("a.txt", "a1")]);
        assert!(fx.run(&request, &NoopVerifier).await.committed());
        fs::write(fx.root.path().join("a.txt"), "later edit").unwrap();

        let err = fx
            .manager
            .rollback("p1", 2, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransactionError::Diverged { .. }));
        assert_eq!(fx.read("a.txt").as_deref(), Some("later edit"));
    }

    #[tokio::test]
    async fn recover_restores_interrupted_transaction() {
        let fx = Fixture::new(&[("a.txt", "a0"), ("b.txt", "b0")]);
        let targets = vec![TargetPath::new("a.txt").unwrap(), TargetPath::new("b.txt").unwrap()];

        // Crash after the first of two writes
        let snapshot = fx
            .manager
            .snapshots()
            .capture("p1", "p1", fx.root.path(), &targets)
            .unwrap();
        fx.manager
            .journal()
            .begin(&JournalRecord {
                txn_id: "p1".into(),
                snapshot_id: snapshot.id.clone(),
                proposal_id: "p1".into(),
                targets: targets.clone(),
                started_at: snapshot.created_at,
            })
            .unwrap();
        atomic_write(&fx.root.path().join("a.txt"), b"a1", None).unwrap();

        let restarted =
            TransactionManager::new(fx.root.path(), fx.state.path(), TransactionConfig::default())
                .unwrap();
        let recovered = restarted.recover().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert!(matches!(recovered[0].outcome, RecoveryOutcome::Restored { .. }));
        assert_eq!(fx.read("a.txt").as_deref(), Some("a0"));
        assert_eq!(fx.read("b.txt").as_deref(), Some("b0"));
        assert!(restarted.recover().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recover_one_leaves_other_transactions() {
        let fx = Fixture::new(&[("a.txt", "a0"), ("b.txt", "b0")]);
        for (id, name, written) in [("p1", "a.txt", "a1"), ("p2", "b.txt", "b1")] {
            let targets = vec![TargetPath::new(name).unwrap()];
            let snapshot = fx
                .manager
                .snapshots()
                .capture(id, id, fx.root.path(), &targets)
                .unwrap();
            fx.manager
                .journal()
                .begin(&JournalRecord {
                    txn_id: id.into(),
                    snapshot_id: snapshot.id.clone(),
                    proposal_id: id.into(),
                    targets,
                    started_at: snapshot.created_at,
                })
                .unwrap();
            atomic_write(&fx.root.path().join(name), written.as_bytes(), None).unwrap();
        }

        let recovered = fx.manager.recover_one("p1").await.unwrap().unwrap();
        assert_eq!(recovered.proposal_id, "p1");
        assert!(matches!(recovered.outcome, RecoveryOutcome::Restored { .. }));
        assert_eq!(fx.read("a.txt").as_deref(), Some("a0"));
        assert_eq!(fx.read("b.txt").as_deref(), Some("b1"));
        assert!(fx.manager.journal().is_open("p2"));
        assert!(fx.manager.recover_one("p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recover_keeps_committed_transaction() {
        let fx = Fixture::new(&[("a.txt", "a0")]);
        let request = fx.request("p1", &[("a.txt", "a1")]);
        assert!(fx.run(&request, &NoopVerifier).await.committed());

        // Crash between the commit point and clearing the journal
        let snapshot = fx.manager.snapshots().load("p1").unwrap();
        fx.manager
            .journal()
            .begin(&JournalRecord {
                txn_id: "p1".into(),
                snapshot_id: "p1".into(),
                proposal_id: "p1".into(),
                targets: snapshot.targets().cloned().collect(),
                started_at: snapshot.created_at,
            })
            .unwrap();

        let recovered = fx.manager.recover().await.unwrap();
        assert_eq!(recovered[0].outcome, RecoveryOutcome::AlreadyCommitted);
        assert_eq!(fx.read("a.txt").as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn overlapping_transactions_never_write_concurrently() {
        let fx = Arc::new(Fixture::new(&[("shared.txt", "0")]));
        let writing = Arc::new(AtomicBool::new(false));

        struct Probe(Arc<AtomicBool>);

        #[async_trait]
        impl PostApplyVerifier for Probe {
            async fn verify(&self, _root: &Path, _c: &CancellationToken) -> Result<(), VerifyError> {
                assert!(!self.0.swap(true, Ordering::SeqCst), "two writers inside the lock");
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.0.store(false, Ordering::SeqCst);
                Ok(())
            }
        }

        let mut tasks = Vec::new();
        for seq in 1..=4u64 {
            let fx = Arc::clone(&fx);
            let writing = Arc::clone(&writing);
            tasks.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                let target = TargetPath::new("shared.txt").unwrap();
                let guard = fx.manager.acquire(seq, [target.clone()], &cancel).await.unwrap();
                // Resolve under the lock so the base is current
                let content = seq.to_string();
                let request = fx.request(&format!("p{seq}"), &[("shared.txt", content.as_str())]);
                fx.manager
                    .apply(&guard, &request, &Probe(writing), &cancel)
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().committed());
        }
    }
}
