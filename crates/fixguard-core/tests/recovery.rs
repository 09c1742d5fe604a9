//! Crash recovery and resumption.
//!
//! A pipeline task is aborted while its apply is in flight to stand in for a
//! process crash; a fresh pipeline over the same state directory then
//! recovers. Covers:
//! - All-or-nothing file state after recovery.
//! - Proposals stuck in APPLYING are settled.
//! - Settling one proposal leaves other in-flight transactions alone.
//! - Requeued proposals resume without re-running earlier stages.

use fixguard_artifact::TargetPath;
use fixguard_core::{
    Issue, Outcome, Pipeline, ProposalState, RollbackStatus, SandboxPolicy, Stage, SuggestedPatch,
    TerminalStatus, ValidationCommand,
};
use fixguard_test_utils::{
    context, cosmetic_issue, BlockingVerifier, RecordingFeedback, ScriptedReviewer, ScriptedRunner,
    TestWorkspace,
};
use fixguard_transaction::JournalRecord;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const FILES: [(&str, &str, &str); 3] = [
    ("a.py", "A = 1\n", "A  =  1\n"),
    ("b.py", "B = 1\n", "B  =  1\n"),
    ("c.py", "C = 1\n", "C  =  1\n"),
];

fn three_file_issue() -> Issue {
    let mut issue = cosmetic_issue("LINT-3", FILES[0].0, FILES[0].2);
    for (file, _, after) in &FILES[1..] {
        issue = issue.with_file(
            *file,
            SuggestedPatch::Replace {
                content: (*after).to_string(),
            },
        );
    }
    issue
}

/// Run a three-file proposal until its writes are done, then abort it
async fn crash_mid_apply(ws: &TestWorkspace) -> anyhow::Result<fixguard_core::ProposalId> {
    for (file, before, _) in FILES {
        ws.write(file, before)?;
    }
    let verifier = Arc::new(BlockingVerifier::default());
    let pipeline = Pipeline::new(
        context(
            ws.config(),
            ScriptedReviewer::approving(),
            ScriptedRunner::passing(),
            RecordingFeedback::new(),
        )
        .with_verifier(verifier.clone())
        .build()?,
    );
    let proposal = pipeline.propose(three_file_issue())?;
    let id = proposal.id;

    let running = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.process_one(proposal).await })
    };
    verifier.entered.notified().await;
    running.abort();
    let _ = running.await;
    assert_eq!(pipeline.load(id)?.state, ProposalState::Applying);
    Ok(id)
}

fn restarted(ws: &TestWorkspace) -> anyhow::Result<Pipeline> {
    Ok(Pipeline::new(
        context(
            ws.config(),
            ScriptedReviewer::approving(),
            ScriptedRunner::passing(),
            RecordingFeedback::new(),
        )
        .build()?,
    ))
}

/// Tenet: after a crash mid-apply, recovery leaves every file pre-patch.
///
/// Covers every combination of files the crash may have left written or
/// unwritten: recovery never leaves a mixed state.
#[tokio::test]
async fn recovery_is_all_or_nothing() -> anyhow::Result<()> {
    for written in 0u8..8 {
        let ws = TestWorkspace::new()?;
        let id = crash_mid_apply(&ws).await?;
        // Simulate a crash that happened before some writes
        for (bit, (file, before, _)) in FILES.iter().enumerate() {
            if written & (1 << bit) == 0 {
                ws.write(file, before)?;
            }
        }

        let pipeline = restarted(&ws)?;
        let reports = pipeline.recover().await?;

        assert_eq!(reports.len(), 1, "mask {written:03b}");
        assert_eq!(reports[0].proposal_id, id);
        assert_eq!(reports[0].status, Some(TerminalStatus::RolledBack));
        assert_eq!(reports[0].rollback, Some(RollbackStatus::Restored));
        for (file, before, _) in FILES {
            assert_eq!(ws.read(file)?, before, "{file} with mask {written:03b}");
        }
        assert!(pipeline.context().transactions().journal().open_records()?.is_empty());
    }
    Ok(())
}

/// Tenet: recovery is repeatable and settles the proposal exactly once.
#[tokio::test]
async fn second_recovery_finds_nothing() -> anyhow::Result<()> {
    let ws = TestWorkspace::new()?;
    let id = crash_mid_apply(&ws).await?;
    let pipeline = restarted(&ws)?;

    assert_eq!(pipeline.recover().await?.len(), 1);
    assert!(pipeline.recover().await?.is_empty());

    let stored = pipeline.load(id)?;
    assert_eq!(stored.state, ProposalState::RolledBack);
    assert_eq!(stored.decision_log.last().map(|e| e.stage), Some(Stage::Operator));
    stored.decision_log.verify_integrity()?;
    Ok(())
}

/// Tenet: a proposal handed back in APPLYING is reconciled, not re-applied.
#[tokio::test]
async fn resubmitted_applying_proposal_is_reconciled() -> anyhow::Result<()> {
    let ws = TestWorkspace::new()?;
    let id = crash_mid_apply(&ws).await?;
    let pipeline = restarted(&ws)?;

    let report = pipeline.process_one(pipeline.load(id)?).await;

    assert_eq!(report.status, Some(TerminalStatus::RolledBack));
    for (file, before, _) in FILES {
        assert_eq!(ws.read(file)?, before);
    }
    Ok(())
}

/// Tenet: reconciling one proposal leaves other in-flight transactions
/// alone.
#[tokio::test]
async fn reconcile_touches_only_its_own_transaction() -> anyhow::Result<()> {
    let ws = TestWorkspace::new()?;
    let id = crash_mid_apply(&ws).await?;
    let pipeline = restarted(&ws)?;

    // Another transaction is mid-write on a different file
    ws.write("live.py", "L = 0\n")?;
    let tx = pipeline.context().transactions();
    let targets = vec![TargetPath::new("live.py")?];
    let snapshot = tx.snapshots().capture("live", "live", ws.root(), &targets)?;
    tx.journal().begin(&JournalRecord {
        txn_id: "live".into(),
        snapshot_id: snapshot.id.clone(),
        proposal_id: "live".into(),
        targets,
        started_at: snapshot.created_at,
    })?;
    ws.write("live.py", "L = 1\n")?;

    let report = pipeline.process_one(pipeline.load(id)?).await;
    assert_eq!(report.status, Some(TerminalStatus::RolledBack));
    for (file, before, _) in FILES {
        assert_eq!(ws.read(file)?, before);
    }
    assert_eq!(ws.read("live.py")?, "L = 1\n");
    assert!(tx.journal().is_open("live"));
    Ok(())
}

/// Tenet: a requeued proposal resumes where it stopped.
///
/// After a lock timeout the proposal stays SANDBOX_PASSED. A restarted
/// pipeline commits it without asking the reviewer or re-running the
/// sandbox.
#[tokio::test]
async fn requeued_proposal_resumes_at_apply() -> anyhow::Result<()> {
    let ws = TestWorkspace::new()?;
    ws.write("app.py", "x = 1\n")?;
    let policy = SandboxPolicy::default().with_command(ValidationCommand::new("pytest", ["-q"]));
    let mut config = ws.config().with_sandbox(policy.clone());
    config.lock.timeout_ms = 30;
    config.lock.max_retries = 1;
    let first = Pipeline::new(
        context(
            config,
            ScriptedReviewer::approving(),
            ScriptedRunner::passing(),
            RecordingFeedback::new(),
        )
        .build()?,
    );
    let proposal = first.propose(Issue::replace("BUG-1", "app.py", "fix", "x = 2\n"))?;
    let held = first
        .context()
        .transactions()
        .acquire(0, vec![TargetPath::new("app.py")?], &CancellationToken::new())
        .await?;
    let batch = first.process(vec![proposal.clone()]).await;
    drop(held);

    assert_eq!(batch.requeued, vec![proposal.id]);
    assert_eq!(batch.reports[0].status, None);
    let parked = first.load(proposal.id)?;
    assert_eq!(parked.state, ProposalState::SandboxPassed);
    assert!(parked.decision_log.last_of(Outcome::LockTimeout).is_some());

    let reviewer = ScriptedReviewer::rejecting("must not be asked again");
    let runner = ScriptedRunner::passing();
    let second = Pipeline::new(
        context(
            ws.config().with_sandbox(policy),
            Arc::clone(&reviewer),
            Arc::clone(&runner),
            RecordingFeedback::new(),
        )
        .build()?,
    );
    let report = second.process_one(second.load(proposal.id)?).await;

    assert_eq!(report.status, Some(TerminalStatus::Committed), "{}", report.reason);
    assert_eq!(ws.read("app.py")?, "x = 2\n");
    assert!(reviewer.presented().is_empty());
    assert!(runner.requests().is_empty());
    Ok(())
}

/// Tenet: snapshots inside their retention window survive a purge.
#[tokio::test]
async fn purge_keeps_retained_snapshots() -> anyhow::Result<()> {
    let ws = TestWorkspace::new()?;
    ws.write("app.py", "x = 1\n")?;
    let (pipeline, _) = fixguard_test_utils::permissive_pipeline(&ws)?;
    let proposal = pipeline.propose(cosmetic_issue("LINT-9", "app.py", "x  =  1\n"))?;
    pipeline.process_one(proposal.clone()).await;

    assert!(pipeline.purge_expired_snapshots()?.is_empty());
    let rolled_back = pipeline.rollback(proposal.id).await?;
    assert_eq!(rolled_back.status, Some(TerminalStatus::RolledBack));
    Ok(())
}
