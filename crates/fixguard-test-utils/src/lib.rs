//! Testing utilities for FixGuard workspace
//!
//! Shared fixtures, scripted collaborators and tamper helpers.

#![allow(missing_docs)]

use async_trait::async_trait;
use fixguard_core::{
    ContextBuilder, Decision, DecisionLog, EntryDetail, FeedbackError, FeedbackEvent,
    FeedbackOutcome, FeedbackSink, FixProposal, Issue, Pipeline, PipelineConfig, PipelineContext,
    ProposalId, ProposalStore, ReviewError, Reviewer, RiskTier,
};
use fixguard_sandbox::{CommandOutput, CommandRequest, CommandRunner, SandboxError};
use fixguard_transaction::{PostApplyVerifier, VerifyError};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Disposable workspace plus state directory
#[derive(Debug)]
pub struct TestWorkspace {
    root: TempDir,
    state: TempDir,
}

impl TestWorkspace {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            root: tempfile::tempdir()?,
            state: tempfile::tempdir()?,
        })
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn state_dir(&self) -> &Path {
        self.state.path()
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.path().join(rel)
    }

    /// Write a workspace file, creating parent directories
    pub fn write(&self, rel: &str, content: &str) -> anyhow::Result<()> {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    pub fn read(&self, rel: &str) -> anyhow::Result<String> {
        Ok(fs::read_to_string(self.path(rel))?)
    }

    /// Configuration rooted at this workspace with fast lock retries
    pub fn config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::new(self.root()).with_state_dir(self.state_dir());
        config.lock.timeout_ms = 200;
        config.lock.backoff_ms = 10;
        config
    }
}

/// Context builder wired with scripted collaborators
pub fn context(
    config: PipelineConfig,
    reviewer: Arc<ScriptedReviewer>,
    runner: Arc<ScriptedRunner>,
    feedback: Arc<RecordingFeedback>,
) -> ContextBuilder {
    PipelineContext::builder(config)
        .with_reviewer(reviewer)
        .with_runner(runner)
        .with_feedback(feedback)
}

/// Pipeline that approves every review and passes every command
pub fn permissive_pipeline(ws: &TestWorkspace) -> anyhow::Result<(Pipeline, Arc<RecordingFeedback>)> {
    let feedback = RecordingFeedback::new();
    let ctx = context(
        ws.config(),
        ScriptedReviewer::approving(),
        ScriptedRunner::passing(),
        Arc::clone(&feedback),
    )
    .build()?;
    Ok((Pipeline::new(ctx), feedback))
}

// ---------------------------------------------------------------------------
// Issues
// ---------------------------------------------------------------------------

/// Whitespace-only replacement with confidence 99
pub fn cosmetic_issue(id: &str, file: &str, content: &str) -> Issue {
    Issue::replace(id, file, "whitespace cleanup", content).with_confidence(99)
}

/// Replacement that introduces a shell call
pub fn shell_issue(id: &str, file: &str) -> Issue {
    Issue::replace(
        id,
        file,
        "run cleanup script",
        "import os\n\ndef cleanup(path):\n    os.system(\"rm -rf \" + path)\n",
    )
    .with_confidence(99)
}

/// Replacement that introduces an outbound HTTP call
pub fn network_issue(id: &str, file: &str) -> Issue {
    Issue::replace(
        id,
        file,
        "fetch remote defaults",
        "import requests\n\ndef defaults():\n    return requests.get(\"https://example.com/d\").json()\n",
    )
}

// ---------------------------------------------------------------------------
// Reviewer
// ---------------------------------------------------------------------------

/// Reviewer answering from a queue; `fallback` once the queue is empty
pub struct ScriptedReviewer {
    decisions: Mutex<VecDeque<Decision>>,
    fallback: Option<Decision>,
    delay: Option<Duration>,
    presented: Mutex<Vec<ProposalId>>,
}

impl ScriptedReviewer {
    pub fn new(decisions: impl IntoIterator<Item = Decision>) -> Arc<Self> {
        Arc::new(Self {
            decisions: Mutex::new(decisions.into_iter().collect()),
            fallback: None,
            delay: None,
            presented: Mutex::new(Vec::new()),
        })
    }

    pub fn approving() -> Arc<Self> {
        Arc::new(Self {
            decisions: Mutex::new(VecDeque::new()),
            fallback: Some(Decision::approve()),
            delay: None,
            presented: Mutex::new(Vec::new()),
        })
    }

    pub fn rejecting(comment: &str) -> Arc<Self> {
        Arc::new(Self {
            decisions: Mutex::new(VecDeque::new()),
            fallback: Some(Decision::reject(comment)),
            delay: None,
            presented: Mutex::new(Vec::new()),
        })
    }

    /// Never answers within any reasonable review timeout
    pub fn silent() -> Arc<Self> {
        Arc::new(Self {
            decisions: Mutex::new(VecDeque::new()),
            fallback: Some(Decision::approve()),
            delay: Some(Duration::from_secs(3600)),
            presented: Mutex::new(Vec::new()),
        })
    }

    /// Proposals shown to the reviewer, in order
    pub fn presented(&self) -> Vec<ProposalId> {
        self.presented.lock().clone()
    }
}

impl std::fmt::Debug for ScriptedReviewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedReviewer")
            .field("queued", &self.decisions.lock().len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Reviewer for ScriptedReviewer {
    async fn present(&self, proposal: &FixProposal) -> Result<Decision, ReviewError> {
        self.presented.lock().push(proposal.id);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.decisions.lock().pop_front();
        next.or_else(|| self.fallback.clone())
            .ok_or_else(|| ReviewError::Unavailable("script exhausted".into()))
    }
}

// ---------------------------------------------------------------------------
// Command runner
// ---------------------------------------------------------------------------

/// One scripted command result
#[derive(Debug, Clone)]
pub enum Step {
    Output(CommandOutput),
    /// Runs until the request timeout or cancellation
    Hang,
}

/// Successful exit
pub fn ok() -> CommandOutput {
    CommandOutput {
        exit_code: Some(0),
        ..CommandOutput::default()
    }
}

/// Non-zero exit with `stderr`
pub fn exit(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(code),
        stderr: stderr.as_bytes().to_vec(),
        output_bytes: stderr.len() as u64,
        ..CommandOutput::default()
    }
}

/// Successful exit that tripped the network tripwire
pub fn network(connections: usize) -> CommandOutput {
    CommandOutput {
        network_attempts: connections,
        ..ok()
    }
}

/// Runner answering from a script; exits 0 once the script is exhausted
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    script: Mutex<VecDeque<Step>>,
    seen: Mutex<Vec<CommandRequest>>,
}

impl ScriptedRunner {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into_iter().collect()),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn passing() -> Arc<Self> {
        Self::new([])
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<CommandRequest> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        request: &CommandRequest,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, SandboxError> {
        self.seen.lock().push(request.clone());
        let step = self.script.lock().pop_front();
        match step.unwrap_or_else(|| Step::Output(ok())) {
            Step::Output(output) => Ok(output),
            Step::Hang => {
                let started = tokio::time::Instant::now();
                let cancelled = tokio::select! {
                    () = cancel.cancelled() => true,
                    () = tokio::time::sleep(request.timeout) => false,
                };
                Ok(CommandOutput {
                    exit_code: None,
                    duration: started.elapsed(),
                    timed_out: !cancelled,
                    cancelled,
                    ..CommandOutput::default()
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Post-apply verifiers
// ---------------------------------------------------------------------------

/// Fails every verification with `reason`
#[derive(Debug, Clone)]
pub struct FailingVerifier {
    pub reason: String,
}

#[async_trait]
impl PostApplyVerifier for FailingVerifier {
    async fn verify(&self, _root: &Path, _cancel: &CancellationToken) -> Result<(), VerifyError> {
        Err(VerifyError(self.reason.clone()))
    }
}

/// Holds each apply open for `hold` and records the peak number of
/// applies inside verification at once
#[derive(Debug, Default)]
pub struct OverlapProbe {
    hold: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl OverlapProbe {
    pub fn new(hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            hold,
            ..Self::default()
        })
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PostApplyVerifier for OverlapProbe {
    async fn verify(&self, _root: &Path, _cancel: &CancellationToken) -> Result<(), VerifyError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Waits until cancelled, then fails
#[derive(Debug, Default)]
pub struct BlockingVerifier {
    pub entered: tokio::sync::Notify,
}

#[async_trait]
impl PostApplyVerifier for BlockingVerifier {
    async fn verify(&self, _root: &Path, cancel: &CancellationToken) -> Result<(), VerifyError> {
        self.entered.notify_one();
        cancel.cancelled().await;
        Err(VerifyError("cancelled".into()))
    }
}

// ---------------------------------------------------------------------------
// Feedback
// ---------------------------------------------------------------------------

/// Records every event; optional per-issue seeds
#[derive(Debug, Default)]
pub struct RecordingFeedback {
    events: Mutex<Vec<FeedbackEvent>>,
    seeds: Mutex<HashMap<String, u8>>,
}

impl RecordingFeedback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_seed(self: &Arc<Self>, issue_id: &str, seed: u8) -> Arc<Self> {
        self.seeds.lock().insert(issue_id.to_string(), seed);
        Arc::clone(self)
    }

    pub fn events(&self) -> Vec<FeedbackEvent> {
        self.events.lock().clone()
    }

    pub fn outcomes_for(&self, id: ProposalId) -> Vec<FeedbackOutcome> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.proposal_id == id)
            .map(|e| e.outcome)
            .collect()
    }
}

#[async_trait]
impl FeedbackSink for RecordingFeedback {
    async fn emit(&self, event: FeedbackEvent) -> Result<(), FeedbackError> {
        self.events.lock().push(event);
        Ok(())
    }

    fn seed(&self, issue: &Issue) -> Option<u8> {
        self.seeds.lock().get(&issue.id).copied()
    }
}

// ---------------------------------------------------------------------------
// Tampering
// ---------------------------------------------------------------------------

/// Edit a persisted proposal record in place, bypassing the pipeline
pub fn tamper_record(
    store: &ProposalStore,
    id: ProposalId,
    edit: impl FnOnce(&mut serde_json::Value),
) -> anyhow::Result<()> {
    let path = store.path_of(id);
    let mut record: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path)?)?;
    edit(&mut record);
    fs::write(&path, serde_json::to_vec_pretty(&record)?)?;
    Ok(())
}

/// Replace the text of the `index`th file patch in a persisted record
pub fn swap_patch_text(
    store: &ProposalStore,
    id: ProposalId,
    index: usize,
    text: &str,
) -> anyhow::Result<()> {
    let mut found = false;
    tamper_record(store, id, |record| {
        if let Some(slot) = record.pointer_mut(&format!("/patch/{index}/content/text")) {
            *slot = serde_json::Value::String(text.to_string());
            found = true;
        }
    })?;
    anyhow::ensure!(found, "proposal {id} has no replacement patch at {index}");
    Ok(())
}

/// Swap a patch's text and rebuild the decision log around it
///
/// Every link is recomputed through [`DecisionLog::append`], so the forged
/// log passes its own integrity check. Approval and sandbox digests point
/// at the new content, and recorded classifications are raised to HIGH so
/// the swapped text never outranks them. Only the record file is rewritten;
/// the audit log keeps what the pipeline appended.
pub fn forge_log(
    store: &ProposalStore,
    root: &Path,
    id: ProposalId,
    index: usize,
    text: &str,
) -> anyhow::Result<()> {
    swap_patch_text(store, id, index, text)?;
    let mut proposal = store.load(id)?;
    let patch_digest = proposal.patch.digest();
    let resolved_digest = proposal.patch.resolve_from(root)?.digest();

    let mut forged = DecisionLog::new(id);
    for entry in proposal.decision_log.entries() {
        let detail = entry.detail.clone().map(|detail| match detail {
            EntryDetail::Classification {
                safety_score,
                matched,
                critical_match,
                fail_closed,
                ..
            } => EntryDetail::Classification {
                risk_tier: RiskTier::High,
                safety_score,
                matched,
                critical_match,
                fail_closed,
            },
            EntryDetail::Approval {
                sequence,
                automatic,
                reviewer,
                comment,
                ..
            } => EntryDetail::Approval {
                patch_digest,
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
                resolved_digest,
                bases,
                commands,
                violations,
                wall_clock_ms,
            },
            other => other,
        });
        forged.append(entry.stage, entry.outcome, entry.reason.clone(), detail);
    }
    anyhow::ensure!(forged.verify_integrity().is_ok(), "forged log does not verify");
    proposal.decision_log = forged;
    proposal.risk_tier = Some(RiskTier::High);
    fs::write(store.path_of(id), serde_json::to_vec_pretty(&proposal)?)?;
    Ok(())
}
