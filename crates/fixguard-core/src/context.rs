//! Pipeline context
//!
//! Everything the stages share (configuration, collaborators, the file-set
//! lock and the stores) lives in one explicit value handed to the pipeline.
//! Nothing is process-global.

use crate::approval::{ApprovalController, Decision, ReviewError, Reviewer};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::feedback::{FeedbackSink, NullFeedback};
use crate::proposal::FixProposal;
use crate::safeguard::EmergencySafeguard;
use crate::store::ProposalStore;
use crate::verifier::CommandVerifier;
use async_trait::async_trait;
use fixguard_classifier::{ThreatClassifier, ThreatLibrary};
use fixguard_sandbox::{CommandRunner, ProcessRunner, SandboxValidator};
use fixguard_transaction::{NoopVerifier, PostApplyVerifier, TransactionConfig, TransactionManager};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Reviewer used when none is configured: every review fails closed
#[derive(Debug, Clone, Copy)]
struct NoReviewer;

#[async_trait]
impl Reviewer for NoReviewer {
    async fn present(&self, _proposal: &FixProposal) -> Result<Decision, ReviewError> {
        Err(ReviewError::Unavailable("no reviewer configured".into()))
    }
}

/// Shared state of one pipeline
pub struct PipelineContext {
    pub(crate) config: PipelineConfig,
    pub(crate) classifier: Arc<ThreatClassifier>,
    pub(crate) approval: ApprovalController,
    pub(crate) sandbox: SandboxValidator,
    pub(crate) safeguard: EmergencySafeguard,
    pub(crate) transactions: TransactionManager,
    pub(crate) store: ProposalStore,
    pub(crate) feedback: Arc<dyn FeedbackSink>,
    pub(crate) verifier: Arc<dyn PostApplyVerifier>,
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PipelineContext {
    #[must_use]
    pub fn builder(config: PipelineConfig) -> ContextBuilder {
        ContextBuilder::new(config)
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn classifier(&self) -> &ThreatClassifier {
        &self.classifier
    }

    #[inline]
    #[must_use]
    pub fn store(&self) -> &ProposalStore {
        &self.store
    }

    #[inline]
    #[must_use]
    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    #[inline]
    #[must_use]
    pub fn feedback(&self) -> &dyn FeedbackSink {
        self.feedback.as_ref()
    }
}

/// Assembles a [`PipelineContext`]; collaborators not supplied get
/// fail-closed or no-op defaults
pub struct ContextBuilder {
    config: PipelineConfig,
    reviewer: Option<Arc<dyn Reviewer>>,
    runner: Option<Arc<dyn CommandRunner>>,
    feedback: Option<Arc<dyn FeedbackSink>>,
    verifier: Option<Arc<dyn PostApplyVerifier>>,
    library: Option<ThreatLibrary>,
    review_timeout: Option<Duration>,
}

impl ContextBuilder {
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            reviewer: None,
            runner: None,
            feedback: None,
            verifier: None,
            library: None,
            review_timeout: None,
        }
    }

    #[must_use]
    pub fn with_reviewer(mut self, reviewer: Arc<dyn Reviewer>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    /// Runner for sandbox commands and the post-apply command
    #[must_use]
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    #[must_use]
    pub fn with_feedback(mut self, feedback: Arc<dyn FeedbackSink>) -> Self {
        self.feedback = Some(feedback);
        self
    }

    /// Overrides the verifier built from `[post_apply]`
    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn PostApplyVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    #[must_use]
    pub fn with_library(mut self, library: ThreatLibrary) -> Self {
        self.library = Some(library);
        self
    }

    /// Finer-grained than `review_timeout_secs`
    #[must_use]
    pub fn with_review_timeout(mut self, timeout: Duration) -> Self {
        self.review_timeout = Some(timeout);
        self
    }

    /// Validate the configuration and open the stores
    ///
    /// # Errors
    /// Returns error on invalid configuration or if the state directory
    /// cannot be opened
    pub fn build(self) -> Result<PipelineContext, PipelineError> {
        let Self {
            config,
            reviewer,
            runner,
            feedback,
            verifier,
            library,
            review_timeout,
        } = self;
        config.validate()?;

        let mut classifier = ThreatClassifier::new(config.classifier.clone());
        if let Some(library) = library {
            classifier = classifier.with_library(library);
        }
        let classifier = Arc::new(classifier);

        let runner: Arc<dyn CommandRunner> = runner.unwrap_or_else(|| Arc::new(ProcessRunner::new()));
        let verifier: Arc<dyn PostApplyVerifier> = match (verifier, &config.post_apply.command) {
            (Some(verifier), _) => verifier,
            (None, Some(command)) => Arc::new(CommandVerifier::new(
                command.clone(),
                Arc::clone(&runner),
                config.post_apply_timeout(),
            )),
            (None, None) => Arc::new(NoopVerifier),
        };

        let store = ProposalStore::open(&config.state_dir)?;
        let next_sequence = store
            .list()?
            .iter()
            .filter_map(|p| p.approval().map(|(_, sequence, _)| sequence))
            .max()
            .map_or(1, |max| max + 1);
        debug!(next_sequence, state_dir = %config.state_dir.display(), "opened proposal store");

        let transactions = TransactionManager::new(
            config.workspace_root.clone(),
            &config.state_dir,
            TransactionConfig {
                lock_timeout: config.lock.timeout(),
                retention: config.snapshot_retention(),
            },
        )?;

        let approval = ApprovalController::new(
            Arc::clone(&classifier),
            reviewer.unwrap_or_else(|| Arc::new(NoReviewer)),
            config.auto_approve_threshold,
            review_timeout.unwrap_or_else(|| config.review_timeout()),
            Arc::new(AtomicU64::new(next_sequence)),
        );

        Ok(PipelineContext {
            sandbox: SandboxValidator::new(config.sandbox.clone(), runner),
            safeguard: EmergencySafeguard::new(Arc::clone(&classifier)),
            approval,
            classifier,
            transactions,
            store,
            feedback: feedback.unwrap_or_else(|| Arc::new(NullFeedback)),
            verifier,
            config,
        })
    }
}
