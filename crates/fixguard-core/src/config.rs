//! Pipeline configuration
//!
//! Loaded from TOML; every field has a default. No setting disables the
//! emergency safeguard.

use fixguard_classifier::ClassifierConfig;
use fixguard_sandbox::{SandboxPolicy, ValidationCommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// File-set lock acquisition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub timeout_ms: u64,
    /// Retries after the first timeout before the proposal is requeued
    pub max_retries: u32,
    /// Base backoff, doubled on each retry
    pub backoff_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_retries: 3,
            backoff_ms: 500,
        }
    }
}

impl LockConfig {
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Backoff before retry number `attempt` (0-based)
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(16)).unwrap_or(u64::MAX);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

/// Check run in the workspace after every write, inside the transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostApplyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<ValidationCommand>,
    pub timeout_ms: u64,
}

impl Default for PostApplyConfig {
    fn default() -> Self {
        Self {
            command: None,
            timeout_ms: 60_000,
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Files proposals patch live under here
    pub workspace_root: PathBuf,
    /// Proposal records, audit log, snapshots and journal
    pub state_dir: PathBuf,
    /// Minimum safety score for auto-approval
    pub auto_approve_threshold: u8,
    pub default_safety_seed: u8,
    pub max_parallel: usize,
    pub review_timeout_secs: u64,
    pub snapshot_retention_secs: u64,
    pub classifier: ClassifierConfig,
    pub sandbox: SandboxPolicy,
    pub lock: LockConfig,
    pub post_apply: PostApplyConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            state_dir: PathBuf::from(".fixguard"),
            auto_approve_threshold: 95,
            default_safety_seed: 80,
            max_parallel: 4,
            review_timeout_secs: 3_600,
            snapshot_retention_secs: 24 * 3_600,
            classifier: ClassifierConfig::default(),
            sandbox: SandboxPolicy::default(),
            lock: LockConfig::default(),
            post_apply: PostApplyConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Defaults rooted at `workspace_root`, with state under
    /// `<workspace_root>/.fixguard`
    #[must_use]
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        Self {
            state_dir: workspace_root.join(".fixguard"),
            workspace_root,
            ..Self::default()
        }
    }

    /// Parse and validate TOML
    ///
    /// # Errors
    /// Returns error on malformed TOML or invalid values
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    ///
    /// # Errors
    /// Returns error if the file cannot be read or is invalid
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// # Errors
    /// Returns [`ConfigError::Invalid`] naming the first bad value
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.auto_approve_threshold > 100 {
            return invalid("auto_approve_threshold must be within 0..=100");
        }
        if self.default_safety_seed > 100 {
            return invalid("default_safety_seed must be within 0..=100");
        }
        if self.max_parallel == 0 {
            return invalid("max_parallel must be at least 1");
        }
        if self.review_timeout_secs == 0 {
            return invalid("review_timeout_secs must be positive");
        }
        if self.lock.timeout_ms == 0 {
            return invalid("lock.timeout_ms must be positive");
        }
        if self.post_apply.timeout_ms == 0 {
            return invalid("post_apply.timeout_ms must be positive");
        }
        let limits = &self.sandbox.limits;
        if limits.command_timeout_ms == 0 || limits.total_timeout_ms == 0 {
            return invalid("sandbox timeouts must be positive");
        }
        if !self.sandbox.commands.is_empty() && self.sandbox.allowed_executables.is_empty() {
            return invalid("sandbox.allowed_executables is empty but commands are configured");
        }
        if let Some(command) = self.sandbox.commands.iter().find(|c| !self.sandbox.permits(c)) {
            return Err(ConfigError::Invalid(format!(
                "sandbox command `{command}` is not in allowed_executables"
            )));
        }
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn with_state_dir(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.state_dir = state_dir.into();
        self
    }

    #[inline]
    #[must_use]
    pub fn with_threshold(mut self, threshold: u8) -> Self {
        self.auto_approve_threshold = threshold;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_review_timeout(mut self, timeout: Duration) -> Self {
        self.review_timeout_secs = timeout.as_secs().max(1);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_sandbox(mut self, sandbox: SandboxPolicy) -> Self {
        self.sandbox = sandbox;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    #[must_use]
    pub fn with_post_apply(mut self, command: ValidationCommand) -> Self {
        self.post_apply.command = Some(command);
        self
    }

    #[inline]
    #[must_use]
    pub fn review_timeout(&self) -> Duration {
        Duration::from_secs(self.review_timeout_secs)
    }

    #[inline]
    #[must_use]
    pub fn snapshot_retention(&self) -> Duration {
        Duration::from_secs(self.snapshot_retention_secs)
    }

    #[inline]
    #[must_use]
    pub fn post_apply_timeout(&self) -> Duration {
        Duration::from_millis(self.post_apply.timeout_ms)
    }
}
