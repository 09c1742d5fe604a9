//! Resource limits
//!
//! Enforcement of pre-declared bounds. Each check compares an observed value
//! with its bound and reports the breach as a violation.

use crate::result::{LimitKind, SandboxViolation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounds for one sandbox run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub command_timeout_ms: u64,
    pub total_timeout_ms: u64,
    /// Per-command output cap across stdout and stderr
    pub max_output_bytes: u64,
    pub max_materialized_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            command_timeout_ms: 60_000,
            total_timeout_ms: 300_000,
            max_output_bytes: 1024 * 1024,
            max_materialized_bytes: 64 * 1024 * 1024,
        }
    }
}

impl ResourceLimits {
    #[inline]
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    #[inline]
    #[must_use]
    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }

    /// Per-stream capture cap for the runner
    #[must_use]
    pub fn capture_bytes(&self) -> usize {
        usize::try_from(self.max_output_bytes).unwrap_or(usize::MAX)
    }

    /// Check bytes copied into the sandbox
    ///
    /// # Errors
    /// Returns the violation when `bytes` exceeds the bound
    pub fn check_materialized(&self, bytes: u64) -> Result<(), SandboxViolation> {
        check(LimitKind::MaterializedBytes, bytes, self.max_materialized_bytes)
    }

    /// Check output produced by one command
    ///
    /// # Errors
    /// Returns the violation when `bytes` exceeds the bound
    pub fn check_output(&self, bytes: u64) -> Result<(), SandboxViolation> {
        check(LimitKind::OutputBytes, bytes, self.max_output_bytes)
    }

    /// Check elapsed wall-clock for the whole run
    ///
    /// # Errors
    /// Returns the violation when `elapsed` reaches the bound
    pub fn check_total_time(&self, elapsed: Duration) -> Result<(), SandboxViolation> {
        let used = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        if used >= self.total_timeout_ms {
            Err(SandboxViolation::LimitExceeded {
                limit: LimitKind::TotalTimeout,
                observed: used,
                max: self.total_timeout_ms,
            })
        } else {
            Ok(())
        }
    }

    /// Timeout for the next command given time already spent
    ///
    /// Returns the kind of limit that will fire first with its duration.
    #[must_use]
    pub fn next_command_budget(&self, elapsed: Duration) -> (LimitKind, Duration) {
        let remaining = self.total_timeout().saturating_sub(elapsed);
        if remaining < self.command_timeout() {
            (LimitKind::TotalTimeout, remaining)
        } else {
            (LimitKind::CommandTimeout, self.command_timeout())
        }
    }
}

fn check(limit: LimitKind, observed: u64, max: u64) -> Result<(), SandboxViolation> {
    if observed > max {
        Err(SandboxViolation::LimitExceeded {
            limit,
            observed,
            max,
        })
    } else {
        Ok(())
    }
}
