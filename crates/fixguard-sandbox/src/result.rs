//! Sandbox outcome types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which bound was breached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    CommandTimeout,
    TotalTimeout,
    OutputBytes,
    MaterializedBytes,
}

impl LimitKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CommandTimeout => "command_timeout",
            Self::TotalTimeout => "total_timeout",
            Self::OutputBytes => "output_bytes",
            Self::MaterializedBytes => "materialized_bytes",
        }
    }
}

/// Prohibited operation observed during a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SandboxViolation {
    /// Outbound connection reached the tripwire
    NetworkAttempt { command: String, connections: usize },

    /// Executable outside the allowlist
    ProcessSpawn { program: String },

    /// Real workspace file changed, or a symlink escapes the sandbox
    WriteOutsideRoot { path: String },

    /// Wall-clock, output or materialization bound breached
    LimitExceeded {
        limit: LimitKind,
        observed: u64,
        max: u64,
    },

    /// Operator cancelled the run
    Cancelled,
}

impl fmt::Display for SandboxViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NetworkAttempt {
                command,
                connections,
            } => write!(
                f,
                "outbound network attempt during `{command}` ({connections} connection(s))"
            ),
            Self::ProcessSpawn { program } => {
                write!(f, "executable `{program}` is not allowed")
            }
            Self::WriteOutsideRoot { path } => write!(f, "write outside sandbox root: {path}"),
            Self::LimitExceeded {
                limit,
                observed,
                max,
            } => write!(f, "{} exceeded ({observed} > {max})", limit.as_str()),
            Self::Cancelled => f.write_str("cancelled by operator"),
        }
    }
}

/// One validation command as it ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub timed_out: bool,
    #[serde(default)]
    pub stdout_tail: String,
    #[serde(default)]
    pub stderr_tail: String,
}

/// Resource usage summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub wall_clock_ms: u64,
    pub files_materialized: usize,
    pub bytes_materialized: u64,
    pub commands_run: usize,
    pub output_bytes: u64,
}

/// Outcome of a sandbox run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxResult {
    pub passed: bool,
    pub violations: Vec<SandboxViolation>,
    pub commands: Vec<CommandRecord>,
    pub usage: ResourceUsage,
    /// Why the run failed, when it did
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// Sandbox directory was deleted afterwards
    pub disposed: bool,
}

impl SandboxResult {
    /// Whether a given kind of violation was observed
    #[must_use]
    pub fn has_violation(&self, pred: impl Fn(&SandboxViolation) -> bool) -> bool {
        self.violations.iter().any(pred)
    }

    #[must_use]
    pub fn was_cancelled(&self) -> bool {
        self.has_violation(|v| matches!(v, SandboxViolation::Cancelled))
    }

    /// Human-readable reason for the outcome
    #[must_use]
    pub fn reason(&self) -> String {
        if self.passed {
            return format!("{} validation command(s) passed", self.commands.len());
        }
        if let Some(v) = self.violations.first() {
            return v.to_string();
        }
        self.failure
            .clone()
            .unwrap_or_else(|| "sandbox validation failed".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn violation_serde_is_tagged() {
        let v = SandboxViolation::LimitExceeded {
            limit: LimitKind::CommandTimeout,
            observed: 120,
            max: 100,
        };
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["kind"], "limit_exceeded");
        assert_eq!(json["limit"], "command_timeout");
        assert_eq!(v.to_string(), "command_timeout exceeded (120 > 100)");
    }

    #[test]
    fn reason_prefers_first_violation() {
        let result = SandboxResult {
            passed: false,
            violations: vec![
                SandboxViolation::NetworkAttempt {
                    command: "python3 t.py".into(),
                    connections: 1,
                },
                SandboxViolation::Cancelled,
            ],
            commands: vec![],
            usage: ResourceUsage::default(),
            failure: None,
            disposed: true,
        };
        assert!(result.reason().starts_with("outbound network attempt"));
        assert!(result.was_cancelled());
    }
}
