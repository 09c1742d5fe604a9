//! Validation commands and the runner seam

use crate::error::SandboxError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Argv-style command, never interpreted by a shell
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidationCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ValidationCommand {
    #[must_use]
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a whitespace-separated command line (no quoting)
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program, parts))
    }

    /// Final path component of the program
    #[must_use]
    pub fn executable_name(&self) -> &str {
        self.program
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(self.program.as_str())
    }

    /// Whether the program is given as a path rather than a bare name
    #[must_use]
    pub fn is_path(&self) -> bool {
        self.program.contains(['/', '\\'])
    }
}

impl fmt::Display for ValidationCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Everything a runner needs to execute one command
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub command: ValidationCommand,
    /// Working directory (the sandbox root, or the workspace for post-apply checks)
    pub cwd: PathBuf,
    /// Directories the command may write; `cwd` alone when empty
    pub writable: Vec<PathBuf>,
    /// Extra environment on top of the runner's minimal base
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
    /// Captured bytes kept per stream
    pub max_output_bytes: usize,
}

impl CommandRequest {
    /// Writable directories, defaulting to the working directory
    #[must_use]
    pub fn writable_dirs(&self) -> Vec<PathBuf> {
        if self.writable.is_empty() {
            vec![self.cwd.clone()]
        } else {
            self.writable.clone()
        }
    }
}

/// What happened when a command ran
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed or died from a signal
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Total bytes produced on both streams, including discarded ones
    pub output_bytes: u64,
    pub duration: Duration,
    pub timed_out: bool,
    pub cancelled: bool,
    /// Connections seen by the tripwire or refused by the network namespace
    pub network_attempts: usize,
    /// Paths written outside the writable directories
    pub escaped_writes: Vec<String>,
}

impl CommandOutput {
    /// Exited normally with status 0
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }

    /// Last `max` characters of stdout, lossily decoded
    #[must_use]
    pub fn stdout_tail(&self, max: usize) -> String {
        tail(&self.stdout, max)
    }

    /// Last `max` characters of stderr, lossily decoded
    #[must_use]
    pub fn stderr_tail(&self, max: usize) -> String {
        tail(&self.stderr, max)
    }
}

fn tail(bytes: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let count = text.chars().count();
    if count <= max {
        return text.into_owned();
    }
    text.chars().skip(count - max).collect()
}

/// Executes validation commands
///
/// Implementations must stop the command when `cancel` fires or the request
/// timeout elapses, and report that in the output rather than as an error.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run one command to completion
    ///
    /// # Errors
    /// Returns error only when the command could not be started
    async fn run(
        &self,
        request: &CommandRequest,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, SandboxError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let cmd = ValidationCommand::parse("  cargo   check --quiet ").unwrap();
        assert_eq!(cmd.program, "cargo");
        assert_eq!(cmd.args, vec!["check", "--quiet"]);
        assert_eq!(cmd.to_string(), "cargo check --quiet");
        assert!(ValidationCommand::parse("   ").is_none());
    }

    #[test]
    fn executable_name_strips_directories() {
        let cmd = ValidationCommand::new("/usr/bin/python3", ["-m", "py_compile"]);
        assert_eq!(cmd.executable_name(), "python3");
        assert!(cmd.is_path());
        assert!(!ValidationCommand::new("python3", Vec::<String>::new()).is_path());
    }

    #[test]
    fn tails_keep_the_end() {
        let out = CommandOutput {
            stdout: b"0123456789".to_vec(),
            exit_code: Some(0),
            ..CommandOutput::default()
        };
        assert_eq!(out.stdout_tail(4), "6789");
        assert_eq!(out.stdout_tail(40), "0123456789");
        assert!(out.success());
    }
}
