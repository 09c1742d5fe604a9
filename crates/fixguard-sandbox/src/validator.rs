//! Sandbox validation runs
//!
//! Each run builds a fresh temporary directory, materializes the patch into
//! it, runs the configured commands one after another and deletes the
//! directory afterwards, whatever the outcome.

use crate::command::{CommandOutput, CommandRequest, CommandRunner, ValidationCommand};
use crate::error::SandboxError;
use crate::limits::ResourceLimits;
use crate::materialize::CopyPlan;
use crate::monitor::{self, WorkspaceFingerprint};
use crate::result::{CommandRecord, LimitKind, ResourceUsage, SandboxResult, SandboxViolation};
use fixguard_artifact::{ResolvedPatch, TargetPath};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Characters of output kept per stream in a command record
const OUTPUT_TAIL_CHARS: usize = 2_000;

/// What a sandbox run executes and under which bounds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxPolicy {
    pub commands: Vec<ValidationCommand>,
    /// Executable names (or exact paths) that may be spawned
    pub allowed_executables: Vec<String>,
    /// Workspace files always copied into the sandbox
    pub context_files: Vec<TargetPath>,
    #[serde(flatten)]
    pub limits: ResourceLimits,
}

impl SandboxPolicy {
    /// Add a command and allow its executable
    #[must_use]
    pub fn with_command(mut self, command: ValidationCommand) -> Self {
        if !self.permits(&command) {
            self.allowed_executables.push(command.program.clone());
        }
        self.commands.push(command);
        self
    }

    #[must_use]
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub fn with_context_file(mut self, file: TargetPath) -> Self {
        self.context_files.push(file);
        self
    }

    /// Whether `command` may be spawned
    ///
    /// The program must be listed verbatim, so an allowed bare name does not
    /// admit a same-named binary at some other path.
    #[must_use]
    pub fn permits(&self, command: &ValidationCommand) -> bool {
        self.allowed_executables.iter().any(|e| *e == command.program)
    }
}

/// Directory layout of one sandbox
struct Layout {
    work: PathBuf,
    home: PathBuf,
    tmp: PathBuf,
}

impl Layout {
    fn create(base: &Path) -> Result<Self, SandboxError> {
        // Canonical so symlink checks compare against the real location
        let base = base.canonicalize().map_err(SandboxError::Setup)?;
        let layout = Self {
            work: base.join("work"),
            home: base.join("home"),
            tmp: base.join("tmp"),
        };
        for dir in [&layout.work, &layout.home, &layout.tmp] {
            fs::create_dir_all(dir).map_err(SandboxError::Setup)?;
        }
        Ok(layout)
    }

    fn env(&self) -> Vec<(String, String)> {
        vec![
            ("HOME".to_string(), self.home.display().to_string()),
            ("TMPDIR".to_string(), self.tmp.display().to_string()),
            ("TMP".to_string(), self.tmp.display().to_string()),
            ("TEMP".to_string(), self.tmp.display().to_string()),
        ]
    }

    fn root(&self) -> &Path {
        self.work.parent().unwrap_or(self.work.as_path())
    }
}

/// Accumulates the outcome of a run
#[derive(Default)]
struct RunState {
    violations: Vec<SandboxViolation>,
    commands: Vec<CommandRecord>,
    usage: ResourceUsage,
    failure: Option<String>,
}

impl RunState {
    fn stopped(&self) -> bool {
        !self.violations.is_empty() || self.failure.is_some()
    }

    fn record(&mut self, command: &ValidationCommand, output: &CommandOutput) {
        self.usage.commands_run += 1;
        self.usage.output_bytes += output.output_bytes;
        self.commands.push(CommandRecord {
            command: command.to_string(),
            exit_code: output.exit_code,
            duration_ms: u64::try_from(output.duration.as_millis()).unwrap_or(u64::MAX),
            timed_out: output.timed_out,
            stdout_tail: output.stdout_tail(OUTPUT_TAIL_CHARS),
            stderr_tail: output.stderr_tail(OUTPUT_TAIL_CHARS),
        });
    }
}

/// Runs validation commands against a patch in a disposable copy
pub struct SandboxValidator {
    policy: SandboxPolicy,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for SandboxValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxValidator")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl SandboxValidator {
    #[must_use]
    pub fn new(policy: SandboxPolicy, runner: Arc<dyn CommandRunner>) -> Self {
        Self { policy, runner }
    }

    #[inline]
    #[must_use]
    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    /// Validate `resolved` against a copy of `workspace_root`
    ///
    /// The sandbox directory is removed before this returns, on every path.
    ///
    /// # Errors
    /// Returns error if the sandbox cannot be created or populated
    pub async fn validate(
        &self,
        resolved: &ResolvedPatch,
        workspace_root: &Path,
        cancel: &CancellationToken,
    ) -> Result<SandboxResult, SandboxError> {
        let started = Instant::now();
        let dir = tempfile::Builder::new()
            .prefix("fixguard-sandbox-")
            .tempdir()
            .map_err(SandboxError::Setup)?;

        let outcome = self.run_in(dir.path(), resolved, workspace_root, cancel).await;

        let dir_path = dir.path().to_path_buf();
        let disposed = match dir.close() {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %dir_path.display(), error = %e, "failed to dispose sandbox");
                false
            }
        };

        let mut state = outcome?;
        state.usage.wall_clock_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let passed = !state.stopped();
        let result = SandboxResult {
            passed,
            violations: state.violations,
            commands: state.commands,
            usage: state.usage,
            failure: state.failure,
            disposed,
        };
        if result.passed {
            info!(commands = result.commands.len(), "sandbox validation passed");
        } else {
            warn!(reason = %result.reason(), "sandbox validation failed");
        }
        Ok(result)
    }

    async fn run_in(
        &self,
        base: &Path,
        resolved: &ResolvedPatch,
        workspace_root: &Path,
        cancel: &CancellationToken,
    ) -> Result<RunState, SandboxError> {
        let limits = &self.policy.limits;
        let started = Instant::now();
        let mut state = RunState::default();

        let layout = Layout::create(base)?;
        let plan = CopyPlan::collect(workspace_root, resolved, &self.policy.context_files)?;
        state.usage.files_materialized = plan.file_count() + resolved.files().len();
        state.usage.bytes_materialized = plan.total_bytes();
        if let Err(v) = limits.check_materialized(plan.total_bytes()) {
            state.violations.push(v);
            return Ok(state);
        }

        // Targets are fingerprinted too: a new file must not appear in the
        // real workspace either
        let watched: Vec<TargetPath> = plan
            .sources()
            .chain(resolved.targets())
            .cloned()
            .collect();
        let fingerprint = WorkspaceFingerprint::capture(workspace_root, &watched)?;
        plan.materialize(workspace_root, &layout.work, resolved)?;
        debug!(
            files = state.usage.files_materialized,
            bytes = state.usage.bytes_materialized,
            "sandbox materialized"
        );

        for command in &self.policy.commands {
            if cancel.is_cancelled() {
                state.violations.push(SandboxViolation::Cancelled);
                break;
            }
            if !self.policy.permits(command) {
                state.violations.push(SandboxViolation::ProcessSpawn {
                    program: command.program.clone(),
                });
                break;
            }
            if let Err(v) = limits.check_total_time(started.elapsed()) {
                state.violations.push(v);
                break;
            }

            let (limit, timeout) = limits.next_command_budget(started.elapsed());
            let request = CommandRequest {
                command: command.clone(),
                cwd: layout.work.clone(),
                writable: vec![layout.root().to_path_buf()],
                env: layout.env(),
                timeout,
                max_output_bytes: limits.capture_bytes(),
            };
            let output = match self.runner.run(&request, cancel).await {
                Ok(output) => output,
                Err(e @ (SandboxError::Spawn { .. } | SandboxError::Confinement(_))) => {
                    state.failure = Some(e.to_string());
                    break;
                }
                Err(e) => return Err(e),
            };
            state.record(command, &output);

            if output.network_attempts > 0 {
                state.violations.push(SandboxViolation::NetworkAttempt {
                    command: command.to_string(),
                    connections: output.network_attempts,
                });
            }
            state.violations.extend(
                output
                    .escaped_writes
                    .iter()
                    .map(|path| SandboxViolation::WriteOutsideRoot { path: path.clone() }),
            );
            if output.cancelled {
                state.violations.push(SandboxViolation::Cancelled);
            }
            if output.timed_out {
                state.violations.push(SandboxViolation::LimitExceeded {
                    limit,
                    observed: u64::try_from(output.duration.as_millis()).unwrap_or(u64::MAX),
                    max: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
            if let Err(v) = limits.check_output(output.output_bytes) {
                state.violations.push(v);
            }
            state
                .violations
                .extend(monitor::scan(&fingerprint, layout.root())?);

            if state.stopped() {
                break;
            }
            if !output.success() {
                state.failure = Some(format!(
                    "`{command}` exited with {}",
                    output
                        .exit_code
                        .map_or_else(|| "no status".to_string(), |c| format!("code {c}"))
                ));
                break;
            }
        }

        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fixguard_artifact::{FilePatch, PatchSet};
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedRunner {
        outputs: Mutex<Vec<CommandOutput>>,
        seen: Mutex<Vec<CommandRequest>>,
    }

    impl ScriptedRunner {
        fn new(outputs: Vec<CommandOutput>) -> Arc<Self> {
            Arc::new(Self {
                outputs: Mutex::new(outputs),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(
            &self,
            request: &CommandRequest,
            _cancel: &CancellationToken,
        ) -> Result<CommandOutput, SandboxError> {
            // Patched content is visible inside the sandbox
            assert_eq!(
                fs::read_to_string(request.cwd.join("src/lib.rs")).unwrap(),
                "fn a() { }\n"
            );
            self.seen.lock().unwrap().push(request.clone());
            let mut outputs = self.outputs.lock().unwrap();
            Ok(if outputs.is_empty() {
                ok()
            } else {
                outputs.remove(0)
            })
        }
    }

    fn ok() -> CommandOutput {
        CommandOutput {
            exit_code: Some(0),
            ..CommandOutput::default()
        }
    }

    fn workspace() -> (tempfile::TempDir, ResolvedPatch) {
        let ws = tempfile::tempdir().unwrap();
        fs::create_dir_all(ws.path().join("src")).unwrap();
        fs::write(ws.path().join("src/lib.rs"), "fn a() {}\n").unwrap();
        let resolved = PatchSet::single(FilePatch::replace(
            TargetPath::new("src/lib.rs").unwrap(),
            "fn a() { }\n",
        ))
        .resolve_from(ws.path())
        .unwrap();
        (ws, resolved)
    }

    fn policy() -> SandboxPolicy {
        SandboxPolicy::default()
            .with_command(ValidationCommand::new("check", ["--all"]))
            .with_command(ValidationCommand::new("test", Vec::<String>::new()))
    }

    #[tokio::test]
    async fn passing_run_is_disposed() {
        let (ws, resolved) = workspace();
        let runner = ScriptedRunner::new(vec![]);
        let validator = SandboxValidator::new(policy(), runner.clone());
        let result = validator
            .validate(&resolved, ws.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.passed, "{}", result.reason());
        assert!(result.disposed);
        assert_eq!(result.commands.len(), 2);
        assert_eq!(result.usage.commands_run, 2);

        let seen = runner.seen.lock().unwrap();
        assert!(!seen[0].cwd.exists());
        assert!(seen[0].env.iter().any(|(k, _)| k == "HOME"));
        assert_eq!(fs::read_to_string(ws.path().join("src/lib.rs")).unwrap(), "fn a() {}\n");
    }

    #[tokio::test]
    async fn network_attempt_fails_run() {
        let (ws, resolved) = workspace();
        let runner = ScriptedRunner::new(vec![CommandOutput {
            network_attempts: 1,
            ..ok()
        }]);
        let result = SandboxValidator::new(policy(), runner)
            .validate(&resolved, ws.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.passed);
        assert!(matches!(
            result.violations[0],
            SandboxViolation::NetworkAttempt { connections: 1, .. }
        ));
        assert_eq!(result.commands.len(), 1);
    }

    #[tokio::test]
    async fn escaped_write_fails_run() {
        let (ws, resolved) = workspace();
        let runner = ScriptedRunner::new(vec![CommandOutput {
            escaped_writes: vec!["/tmp/dropped".into()],
            ..ok()
        }]);
        let result = SandboxValidator::new(policy(), runner.clone())
            .validate(&resolved, ws.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.passed);
        assert_eq!(
            result.violations,
            vec![SandboxViolation::WriteOutsideRoot {
                path: "/tmp/dropped".into()
            }]
        );
        let seen = runner.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].cwd.starts_with(&seen[0].writable[0]));
    }

    #[tokio::test]
    async fn disallowed_executable_is_never_spawned() {
        let (ws, resolved) = workspace();
        let runner = ScriptedRunner::new(vec![]);
        let mut policy = policy();
        policy.commands.push(ValidationCommand::new("curl", ["http://example.com"]));
        let result = SandboxValidator::new(policy, runner.clone())
            .validate(&resolved, ws.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.passed);
        assert_eq!(
            result.violations,
            vec![SandboxViolation::ProcessSpawn {
                program: "curl".into()
            }]
        );
        assert_eq!(runner.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn timeout_is_a_limit_violation() {
        let (ws, resolved) = workspace();
        let runner = ScriptedRunner::new(vec![CommandOutput {
            exit_code: None,
            timed_out: true,
            duration: Duration::from_millis(60_000),
            ..CommandOutput::default()
        }]);
        let result = SandboxValidator::new(policy(), runner)
            .validate(&resolved, ws.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.passed);
        assert!(matches!(
            result.violations[0],
            SandboxViolation::LimitExceeded {
                limit: LimitKind::CommandTimeout,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn failing_command_stops_run() {
        let (ws, resolved) = workspace();
        let runner = ScriptedRunner::new(vec![CommandOutput {
            exit_code: Some(1),
            stderr: b"error[E0308]: mismatched types".to_vec(),
            ..CommandOutput::default()
        }]);
        let result = SandboxValidator::new(policy(), runner)
            .validate(&resolved, ws.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.passed);
        assert!(result.violations.is_empty());
        assert_eq!(result.reason(), "`check --all` exited with code 1");
        assert_eq!(result.commands[0].stderr_tail, "error[E0308]: mismatched types");
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let (ws, resolved) = workspace();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = SandboxValidator::new(policy(), ScriptedRunner::new(vec![]))
            .validate(&resolved, ws.path(), &cancel)
            .await
            .unwrap();
        assert!(result.was_cancelled());
        assert!(result.commands.is_empty());
        assert!(result.disposed);
    }

    #[tokio::test]
    async fn oversized_tree_is_rejected_before_running() {
        let (ws, resolved) = workspace();
        let policy = policy().with_limits(ResourceLimits {
            max_materialized_bytes: 4,
            ..ResourceLimits::default()
        });
        let result = SandboxValidator::new(policy, ScriptedRunner::new(vec![]))
            .validate(&resolved, ws.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(
            result.violations[0],
            SandboxViolation::LimitExceeded {
                limit: LimitKind::MaterializedBytes,
                ..
            }
        ));
        assert!(result.commands.is_empty());
    }
}
