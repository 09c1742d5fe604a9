//! Post-apply verification command

use async_trait::async_trait;
use fixguard_sandbox::{CommandRequest, CommandRunner, ValidationCommand};
use fixguard_transaction::{PostApplyVerifier, VerifyError};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Output kept in a failure reason
const TAIL_CHARS: usize = 500;

/// Runs one command in the workspace root; a non-zero exit rolls back
pub struct CommandVerifier {
    command: ValidationCommand,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
    max_output_bytes: usize,
}

impl std::fmt::Debug for CommandVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandVerifier")
            .field("command", &self.command)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl CommandVerifier {
    #[must_use]
    pub fn new(command: ValidationCommand, runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self {
            command,
            runner,
            timeout,
            max_output_bytes: 1024 * 1024,
        }
    }
}

#[async_trait]
impl PostApplyVerifier for CommandVerifier {
    async fn verify(&self, root: &Path, cancel: &CancellationToken) -> Result<(), VerifyError> {
        let request = CommandRequest {
            command: self.command.clone(),
            cwd: root.to_path_buf(),
            writable: vec![root.to_path_buf()],
            env: Vec::new(),
            timeout: self.timeout,
            max_output_bytes: self.max_output_bytes,
        };
        debug!(command = %self.command, "running post-apply verification");
        let output = self
            .runner
            .run(&request, cancel)
            .await
            .map_err(|e| VerifyError(format!("`{}` could not run: {e}", self.command)))?;

        if output.cancelled {
            return Err(VerifyError("verification cancelled".into()));
        }
        if output.timed_out {
            return Err(VerifyError(format!(
                "`{}` exceeded {:?}",
                self.command, self.timeout
            )));
        }
        if !output.success() {
            let reason = format!(
                "`{}` exited with {:?}: {}",
                self.command,
                output.exit_code,
                output.stderr_tail(TAIL_CHARS).trim()
            );
            warn!(%reason, "post-apply verification failed");
            return Err(VerifyError(reason));
        }
        Ok(())
    }
}
