//! Subprocess runner with a network tripwire
//!
//! Commands run with a cleared environment and a restricted `PATH`, inside
//! the runner's [`Confinement`]. Every proxy variable points at a loopback
//! listener owned by the run. Unconfined, any connection it receives is
//! counted as an outbound network attempt; confined, the proxy is
//! unreachable and the refused connection is counted by the namespace
//! instead.

use crate::command::{CommandOutput, CommandRequest, CommandRunner};
use crate::confine::{Confinement, ConfinementReport};
use crate::error::SandboxError;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[cfg(unix)]
const SAFE_PATH_DIRS: &[&str] = &["/usr/local/bin", "/usr/bin", "/bin"];

#[cfg(windows)]
const SAFE_PATH_DIRS: &[&str] = &[r"C:\Windows\System32", r"C:\Windows"];

const PROXY_VARS: &[&str] = &[
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "ALL_PROXY",
    "FTP_PROXY",
    "http_proxy",
    "https_proxy",
    "all_proxy",
    "ftp_proxy",
];

/// How long stream readers may outlive the process (grandchildren can hold
/// the pipes open)
const READER_GRACE: Duration = Duration::from_secs(2);

/// How long to wait for queued tripwire connections after a command ends
const TRIPWIRE_DRAIN: Duration = Duration::from_millis(20);

/// Stderr kept when confinement fails
const REPORT_ERROR_CHARS: usize = 300;

/// Loopback listener counting connection attempts
#[derive(Debug)]
pub struct Tripwire {
    listener: Arc<TcpListener>,
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl Tripwire {
    /// Bind on an ephemeral loopback port and start counting
    ///
    /// # Errors
    /// Returns error if the listener cannot be bound
    pub async fn start() -> Result<Self, SandboxError> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(SandboxError::Tripwire)?;
        let addr = listener.local_addr().map_err(SandboxError::Tripwire)?;
        let listener = Arc::new(listener);
        let hits = Arc::new(AtomicUsize::new(0));

        let accept = Arc::clone(&listener);
        let counter = Arc::clone(&hits);
        let task = tokio::spawn(async move {
            while let Ok((stream, peer)) = accept.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                warn!(%peer, "network tripwire hit");
                drop(stream);
            }
        });

        Ok(Self {
            listener,
            addr,
            hits,
            task,
        })
    }

    #[inline]
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Value exported in the proxy variables
    #[must_use]
    pub fn proxy_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Connections counted so far
    #[must_use]
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// Stop listening and return the final count, including connections
    /// still queued in the backlog
    pub async fn finish(self) -> usize {
        self.task.abort();
        while let Ok(Ok(_)) = tokio::time::timeout(TRIPWIRE_DRAIN, self.listener.accept()).await {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
        self.hits()
    }
}

impl Drop for Tripwire {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Runs commands as real subprocesses
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    search_path: Vec<PathBuf>,
    confinement: Confinement,
}

impl ProcessRunner {
    /// Runner with the platform's default confinement
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runner that spawns commands directly on the host
    #[must_use]
    pub fn unconfined() -> Self {
        Self::new().with_confinement(Confinement::Unconfined)
    }

    #[must_use]
    pub fn with_confinement(mut self, confinement: Confinement) -> Self {
        self.confinement = confinement;
        self
    }

    #[inline]
    #[must_use]
    pub fn confinement(&self) -> &Confinement {
        &self.confinement
    }

    /// Whether confined commands can start on this host (bubblewrap
    /// installed and unprivileged namespaces permitted)
    pub async fn confinement_ready(&self) -> bool {
        let Confinement::Bubblewrap { program } = &self.confinement else {
            return false;
        };
        Command::new(program)
            .args(["--ro-bind", "/", "/", "--unshare-all", "--die-with-parent"])
            .args(["--", "/bin/sh", "-c", ":"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .is_ok_and(|status| status.success())
    }

    /// Directories searched before the safe system directories
    /// (toolchain locations such as `~/.cargo/bin`)
    #[must_use]
    pub fn with_search_path(mut self, dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.search_path.extend(dirs);
        self
    }

    fn path_value(&self) -> String {
        let separator = if cfg!(windows) { ";" } else { ":" };
        self.search_path
            .iter()
            .map(|p| p.display().to_string())
            .chain(SAFE_PATH_DIRS.iter().map(|s| (*s).to_string()))
            .collect::<Vec<_>>()
            .join(separator)
    }
}

enum Exit {
    Status(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

async fn read_capped<R>(reader: Option<R>, cap: usize) -> (Vec<u8>, u64)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return (Vec::new(), 0);
    };
    let mut kept = Vec::new();
    let mut total = 0u64;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                total += n as u64;
                let room = cap.saturating_sub(kept.len());
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    (kept, total)
}

async fn join_reader(mut handle: JoinHandle<(Vec<u8>, u64)>) -> (Vec<u8>, u64) {
    match tokio::time::timeout(READER_GRACE, &mut handle).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(e)) => {
            warn!(error = %e, "output reader failed");
            (Vec::new(), 0)
        }
        Err(_) => {
            handle.abort();
            (Vec::new(), 0)
        }
    }
}

async fn kill(child: &mut Child, program: &str) {
    if let Err(e) = child.kill().await {
        warn!(program, error = %e, "failed to kill validation command");
    }
}

#[async_trait::async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        request: &CommandRequest,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, SandboxError> {
        let program = request.command.program.as_str();
        let tripwire = Tripwire::start().await?;
        let proxy = tripwire.proxy_url();
        let report_dir = if self.confinement.is_confined() {
            Some(
                tempfile::Builder::new()
                    .prefix("fixguard-confine-")
                    .tempdir()
                    .map_err(SandboxError::Setup)?,
            )
        } else {
            None
        };
        let writable = request.writable_dirs();

        let mut cmd = self.confinement.command(
            program,
            &request.command.args,
            &request.cwd,
            &writable,
            report_dir.as_ref().map(tempfile::TempDir::path),
        );
        cmd.current_dir(&request.cwd)
            .env_clear()
            .env("PATH", self.path_value())
            .env("NO_PROXY", "")
            .env("no_proxy", "")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for var in PROXY_VARS {
            cmd.env(var, &proxy);
        }
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        debug!(
            command = %request.command,
            cwd = %request.cwd.display(),
            confined = self.confinement.is_confined(),
            "spawning validation command"
        );
        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            program: cmd.as_std().get_program().to_string_lossy().into_owned(),
            source,
        })?;

        let cap = request.max_output_bytes;
        let stdout = tokio::spawn(read_capped(child.stdout.take(), cap));
        let stderr = tokio::spawn(read_capped(child.stderr.take(), cap));

        let exit = tokio::select! {
            status = child.wait() => Exit::Status(status),
            () = tokio::time::sleep(request.timeout) => Exit::TimedOut,
            () = cancel.cancelled() => Exit::Cancelled,
        };

        let (exit_code, timed_out, cancelled) = match exit {
            Exit::Status(Ok(status)) => (status.code(), false, false),
            Exit::Status(Err(e)) => {
                warn!(program, error = %e, "waiting on validation command failed");
                (None, false, false)
            }
            Exit::TimedOut => {
                warn!(program, timeout = ?request.timeout, "validation command timed out");
                kill(&mut child, program).await;
                (None, true, false)
            }
            Exit::Cancelled => {
                kill(&mut child, program).await;
                (None, false, true)
            }
        };
        let duration = started.elapsed();

        let (stdout, out_bytes) = join_reader(stdout).await;
        let (stderr, err_bytes) = join_reader(stderr).await;
        let mut output = CommandOutput {
            exit_code,
            stdout,
            stderr,
            output_bytes: out_bytes + err_bytes,
            duration,
            timed_out,
            cancelled,
            network_attempts: tripwire.finish().await,
            escaped_writes: Vec::new(),
        };

        if let Some(dir) = &report_dir {
            match ConfinementReport::read(dir.path(), &writable) {
                Some(report) => {
                    output.network_attempts += usize::try_from(report.blocked_network).unwrap_or(usize::MAX);
                    output.escaped_writes = report.escaped_writes;
                }
                // Killed before the wrapper could report
                None if timed_out || cancelled => {}
                None => {
                    return Err(SandboxError::Confinement(format!(
                        "`{}` left no confinement report: {}",
                        request.command,
                        output.stderr_tail(REPORT_ERROR_CHARS).trim()
                    )));
                }
            }
        }
        Ok(output)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::command::ValidationCommand;

    fn request(program: &str, args: &[&str], timeout_ms: u64) -> CommandRequest {
        CommandRequest {
            command: ValidationCommand::new(program, args.iter().copied()),
            cwd: std::env::temp_dir(),
            writable: Vec::new(),
            env: vec![("FIXGUARD_MARK".to_string(), "1".to_string())],
            timeout: Duration::from_millis(timeout_ms),
            max_output_bytes: 64,
        }
    }

    #[tokio::test]
    async fn reports_exit_code() {
        let out = ProcessRunner::unconfined()
            .run(&request("sh", &["-c", "exit 3"], 5_000), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success());
    }

    #[tokio::test]
    async fn environment_is_cleared_and_proxied() {
        std::env::set_var("FIXGUARD_LEAK", "secret");
        let out = ProcessRunner::unconfined()
            .run(
                &request("sh", &["-c", "echo \"[$FIXGUARD_MARK][$FIXGUARD_LEAK][$HTTPS_PROXY]\""], 5_000),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&out.stdout);
        assert!(text.starts_with("[1][][http://127.0.0.1:"), "{text}");
        assert!(out.success());
    }

    #[tokio::test]
    async fn kills_on_timeout() {
        let started = Instant::now();
        let out = ProcessRunner::unconfined()
            .run(&request("sleep", &["10"], 100), &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, None);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn kills_on_cancel() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let out = ProcessRunner::unconfined()
            .run(&request("sleep", &["10"], 10_000), &cancel)
            .await
            .unwrap();
        assert!(out.cancelled);
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn output_is_capped_but_counted() {
        let out = ProcessRunner::unconfined()
            .run(
                &request("sh", &["-c", "i=0; while [ $i -lt 50 ]; do echo 0123456789; i=$((i+1)); done"], 5_000),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out.stdout.len(), 64);
        assert_eq!(out.output_bytes, 550);
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let err = ProcessRunner::unconfined()
            .run(&request("fixguard-no-such-binary", &[], 1_000), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Spawn { .. }));
    }

    #[tokio::test]
    async fn tripwire_counts_connections() {
        let tripwire = Tripwire::start().await.unwrap();
        let addr = tripwire.addr();
        let _a = tokio::net::TcpStream::connect(addr).await.unwrap();
        let _b = tokio::net::TcpStream::connect(addr).await.unwrap();
        assert_eq!(tripwire.finish().await, 2);
    }

    /// Confined runs need bubblewrap and unprivileged user namespaces
    async fn confined() -> Option<ProcessRunner> {
        let runner = ProcessRunner::new();
        if runner.confinement_ready().await {
            Some(runner)
        } else {
            eprintln!("bubblewrap unavailable; skipping confined run");
            None
        }
    }

    #[tokio::test]
    async fn confined_connection_is_refused_and_counted() {
        let Some(runner) = confined().await else {
            return;
        };
        if !std::path::Path::new("/bin/bash").exists() {
            return;
        }
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let work = tempfile::tempdir().unwrap();
        let script = format!("exec 3<>/dev/tcp/127.0.0.1/{port} && echo connected; exit 0");
        let mut req = request("bash", &["-c", script.as_str()], 10_000);
        req.cwd = work.path().to_path_buf();

        let out = runner.run(&req, &CancellationToken::new()).await.unwrap();
        assert!(out.success());
        assert!(out.network_attempts >= 1, "{out:?}");
        assert!(!String::from_utf8_lossy(&out.stdout).contains("connected"));
        assert!(tokio::time::timeout(Duration::from_millis(100), listener.accept())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn confined_writes_stay_off_the_host() {
        let Some(runner) = confined().await else {
            return;
        };
        let work = tempfile::tempdir().unwrap();
        let outside = PathBuf::from(format!("/tmp/fixguard-escape-{}", std::process::id()));
        let script = format!("echo pwn > {}; echo ok > inside.txt", outside.display());
        let mut req = request("sh", &["-c", script.as_str()], 10_000);
        req.cwd = work.path().to_path_buf();

        let out = runner.run(&req, &CancellationToken::new()).await.unwrap();
        assert!(out.success(), "{out:?}");
        assert!(!outside.exists());
        assert_eq!(
            std::fs::read_to_string(work.path().join("inside.txt")).unwrap(),
            "ok\n"
        );
        assert_eq!(out.escaped_writes, vec![outside.display().to_string()]);
        assert_eq!(out.network_attempts, 0);
    }
}
