//! Low-level process spawning, signalling, and output capture.
//!
//! Kernels are started with [`spawn_kernel`], which puts the child in its own
//! process group so that signals reach the whole tree. Short-lived helper
//! commands (the environment manager) go through [`run_capture`]. Both set
//! `kill_on_drop(true)` so orphaned processes are cleaned up if the owning
//! task is cancelled.

use std::collections::HashMap;
use std::fmt::Write;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::debug;

/// Max output size per stream for [`run_capture`] (4 MB).
///
/// Output beyond this limit is still drained from the pipe (to prevent
/// deadlocks) but discarded.
const MAX_CAPTURE_OUTPUT: usize = 4 * 1024 * 1024;

/// Spawn a kernel process in its own process group.
///
/// The child sees exactly `env` (the inherited environment is cleared), so
/// the caller decides what it inherits. Stdout and stderr are drained into
/// the log at debug level under `kernel_id`.
pub fn spawn_kernel(
    kernel_id: &str,
    argv: &[String],
    env: &HashMap<String, String>,
    working_dir: &Path,
) -> std::io::Result<Child> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"))?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .env_clear()
        .envs(env)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // SAFETY: setpgid is async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
    let mut child = cmd.spawn()?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(drain_lines(kernel_id.to_string(), "stdout", stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(drain_lines(kernel_id.to_string(), "stderr", stderr));
    }
    Ok(child)
}

async fn drain_lines(kernel_id: String, stream: &'static str, pipe: impl tokio::io::AsyncRead + Unpin) {
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(kernel = %kernel_id, stream, "{line}");
    }
}

/// Send `signal` to the process group led by `pid`.
pub fn signal_group(pid: u32, signal: i32) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    if pgid <= 0 {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid pid"));
    }
    // SAFETY: kill(2) has no memory-safety preconditions.
    let ret = unsafe { libc::kill(-pgid, signal) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Poll until `pid` is gone or `timeout` elapses. Returns whether it exited.
pub async fn wait_gone(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !spyder_remote_protocol::server_info::pid_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Run `program args...` and capture its output.
///
/// Stdout and stderr are read concurrently (to avoid pipe deadlock) and each
/// capped at [`MAX_CAPTURE_OUTPUT`] bytes. The entire operation is wrapped in
/// a `tokio::time::timeout`.
pub async fn run_capture(
    program: &str,
    args: &[String],
    timeout_ms: u64,
) -> Result<ExecResult, ExecError> {
    let start = std::time::Instant::now();

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ExecError::SpawnFailed(e.to_string()))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecError::ProcessFailed("Failed to take stdout pipe".to_string()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| ExecError::ProcessFailed("Failed to take stderr pipe".to_string()))?;

    let timeout = Duration::from_millis(timeout_ms);
    match Box::pin(tokio::time::timeout(timeout, async {
        let (stdout_data, stderr_data) = tokio::join!(
            read_capped(&mut stdout, MAX_CAPTURE_OUTPUT),
            read_capped(&mut stderr, MAX_CAPTURE_OUTPUT),
        );
        drop(stdout);
        drop(stderr);

        let status = child
            .wait()
            .await
            .map_err(|e| ExecError::ProcessFailed(e.to_string()))?;

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = start.elapsed().as_millis() as u64;

        Ok::<_, ExecError>(ExecResult {
            exit_code: status.code().unwrap_or(-1),
            stdout: stdout_data,
            stderr: stderr_data,
            duration_ms,
        })
    }))
    .await
    {
        Ok(result) => result,
        Err(_) => Err(ExecError::Timeout),
    }
}

/// Read from an async reader, keeping the first `max_bytes` and discarding the
/// rest. Keeps reading past the cap so the child never blocks on a full pipe.
async fn read_capped(reader: &mut (impl tokio::io::AsyncRead + Unpin), max_bytes: usize) -> String {
    let mut buf = Vec::with_capacity(max_bytes.min(65536));
    let mut tmp = [0u8; 8192];
    let mut total_read = 0usize;
    loop {
        match reader.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                total_read += n;
                if buf.len() < max_bytes {
                    let take = n.min(max_bytes - buf.len());
                    buf.extend_from_slice(&tmp[..take]);
                }
            }
        }
    }
    let mut s = String::from_utf8_lossy(&buf).into_owned();
    if total_read > max_bytes {
        let _ = write!(
            s,
            "\n[truncated: {total_read} bytes total, showing first {max_bytes}]"
        );
    }
    s
}

/// Output of [`run_capture`].
#[derive(Debug)]
pub struct ExecResult {
    /// Exit code, or `-1` if killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Errors that can occur during [`run_capture`].
#[derive(Debug)]
pub enum ExecError {
    /// The program could not be started (e.g. not found, permission denied).
    SpawnFailed(String),
    /// The child process started but `wait()` failed.
    ProcessFailed(String),
    /// The command exceeded its timeout and was killed.
    Timeout,
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecError::SpawnFailed(e) => write!(f, "Failed to spawn process: {e}"),
            ExecError::ProcessFailed(e) => write!(f, "Process error: {e}"),
            ExecError::Timeout => write!(f, "Command timed out"),
        }
    }
}

impl std::error::Error for ExecError {}
