//! Low-level process spawning and output capture.
//!
//! All shell interaction ultimately goes through the two functions here:
//! [`spawn_shell_pgroup`] for interactive sessions and [`exec_command`] for
//! one-shot commands. Both put the child in its own process group and set
//! `kill_on_drop(true)`, so a cancelled or timed-out command takes its
//! background children down with it.

use std::fmt::Write;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::debug;

/// Spawn an interactive shell in its own process group with piped I/O.
///
/// `setpgid(0, 0)` runs via `pre_exec` so the shell becomes a process group
/// leader and `KILL_SHELL` can signal the whole tree with `killpg`.
pub fn spawn_shell_pgroup(shell: &str, working_dir: &Path) -> std::io::Result<Child> {
    let mut cmd = Command::new(shell);
    cmd.current_dir(working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    own_process_group(&mut cmd);
    cmd.spawn()
}

fn own_process_group(cmd: &mut Command) {
    // SAFETY: setpgid is async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
}

/// SIGKILL the whole group led by `pid`.
fn kill_group(pid: Option<u32>) {
    let Some(raw) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        debug!(pgid = raw, "killpg failed: {e}");
    }
}

/// Execute a one-shot command via `<shell> -c "<command>"` and capture output.
///
/// Stdout and stderr are read concurrently (to avoid pipe deadlock) and each
/// capped at `max_output` bytes. The entire operation is wrapped in a
/// `tokio::time::timeout`. On expiry the child's process group is killed, so
/// anything it backgrounded dies with it.
pub async fn exec_command(
    shell: &str,
    working_dir: &Path,
    command: &str,
    timeout: Duration,
    max_output: usize,
) -> Result<ExecResult, ExecError> {
    let start = Instant::now();

    let mut cmd = Command::new(shell);
    cmd.arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    own_process_group(&mut cmd);
    let mut child = cmd
        .spawn()
        .map_err(|e| ExecError::SpawnFailed(e.to_string()))?;
    // pgid = pid: the shell leads its own group
    let pgid = child.id();

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecError::ProcessFailed("Failed to take stdout pipe".to_string()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| ExecError::ProcessFailed("Failed to take stderr pipe".to_string()))?;

    let run = async {
        let (stdout_data, stderr_data) = tokio::join!(
            read_capped(&mut stdout, max_output),
            read_capped(&mut stderr, max_output),
        );
        let status = child
            .wait()
            .await
            .map_err(|e| ExecError::ProcessFailed(e.to_string()))?;

        Ok::<_, ExecError>(ExecResult {
            exit_code: status.code().unwrap_or(-1),
            stdout: stdout_data,
            stderr: stderr_data,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    };

    match tokio::time::timeout(timeout, run).await {
        Ok(result) => result,
        Err(_) => {
            kill_group(pgid);
            Err(ExecError::Timeout(timeout))
        }
    }
}

/// Read from an async reader, keeping the first `max_bytes` and discarding the
/// rest.
///
/// Reading continues past the cap instead of closing the pipe early: closing
/// a pipe the child is still writing to raises SIGPIPE in the child and can
/// deadlock it while it also writes the other stream.
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

/// Successful result of [`exec_command`].
#[derive(Debug)]
pub struct ExecResult {
    /// Process exit code, or `-1` if the code was unavailable (e.g. killed by signal).
    pub exit_code: i32,
    /// Captured stdout (capped, lossy UTF-8 conversion).
    pub stdout: String,
    /// Captured stderr (capped, lossy UTF-8 conversion).
    pub stderr: String,
    /// Wall-clock duration of the command in milliseconds.
    pub duration_ms: u64,
}

/// Errors that can occur during [`exec_command`].
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The shell binary could not be started (e.g. not found, permission denied).
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),
    /// The child process started but `wait()` failed.
    #[error("Process error: {0}")]
    ProcessFailed(String),
    /// The command exceeded its timeout and was killed.
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),
}
