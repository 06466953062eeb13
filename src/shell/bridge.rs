//! Shell Session Bridge: interactive shells driven by `SHELL_*` frames.
//!
//! Each `START_SHELL` spawns a process-group-leading shell with piped stdio
//! and a session task that owns the child. The task runs four pieces:
//!
//! - stdin writer fed by `SHELL_INPUT`
//! - stdout and stderr readers, each emitting `SHELL_OUTPUT` in read order
//! - the exit watcher, which emits `SHELL_EXIT` after both readers finished
//!
//! The bridge itself is owned by the agent's channel loop; exits come back to
//! it through an mpsc so it never shares its session map.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::process::spawn_shell_pgroup;
use crate::error::RelayError;
use crate::tunnel::frame::{encode_bytes, Frame, Message, OutputStream};

/// How long output readers may keep draining after the shell exited.
/// Background jobs that inherited the pipes would otherwise hold them open.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

const STDIN_QUEUE: usize = 64;
const READ_CHUNK: usize = 4096;

/// Sent by a session task when its shell is gone: `(shell_id, pid)`.
pub type ShellExited = (String, u32);

struct ShellSession {
    pid: u32,
    stdin_tx: mpsc::Sender<Vec<u8>>,
    kill: CancellationToken,
}

pub struct ShellBridge {
    shell: String,
    outbound: mpsc::Sender<Message>,
    exited_tx: mpsc::Sender<ShellExited>,
    sessions: HashMap<String, ShellSession>,
}

impl ShellBridge {
    pub fn new(
        shell: String,
        outbound: mpsc::Sender<Message>,
        exited_tx: mpsc::Sender<ShellExited>,
    ) -> Self {
        Self {
            shell,
            outbound,
            exited_tx,
            sessions: HashMap::new(),
        }
    }

    /// Spawn a shell for `shell_id`. Starting an id that is already running
    /// is a protocol error and leaves the running session alone.
    pub fn start(&mut self, shell_id: String, working_dir: &Path) -> Result<u32, RelayError> {
        if self.sessions.contains_key(&shell_id) {
            return Err(RelayError::Protocol(format!(
                "shell {shell_id} is already running"
            )));
        }
        let mut child = spawn_shell_pgroup(&self.shell, working_dir)?;
        let pid = child.id().unwrap_or(0);
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(RelayError::Protocol("shell stdio not piped".into()));
        };

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(STDIN_QUEUE);
        let kill = CancellationToken::new();

        let stdin_task = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(data) = stdin_rx.recv().await {
                if stdin.write_all(&data).await.is_err() || stdin.flush().await.is_err() {
                    break;
                }
            }
        });
        let stdout_task = pump_output(shell_id.clone(), OutputStream::Stdout, stdout, self.outbound.clone());
        let stderr_task = pump_output(shell_id.clone(), OutputStream::Stderr, stderr, self.outbound.clone());

        let span = info_span!("shell", shell_id = %shell_id, pid);
        tokio::spawn(
            watch_exit(
                shell_id.clone(),
                pid,
                child,
                [stdin_task, stdout_task, stderr_task],
                kill.clone(),
                self.outbound.clone(),
                self.exited_tx.clone(),
            )
            .instrument(span),
        );

        info!(shell_id = %shell_id, pid, "Shell started");
        self.sessions.insert(
            shell_id,
            ShellSession {
                pid,
                stdin_tx,
                kill,
            },
        );
        Ok(pid)
    }

    /// Queue bytes for the shell's stdin. Unknown ids are a no-op.
    pub fn input(&self, shell_id: &str, data: Vec<u8>) -> bool {
        let Some(session) = self.sessions.get(shell_id) else {
            debug!(shell_id, "Input for unknown shell (dropped)");
            return false;
        };
        match session.stdin_tx.try_send(data) {
            Ok(()) => true,
            Err(e) => {
                warn!(shell_id, "Shell stdin queue rejected input: {e}");
                false
            }
        }
    }

    /// Force-terminate a shell and release it now. Unknown ids are a no-op.
    pub fn kill(&mut self, shell_id: &str) -> bool {
        match self.sessions.remove(shell_id) {
            Some(session) => {
                session.kill.cancel();
                info!(shell_id, pid = session.pid, "Shell killed");
                true
            }
            None => false,
        }
    }

    /// Release a session whose process exited on its own.
    ///
    /// The pid guards against a late notice removing a newer session that
    /// reused the same `shell_id`.
    pub fn exited(&mut self, shell_id: &str, pid: u32) {
        if self.sessions.get(shell_id).is_some_and(|s| s.pid == pid) {
            self.sessions.remove(shell_id);
        }
    }

    pub fn kill_all(&mut self) -> usize {
        let count = self.sessions.len();
        for (_, session) in self.sessions.drain() {
            session.kill.cancel();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

fn pump_output(
    shell_id: String,
    stream: OutputStream,
    mut reader: impl AsyncRead + Unpin + Send + 'static,
    outbound: mpsc::Sender<Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tmp = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut tmp).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let frame = Frame::ShellOutput {
                        shell_id: shell_id.clone(),
                        stream,
                        data: encode_bytes(&tmp[..n]),
                    };
                    if outbound.send(frame.into()).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(shell_id = %shell_id, ?stream, "Shell output closed");
    })
}

async fn watch_exit(
    shell_id: String,
    pid: u32,
    mut child: Child,
    tasks: [JoinHandle<()>; 3],
    kill: CancellationToken,
    outbound: mpsc::Sender<Message>,
    exited_tx: mpsc::Sender<ShellExited>,
) {
    let [stdin_task, stdout_task, stderr_task] = tasks;
    let code = tokio::select! {
        status = child.wait() => match status {
            Ok(s) => s.code(),
            Err(e) => {
                warn!("Shell wait error: {e}");
                None
            }
        },
        () = kill.cancelled() => {
            // pgid = pid because the shell is the group leader via setpgid(0,0)
            if let Ok(raw) = i32::try_from(pid) {
                let _ = killpg(Pid::from_raw(raw), Signal::SIGKILL);
            }
            let _ = child.kill().await;
            stdout_task.abort();
            stderr_task.abort();
            None
        }
    };
    stdin_task.abort();

    // SHELL_EXIT must follow every SHELL_OUTPUT of this shell.
    let drain = async {
        let _ = stdout_task.await;
        let _ = stderr_task.await;
    };
    if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
        debug!("Shell output still open after exit, abandoning readers");
    }

    info!(?code, "Shell exited");
    let _ = outbound
        .send(Frame::ShellExit { shell_id: shell_id.clone(), code }.into())
        .await;
    let _ = exited_tx.send((shell_id, pid)).await;
}
