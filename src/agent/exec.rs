//! One-shot command dispatch with stateless `cd` emulation.
//!
//! Every `EXEC_COMMAND` runs in a fresh `<shell> -c` process started in the
//! caller's `cwd`. A leading `cd` never reaches the shell: the target is
//! resolved against `cwd`, checked against the jail root, and returned as the
//! new `cwd` for the caller to send back next time.
//!
//! | Command            | Effect                                              |
//! |--------------------|-----------------------------------------------------|
//! | `cd` / `cd ~`      | `cwd` becomes the jail root                         |
//! | `cd sub`           | `cwd` becomes `<cwd>/sub` if it is a directory      |
//! | `cd sub && make`   | `make` runs in `<cwd>/sub`; `cwd` becomes `<cwd>/sub` |
//! | anything else      | runs in `cwd`; `cwd` is returned unchanged          |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use crate::config::{ExecConfig, ShellConfig};
use crate::error::RelayError;
use crate::jail::Jail;
use crate::shell::process::{exec_command, ExecError};
use crate::shell::resolve_shell;
use crate::tunnel::frame::{ExecRequest, RpcResponse};

/// Agent-wide settings for one-shot commands.
#[derive(Debug, Clone)]
pub struct ExecSettings {
    pub shell: String,
    pub default_timeout_ms: u64,
    pub max_output: usize,
}

impl ExecSettings {
    pub fn from_config(shell: &ShellConfig, exec: &ExecConfig) -> Self {
        Self {
            shell: resolve_shell(&shell.default_shell),
            default_timeout_ms: exec.timeout_ms,
            max_output: exec.max_output,
        }
    }
}

/// Successful `EXEC_COMMAND` result, sent as the response `data`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutcome {
    /// stdout followed by stderr.
    pub output: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Directory the next command should be sent with.
    pub cwd: String,
    pub duration_ms: u64,
}

impl From<ExecError> for RelayError {
    fn from(e: ExecError) -> Self {
        match e {
            ExecError::Timeout(after) => RelayError::Timeout(after),
            ExecError::SpawnFailed(msg) => RelayError::Remote {
                code: "SPAWN_FAILED".into(),
                message: msg,
            },
            ExecError::ProcessFailed(msg) => RelayError::Remote {
                code: "PROCESS_FAILED".into(),
                message: msg,
            },
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Parsed<'a> {
    ChangeDir {
        target: &'a str,
        then: Option<&'a str>,
    },
    Run(&'a str),
}

fn parse(command: &str) -> Parsed<'_> {
    let trimmed = command.trim();
    if trimmed == "cd" {
        return Parsed::ChangeDir {
            target: "",
            then: None,
        };
    }
    let Some(after) = trimmed
        .strip_prefix("cd ")
        .or_else(|| trimmed.strip_prefix("cd\t"))
    else {
        return Parsed::Run(trimmed);
    };
    let (target, then) = match after.split_once("&&") {
        Some((t, rest)) => (t.trim(), Some(rest.trim()).filter(|r| !r.is_empty())),
        None => (after.trim(), None),
    };
    // Anything but a single plain argument needs a real shell.
    if target.contains([';', '|', '&', '`', '$', '>', '<', '(', ')']) {
        return Parsed::Run(trimmed);
    }
    Parsed::ChangeDir {
        target: unquote(target),
        then,
    }
}

fn unquote(s: &str) -> &str {
    for q in ['"', '\''] {
        if let Some(inner) = s.strip_prefix(q).and_then(|r| r.strip_suffix(q)) {
            return inner;
        }
    }
    s
}

/// Handle one `EXEC_COMMAND` and build its response envelope.
///
/// Errors carry `data.cwd` set to the unchanged directory so the caller can
/// keep its session state.
pub async fn handle(request_id: &str, req: &ExecRequest, settings: &ExecSettings) -> RpcResponse {
    match execute(req, settings).await {
        Ok(outcome) => match serde_json::to_value(&outcome) {
            Ok(data) => RpcResponse::success(request_id, data),
            Err(e) => RpcResponse::error(request_id, "INTERNAL", e.to_string()),
        },
        Err(e) => {
            info!(code = e.code(), "Command rejected: {e}");
            let cwd = req.cwd.as_deref().unwrap_or(&req.root);
            RpcResponse::error(request_id, e.code(), e.to_string()).with_data(json!({"cwd": cwd}))
        }
    }
}

pub async fn execute(req: &ExecRequest, settings: &ExecSettings) -> Result<ExecOutcome, RelayError> {
    let jail = Jail::new(&req.root)?;
    let base = jail.resolve(Path::new(req.cwd.as_deref().unwrap_or(&req.root)), ".")?;
    let timeout = Duration::from_millis(req.timeout_ms.unwrap_or(settings.default_timeout_ms));

    match parse(&req.command) {
        Parsed::ChangeDir { target, then } => {
            let dir = change_dir(&jail, &base, target).await?;
            debug!(cwd = %dir.display(), "cd resolved");
            match then {
                Some(rest) => run(settings, &dir, rest, timeout).await,
                None => Ok(ExecOutcome {
                    output: String::new(),
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: 0,
                    cwd: dir.display().to_string(),
                    duration_ms: 0,
                }),
            }
        }
        Parsed::Run(command) => run(settings, &base, command, timeout).await,
    }
}

async fn change_dir(jail: &Jail, base: &Path, target: &str) -> Result<PathBuf, RelayError> {
    let dir = match target {
        "" | "~" => jail.root().to_path_buf(),
        _ => jail.resolve(base, target)?,
    };
    let meta = tokio::fs::metadata(&dir).await?;
    if !meta.is_dir() {
        return Err(RelayError::Remote {
            code: "NOT_A_DIRECTORY".into(),
            message: format!("{target}: not a directory"),
        });
    }
    Ok(dir)
}

async fn run(
    settings: &ExecSettings,
    dir: &Path,
    command: &str,
    timeout: Duration,
) -> Result<ExecOutcome, RelayError> {
    let result = exec_command(&settings.shell, dir, command, timeout, settings.max_output).await?;
    Ok(ExecOutcome {
        output: format!("{}{}", result.stdout, result.stderr),
        stdout: result.stdout,
        stderr: result.stderr,
        exit_code: result.exit_code,
        cwd: dir.display().to_string(),
        duration_ms: result.duration_ms,
    })
}
