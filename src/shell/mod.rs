//! Shell process management on the agent.
//!
//! Two modes of shell interaction:
//!
//! - **One-shot** ([`process::exec_command`]): run a command, capture output,
//!   return. Backs `EXEC_COMMAND`.
//! - **Interactive** ([`bridge::ShellBridge`]): a long-lived shell per
//!   `shellId` whose stdio is bridged to `SHELL_*` frames.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub mod bridge;
pub mod process;

/// Pick the shell binary to use: the configured one if it exists, otherwise
/// the best shell detected on this host, otherwise `/bin/sh`.
pub fn resolve_shell(configured: &str) -> String {
    if Path::new(configured).exists() {
        return configured.to_string();
    }
    detect_shells()
        .into_iter()
        .next()
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// Detect available shells on this system.
///
/// Reads `/etc/shells` first (filtering comments and blank lines), then falls
/// back to probing a hardcoded list of common paths. Results are deduplicated
/// by canonical path (so `/bin/bash` and `/usr/bin/bash` don't both appear when
/// one is a symlink) and sorted by preference: bash > zsh > dash > ash > sh.
pub fn detect_shells() -> Vec<String> {
    let candidates = match std::fs::read_to_string("/etc/shells") {
        Ok(contents) => {
            let from_file: Vec<String> = contents
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .filter(|l| Path::new(l).exists())
                .map(ToString::to_string)
                .collect();
            if from_file.is_empty() {
                fallback_candidates()
            } else {
                from_file
            }
        }
        Err(_) => fallback_candidates(),
    };

    let mut seen = HashSet::new();
    let mut shells: Vec<String> = candidates
        .into_iter()
        .filter(|p| {
            let canonical = std::fs::canonicalize(p).unwrap_or_else(|_| PathBuf::from(p));
            seen.insert(canonical)
        })
        .collect();

    shells.sort_by_key(|s| shell_rank(s));
    shells
}

fn fallback_candidates() -> Vec<String> {
    ["/bin/bash", "/usr/bin/bash", "/bin/dash", "/bin/ash", "/bin/sh"]
        .iter()
        .filter(|p| Path::new(p).exists())
        .map(|p| (*p).to_string())
        .collect()
}

/// Non-interactive-friendly shells first; `fish` is not POSIX and is last.
fn shell_rank(path: &str) -> u8 {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name {
        "bash" => 0,
        "zsh" => 1,
        "dash" => 2,
        "ash" => 3,
        "sh" => 4,
        "fish" => 6,
        _ => 5,
    }
}
