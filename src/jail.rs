//! Jail-root path resolution.
//!
//! Commands and file actions name paths relative to a caller-supplied base
//! directory and must stay inside a jail root. Resolution is lexical first
//! (`.` and `..` folded without touching the filesystem), then checked again
//! against the canonical form of the longest existing prefix, so a symlink
//! inside the jail cannot lead outside it.

use std::path::{Component, Path, PathBuf};

use crate::error::RelayError;

/// Fold `.` and `..` components without consulting the filesystem.
///
/// `..` at the filesystem root stays at the root, like the kernel does.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(name) => out.push(name),
        }
    }
    out
}

/// A validated jail root.
#[derive(Debug, Clone)]
pub struct Jail {
    root: PathBuf,
    real_root: PathBuf,
}

impl Jail {
    pub fn new(root: &str) -> Result<Self, RelayError> {
        if root.contains('\0') {
            return Err(RelayError::Protocol("root contains null bytes".into()));
        }
        let path = Path::new(root);
        if !path.is_absolute() {
            return Err(RelayError::Protocol(format!(
                "jail root must be absolute: {root}"
            )));
        }
        let root = normalize(path);
        let real_root = std::fs::canonicalize(&root).unwrap_or_else(|_| root.clone());
        Ok(Self { root, real_root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `target` against `base` and check the result stays inside.
    ///
    /// `base` is itself checked first, so a tampered `cwd` cannot be used as
    /// a foothold. Absolute `target`s are taken as host paths.
    pub fn resolve(&self, base: &Path, target: &str) -> Result<PathBuf, RelayError> {
        if target.contains('\0') {
            return Err(RelayError::Protocol("path contains null bytes".into()));
        }
        let base = self.check(normalize(&self.root.join(base)), base)?;
        let candidate = normalize(&base.join(target));
        self.check(candidate, Path::new(target))
    }

    /// Resolve a path relative to the jail root itself.
    pub fn resolve_from_root(&self, target: &str) -> Result<PathBuf, RelayError> {
        self.resolve(&self.root, target)
    }

    fn check(&self, candidate: PathBuf, shown: &Path) -> Result<PathBuf, RelayError> {
        if !candidate.starts_with(&self.root) {
            return Err(RelayError::JailViolation(shown.display().to_string()));
        }
        if let Some(real) = canonicalize_existing(&candidate) {
            if !real.starts_with(&self.real_root) {
                return Err(RelayError::JailViolation(shown.display().to_string()));
            }
        }
        Ok(candidate)
    }
}

/// Canonicalize the longest existing prefix of `path` and re-append the rest.
fn canonicalize_existing(path: &Path) -> Option<PathBuf> {
    let mut existing = path;
    let mut rest = Vec::new();
    loop {
        if let Ok(real) = std::fs::canonicalize(existing) {
            let mut out = real;
            for name in rest.iter().rev() {
                out.push(name);
            }
            return Some(out);
        }
        rest.push(existing.file_name()?.to_os_string());
        existing = existing.parent()?;
    }
}
