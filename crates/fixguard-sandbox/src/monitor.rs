//! Runtime monitoring for writes that escape the sandbox
//!
//! Two checks run after every command: the real workspace files that were
//! copied into the sandbox must be byte-identical to when the run started,
//! and no symlink inside the sandbox may resolve outside its root.

use crate::error::SandboxError;
use crate::result::SandboxViolation;
use fixguard_artifact::{read_optional, ContentHash, TargetPath};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Content hashes of workspace files at the start of a run
#[derive(Debug, Clone, Default)]
pub struct WorkspaceFingerprint {
    root: PathBuf,
    files: BTreeMap<TargetPath, Option<ContentHash>>,
}

impl WorkspaceFingerprint {
    /// Hash each of `files` under `root` (missing files are recorded as such)
    ///
    /// # Errors
    /// Returns error if a file exists but cannot be read
    pub fn capture<'a>(
        root: &Path,
        files: impl IntoIterator<Item = &'a TargetPath>,
    ) -> Result<Self, SandboxError> {
        let mut out = BTreeMap::new();
        for target in files {
            out.insert(target.clone(), hash_at(root, target)?);
        }
        Ok(Self {
            root: root.to_path_buf(),
            files: out,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Files whose content differs from the capture
    ///
    /// # Errors
    /// Returns error if a file cannot be read
    pub fn changed(&self) -> Result<Vec<TargetPath>, SandboxError> {
        let mut changed = Vec::new();
        for (target, before) in &self.files {
            if hash_at(&self.root, target)? != *before {
                changed.push(target.clone());
            }
        }
        Ok(changed)
    }
}

fn hash_at(root: &Path, target: &TargetPath) -> Result<Option<ContentHash>, SandboxError> {
    let path = target.resolve(root);
    read_optional(&path)
        .map(|bytes| bytes.as_deref().map(ContentHash::compute))
        .map_err(|source| SandboxError::Fingerprint { path, source })
}

/// Lexically normalize, resolving `.` and `..` without touching the disk
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Symlinks under `root` whose target lies outside it
///
/// `root` should be canonical so that absolute link targets compare
/// correctly.
#[must_use]
pub fn escaping_symlinks(root: &Path) -> Vec<PathBuf> {
    let mut escaping = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).into_iter().flatten() {
        if !entry.path_is_symlink() {
            continue;
        }
        let Ok(link) = std::fs::read_link(entry.path()) else {
            continue;
        };
        let base = entry.path().parent().unwrap_or(root);
        let resolved = normalize(&base.join(link));
        if !resolved.starts_with(root) {
            escaping.push(entry.path().to_path_buf());
        }
    }
    escaping
}

/// Both checks, as violations
///
/// # Errors
/// Returns error if a workspace file cannot be read
pub fn scan(
    fingerprint: &WorkspaceFingerprint,
    sandbox_root: &Path,
) -> Result<Vec<SandboxViolation>, SandboxError> {
    let mut violations: Vec<SandboxViolation> = fingerprint
        .changed()?
        .into_iter()
        .map(|t| SandboxViolation::WriteOutsideRoot {
            path: t.as_string(),
        })
        .collect();
    violations.extend(escaping_symlinks(sandbox_root).into_iter().map(|p| {
        SandboxViolation::WriteOutsideRoot {
            path: p.display().to_string(),
        }
    }));
    Ok(violations)
}
