//! Copying the minimal file tree into the sandbox
//!
//! The tree is every regular file in the directory of each target
//! (non-recursive) plus configured context files. Symlinks in the workspace
//! are never copied.

use crate::error::SandboxError;
use fixguard_artifact::{ResolvedPatch, TargetPath};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

/// Files to copy, with their sizes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyPlan {
    files: BTreeMap<TargetPath, u64>,
    patched_bytes: u64,
}

impl CopyPlan {
    /// Collect the build context for `resolved` under `workspace_root`
    ///
    /// # Errors
    /// Returns error if a directory cannot be listed
    pub fn collect(
        workspace_root: &Path,
        resolved: &ResolvedPatch,
        context_files: &[TargetPath],
    ) -> Result<Self, SandboxError> {
        let mut files = BTreeMap::new();

        for file in resolved.files() {
            let parent = workspace_root.join(file.target.parent_segments().join("/"));
            let entries = match fs::read_dir(&parent) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(SandboxError::Materialize {
                        path: parent,
                        source,
                    })
                }
            };
            for entry in entries {
                let entry = entry.map_err(|source| SandboxError::Materialize {
                    path: parent.clone(),
                    source,
                })?;
                let path = entry.path();
                let Ok(meta) = fs::symlink_metadata(&path) else {
                    continue;
                };
                if !meta.file_type().is_file() {
                    continue;
                }
                if let Ok(target) = TargetPath::from_fs(workspace_root, &path) {
                    files.insert(target, meta.len());
                }
            }
        }

        for extra in context_files {
            if let Ok(meta) = fs::symlink_metadata(extra.resolve(workspace_root)) {
                if meta.file_type().is_file() {
                    files.insert(extra.clone(), meta.len());
                }
            }
        }

        let patched_bytes = resolved.files().iter().map(|f| f.after.len() as u64).sum();
        Ok(Self {
            files,
            patched_bytes,
        })
    }

    /// Workspace files that will be copied
    pub fn sources(&self) -> impl Iterator<Item = &TargetPath> {
        self.files.keys()
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Bytes copied plus bytes of patched content
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.files.values().sum::<u64>() + self.patched_bytes
    }

    /// Copy the planned files into `sandbox_root`, then write the patched
    /// content over the targets
    ///
    /// # Errors
    /// Returns error on any copy or write failure
    pub fn materialize(
        &self,
        workspace_root: &Path,
        sandbox_root: &Path,
        resolved: &ResolvedPatch,
    ) -> Result<(), SandboxError> {
        for target in self.files.keys() {
            let src = target.resolve(workspace_root);
            let dest = target.resolve(sandbox_root);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|source| SandboxError::Materialize {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            fs::copy(&src, &dest).map_err(|source| SandboxError::Materialize { path: src, source })?;
        }

        for file in resolved.files() {
            let dest = file.target.resolve(sandbox_root);
            let write = || -> io::Result<()> {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&dest, &file.after)
            };
            write().map_err(|source| SandboxError::WritePatched {
                target: file.target.clone(),
                source,
            })?;
        }
        Ok(())
    }
}
