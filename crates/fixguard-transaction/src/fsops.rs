//! Atomic file primitives

use crate::error::TransactionError;
use fixguard_artifact::TargetPath;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, Metadata};
use std::io::{self, Write};
use std::path::Path;

/// Permission bits preserved across writes and restores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unix_mode: Option<u32>,
    pub readonly: bool,
}

impl FileMode {
    #[must_use]
    pub fn of(meta: &Metadata) -> Self {
        #[cfg(unix)]
        let unix_mode = {
            use std::os::unix::fs::PermissionsExt;
            Some(meta.permissions().mode() & 0o7777)
        };
        #[cfg(not(unix))]
        let unix_mode = None;
        Self {
            unix_mode,
            readonly: meta.permissions().readonly(),
        }
    }

    /// Mode of the file at `path`, if it exists
    ///
    /// # Errors
    /// Returns any error other than not-found
    pub fn read(path: &Path) -> io::Result<Option<Self>> {
        match fs::metadata(path) {
            Ok(meta) => Ok(Some(Self::of(&meta))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Apply to the file at `path`
    ///
    /// # Errors
    /// Returns error if permissions cannot be set
    pub fn apply(&self, path: &Path) -> io::Result<()> {
        let mut perms = fs::metadata(path)?.permissions();
        #[cfg(unix)]
        if let Some(mode) = self.unix_mode {
            use std::os::unix::fs::PermissionsExt;
            perms.set_mode(mode);
        }
        #[cfg(not(unix))]
        perms.set_readonly(self.readonly);
        fs::set_permissions(path, perms)
    }
}

/// Replace `path` with `bytes` via a synced sibling temporary and a rename
///
/// Readers see either the old or the new content, never a mix.
///
/// # Errors
/// Returns error on any I/O failure; `path` is then unchanged
pub fn atomic_write(path: &Path, bytes: &[u8], mode: Option<FileMode>) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".fixguard-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    if let Some(mode) = mode {
        mode.apply(tmp.path())?;
    }
    tmp.persist(path).map_err(|e| e.error)?;
    sync_dir(dir);
    Ok(())
}

/// Remove a file, treating "already gone" as success
///
/// # Errors
/// Returns any error other than not-found
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            if let Some(dir) = path.parent() {
                sync_dir(dir);
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Flush directory entries so a rename survives a crash (best effort)
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
    #[cfg(not(unix))]
    let _ = dir;
}

/// Write JSON atomically
///
/// # Errors
/// Returns error on serialization or I/O failure
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TransactionError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(TransactionError::serde(path))?;
    atomic_write(path, &bytes, None).map_err(TransactionError::io(path))
}

/// Read JSON written by [`write_json`]
///
/// # Errors
/// Returns error on I/O or parse failure
pub fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TransactionError> {
    let bytes = fs::read(path).map_err(TransactionError::io(path))?;
    serde_json::from_slice(&bytes).map_err(TransactionError::serde(path))
}

/// Ensure writing `target` under `root` cannot leave `root`
///
/// Every existing ancestor must be a real directory and the target itself
/// must not be a symlink.
///
/// # Errors
/// Returns [`TransactionError::UnsafePath`] otherwise
pub fn check_write_path(root: &Path, target: &TargetPath) -> Result<(), TransactionError> {
    let unsafe_path = |reason: String| TransactionError::UnsafePath {
        target: target.clone(),
        reason,
    };

    let mut current = root.to_path_buf();
    for segment in target.parent_segments() {
        current.push(segment);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(unsafe_path(format!("{segment} is a symlink")));
            }
            Ok(meta) if !meta.is_dir() => {
                return Err(unsafe_path(format!("{segment} is not a directory")));
            }
            Ok(_) => {}
            // Missing ancestors are created as plain directories
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(unsafe_path(e.to_string())),
        }
    }

    match fs::symlink_metadata(target.resolve(root)) {
        Ok(meta) if meta.file_type().is_symlink() => {
            Err(unsafe_path("target is a symlink".to_string()))
        }
        Ok(meta) if meta.is_dir() => Err(unsafe_path("target is a directory".to_string())),
        _ => Ok(()),
    }
}
