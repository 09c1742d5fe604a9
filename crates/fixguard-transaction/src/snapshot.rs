//! Persisted snapshots
//!
//! Pre-patch content is stored as content-addressed blobs under
//! `snapshots/blobs/<hash>` with one JSON manifest per snapshot at
//! `snapshots/<id>/manifest.json`. Blobs are shared between snapshots and
//! collected once no manifest references them.

use crate::error::TransactionError;
use crate::fsops::{atomic_write, read_json, remove_if_exists, write_json, FileMode};
use chrono::{DateTime, Utc};
use fixguard_artifact::{read_optional, ContentHash, TargetPath};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const MANIFEST: &str = "manifest.json";
const BLOBS: &str = "blobs";

/// Captured state of one target file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileImage {
    pub target: TargetPath,
    /// Pre-patch content (`None` if the file did not exist)
    pub content: Option<ContentHash>,
    pub mode: Option<FileMode>,
    /// Content written by the transaction, recorded at commit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<ContentHash>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SnapshotState {
    /// Transaction in flight
    Active,
    /// Transaction committed; manual rollback possible until `retain_until`
    Committed { retain_until: DateTime<Utc> },
    /// Files were restored from this snapshot
    Restored {
        at: DateTime<Utc>,
        retain_until: DateTime<Utc>,
    },
}

impl SnapshotState {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Active => false,
            Self::Committed { retain_until } | Self::Restored { retain_until, .. } => {
                *retain_until <= now
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub proposal_id: String,
    pub created_at: DateTime<Utc>,
    pub files: Vec<FileImage>,
    pub state: SnapshotState,
}

impl Snapshot {
    pub fn targets(&self) -> impl Iterator<Item = &TargetPath> {
        self.files.iter().map(|f| &f.target)
    }

    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.state, SnapshotState::Active)
    }
}

/// On-disk snapshot store
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Open (creating) the store under `state_dir/snapshots`
    ///
    /// # Errors
    /// Returns error if the directories cannot be created
    pub fn open(state_dir: &Path) -> Result<Self, TransactionError> {
        let dir = state_dir.join("snapshots");
        let blobs = dir.join(BLOBS);
        fs::create_dir_all(&blobs).map_err(TransactionError::io(&blobs))?;
        Ok(Self { dir })
    }

    #[inline]
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn manifest_path(&self, id: &str) -> PathBuf {
        self.dir.join(id).join(MANIFEST)
    }

    fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        self.dir.join(BLOBS).join(hash.to_string())
    }

    /// Capture the current bytes and permissions of `targets` under `root`
    ///
    /// The manifest is persisted before this returns.
    ///
    /// # Errors
    /// Returns error if a file cannot be read or the snapshot cannot be
    /// written
    pub fn capture(
        &self,
        id: &str,
        proposal_id: &str,
        root: &Path,
        targets: &[TargetPath],
    ) -> Result<Snapshot, TransactionError> {
        let mut files = Vec::with_capacity(targets.len());
        for target in targets {
            let path = target.resolve(root);
            let bytes = read_optional(&path).map_err(TransactionError::io(&path))?;
            let mode = FileMode::read(&path).map_err(TransactionError::io(&path))?;
            let content = match bytes {
                Some(bytes) => Some(self.put_blob(&bytes)?),
                None => None,
            };
            files.push(FileImage {
                target: target.clone(),
                content,
                mode,
                after: None,
            });
        }

        let snapshot = Snapshot {
            id: id.to_string(),
            proposal_id: proposal_id.to_string(),
            created_at: Utc::now(),
            files,
            state: SnapshotState::Active,
        };
        self.save(&snapshot)?;
        debug!(snapshot_id = id, files = snapshot.files.len(), "snapshot captured");
        Ok(snapshot)
    }

    fn put_blob(&self, bytes: &[u8]) -> Result<ContentHash, TransactionError> {
        let hash = ContentHash::compute(bytes);
        let path = self.blob_path(&hash);
        if !path.exists() {
            atomic_write(&path, bytes, None).map_err(TransactionError::io(&path))?;
        }
        Ok(hash)
    }

    /// Blob bytes, verified against their hash
    ///
    /// # Errors
    /// Returns [`TransactionError::CorruptSnapshot`] if the blob is missing
    /// or does not match
    pub fn blob(&self, snapshot_id: &str, hash: &ContentHash) -> Result<Vec<u8>, TransactionError> {
        let corrupt = |reason: String| TransactionError::CorruptSnapshot {
            id: snapshot_id.to_string(),
            reason,
        };
        let path = self.blob_path(hash);
        let bytes = fs::read(&path).map_err(|e| corrupt(format!("blob {}: {e}", hash.short())))?;
        if ContentHash::compute(&bytes) != *hash {
            return Err(corrupt(format!("blob {} does not match its hash", hash.short())));
        }
        Ok(bytes)
    }

    /// Persist a manifest
    ///
    /// # Errors
    /// Returns error on write failure
    pub fn save(&self, snapshot: &Snapshot) -> Result<(), TransactionError> {
        write_json(&self.manifest_path(&snapshot.id), snapshot)
    }

    /// Load a manifest
    ///
    /// # Errors
    /// Returns [`TransactionError::SnapshotNotFound`] if absent
    pub fn load(&self, id: &str) -> Result<Snapshot, TransactionError> {
        let path = self.manifest_path(id);
        if !path.exists() {
            return Err(TransactionError::SnapshotNotFound(id.to_string()));
        }
        read_json(&path)
    }

    /// Restore one file to its captured state
    ///
    /// # Errors
    /// Returns error if the blob is unusable or the write fails
    pub fn restore_file(
        &self,
        snapshot_id: &str,
        root: &Path,
        image: &FileImage,
    ) -> Result<(), TransactionError> {
        let path = image.target.resolve(root);
        match &image.content {
            Some(hash) => {
                let bytes = self.blob(snapshot_id, hash)?;
                atomic_write(&path, &bytes, image.mode).map_err(TransactionError::io(&path))
            }
            None => remove_if_exists(&path).map_err(TransactionError::io(&path)),
        }
    }

    /// All readable manifests; unreadable ones are skipped with a warning
    ///
    /// # Errors
    /// Returns error if the store directory cannot be listed
    pub fn list(&self) -> Result<Vec<Snapshot>, TransactionError> {
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(TransactionError::io(&self.dir))? {
            let entry = entry.map_err(TransactionError::io(&self.dir))?;
            let name = entry.file_name();
            let Some(id) = name.to_str() else { continue };
            if id == BLOBS || !entry.path().is_dir() {
                continue;
            }
            match self.load(id) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!(snapshot_id = id, error = %e, "skipping unreadable snapshot"),
            }
        }
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(snapshots)
    }

    /// Remove a snapshot manifest; its blobs are collected by the next purge
    ///
    /// # Errors
    /// Returns error on I/O failure
    pub fn remove(&self, id: &str) -> Result<(), TransactionError> {
        let dir = self.dir.join(id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TransactionError::io(&dir)(e)),
        }
    }

    /// Discard finished snapshots whose retention ended at or before `now`,
    /// then delete unreferenced blobs. Returns the removed ids.
    ///
    /// # Errors
    /// Returns error on I/O failure
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>, TransactionError> {
        let mut removed = Vec::new();
        let mut referenced = HashSet::new();
        for snapshot in self.list()? {
            if snapshot.state.expired(now) {
                self.remove(&snapshot.id)?;
                removed.push(snapshot.id);
            } else {
                referenced.extend(snapshot.files.iter().filter_map(|f| f.content));
            }
        }

        let blobs = self.dir.join(BLOBS);
        let mut collected = 0usize;
        for entry in fs::read_dir(&blobs).map_err(TransactionError::io(&blobs))? {
            let entry = entry.map_err(TransactionError::io(&blobs))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            // Temporaries of a write in progress
            if name.starts_with('.') {
                continue;
            }
            let keep = name
                .parse::<ContentHash>()
                .is_ok_and(|hash| referenced.contains(&hash));
            if !keep {
                remove_if_exists(&entry.path()).map_err(TransactionError::io(entry.path()))?;
                collected += 1;
            }
        }

        if !removed.is_empty() || collected > 0 {
            info!(snapshots = removed.len(), blobs = collected, "purged expired snapshots");
        }
        Ok(removed)
    }
}
