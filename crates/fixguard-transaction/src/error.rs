//! Transaction errors
//!
//! Every error except [`TransactionError::RollbackIncomplete`] is raised
//! before the first workspace mutation, so the workspace is untouched when
//! one is returned.

use fixguard_artifact::{ContentHash, TargetPath};
use std::io;
use std::path::PathBuf;
use std::time::Duration;

fn describe(hash: Option<&ContentHash>) -> String {
    hash.map_or_else(|| "<absent>".to_string(), ContentHash::short)
}

#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    /// File-set lock not granted in time
    #[error("file-set lock not acquired within {waited:?}")]
    LockTimeout { waited: Duration },

    /// Operator cancelled before anything was written
    #[error("cancelled before apply")]
    Cancelled,

    /// Request names a file the held lock does not cover
    #[error("{0} is not covered by the held file-set lock")]
    NotLocked(TargetPath),

    /// On-disk content changed since the bytes were resolved
    #[error("stale base for {target}: expected {}, found {}", describe(.expected.as_ref()), describe(.actual.as_ref()))]
    StaleBase {
        target: TargetPath,
        expected: Option<ContentHash>,
        actual: Option<ContentHash>,
    },

    /// Write would follow a symlink or cross a non-directory
    #[error("unsafe path {target}: {reason}")]
    UnsafePath { target: TargetPath, reason: String },

    #[error("snapshot {0} not found")]
    SnapshotNotFound(String),

    /// Manual rollback of a snapshot whose transaction has not finished
    #[error("snapshot {0} belongs to an unfinished transaction")]
    SnapshotInFlight(String),

    #[error("snapshot {id} is corrupt: {reason}")]
    CorruptSnapshot { id: String, reason: String },

    /// File changed after commit; restoring would discard that change
    #[error("{target} changed after commit; refusing to roll back over it")]
    Diverged { target: TargetPath },

    /// Manual rollback could not restore every file
    #[error("rollback of {id} incomplete: {failed} file(s) not restored")]
    RollbackIncomplete { id: String, failed: usize },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("serialization error on {path}: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl TransactionError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }

    pub(crate) fn serde(path: impl Into<PathBuf>) -> impl FnOnce(serde_json::Error) -> Self {
        let path = path.into();
        move |source| Self::Serde { path, source }
    }

    /// Only lock contention is worth retrying
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}
