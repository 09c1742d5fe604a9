//! In-flight transaction journal
//!
//! A record is written after the snapshot is persisted and before the first
//! file is touched, and removed once the transaction is finalized. Records
//! left behind by a crash drive recovery.

use crate::error::TransactionError;
use crate::fsops::{read_json, remove_if_exists, write_json};
use chrono::{DateTime, Utc};
use fixguard_artifact::TargetPath;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub txn_id: String,
    pub snapshot_id: String,
    pub proposal_id: String,
    pub targets: Vec<TargetPath>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Journal {
    dir: PathBuf,
}

impl Journal {
    /// Open (creating) `state_dir/journal`
    ///
    /// # Errors
    /// Returns error if the directory cannot be created
    pub fn open(state_dir: &Path) -> Result<Self, TransactionError> {
        let dir = state_dir.join("journal");
        fs::create_dir_all(&dir).map_err(TransactionError::io(&dir))?;
        Ok(Self { dir })
    }

    fn record_path(&self, txn_id: &str) -> PathBuf {
        self.dir.join(format!("{txn_id}.json"))
    }

    /// Mark a transaction as in flight
    ///
    /// # Errors
    /// Returns error on write failure
    pub fn begin(&self, record: &JournalRecord) -> Result<(), TransactionError> {
        write_json(&self.record_path(&record.txn_id), record)
    }

    /// Mark a transaction as finalized
    ///
    /// # Errors
    /// Returns error on I/O failure
    pub fn complete(&self, txn_id: &str) -> Result<(), TransactionError> {
        let path = self.record_path(txn_id);
        remove_if_exists(&path).map_err(TransactionError::io(&path))
    }

    /// Whether a transaction is still recorded as in flight
    #[must_use]
    pub fn is_open(&self, txn_id: &str) -> bool {
        self.record_path(txn_id).exists()
    }

    /// The in-flight record of `txn_id`, if any
    ///
    /// # Errors
    /// Returns error if the record exists but cannot be read
    pub fn record(&self, txn_id: &str) -> Result<Option<JournalRecord>, TransactionError> {
        let path = self.record_path(txn_id);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    /// Records still in flight, oldest first
    ///
    /// # Errors
    /// Returns error if the journal directory cannot be listed
    pub fn open_records(&self) -> Result<Vec<JournalRecord>, TransactionError> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(TransactionError::io(&self.dir))? {
            let path = entry.map_err(TransactionError::io(&self.dir))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<JournalRecord>(&path) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "unreadable journal record"),
            }
        }
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(records)
    }
}
