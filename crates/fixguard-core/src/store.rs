//! Durable proposal state
//!
//! Layout under the state directory:
//!
//! ```text
//! proposals/<id>.json   latest record of each proposal (atomic replace)
//! audit.jsonl           every decision entry, appended once, in order
//! ```

use crate::proposal::{DecisionEntry, FixProposal};
use crate::types::ProposalId;
use fixguard_transaction::atomic_write;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("proposal {0} not found")]
    NotFound(ProposalId),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed record {path}: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn serde(path: &Path) -> impl FnOnce(serde_json::Error) -> Self + '_ {
        move |source| Self::Serde {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One line of `audit.jsonl`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub proposal_id: ProposalId,
    pub entry: DecisionEntry,
}

/// Append-only audit trail across all proposals
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<()>,
}

impl AuditLog {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            writer: Mutex::new(()),
        }
    }

    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `entries`, each as one JSON line, then sync
    ///
    /// # Errors
    /// Returns error on I/O failure
    pub fn append(&self, proposal_id: ProposalId, entries: &[DecisionEntry]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for entry in entries {
            let record = AuditRecord {
                proposal_id,
                entry: entry.clone(),
            };
            serde_json::to_writer(&mut buf, &record).map_err(StoreError::serde(&self.path))?;
            buf.push(b'\n');
        }

        let _writer = self.writer.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(StoreError::io(&self.path))?;
        file.write_all(&buf).map_err(StoreError::io(&self.path))?;
        file.sync_data().map_err(StoreError::io(&self.path))
    }

    /// Every record, oldest first
    ///
    /// # Errors
    /// Returns error on I/O failure or a malformed line
    pub fn read_all(&self) -> Result<Vec<AuditRecord>, StoreError> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.path)(e)),
        };
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(StoreError::io(&self.path))?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line).map_err(StoreError::serde(&self.path))?);
        }
        Ok(records)
    }

    /// Entries recorded for `proposal_id`, oldest first
    ///
    /// # Errors
    /// Returns error on I/O failure or a malformed line
    pub fn entries_for(&self, proposal_id: ProposalId) -> Result<Vec<DecisionEntry>, StoreError> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|record| record.proposal_id == proposal_id)
            .map(|record| record.entry)
            .collect())
    }
}

/// Proposal records plus the audit trail
#[derive(Debug)]
pub struct ProposalStore {
    dir: PathBuf,
    audit: AuditLog,
}

impl ProposalStore {
    /// Open (creating if needed) the store under `state_dir`
    ///
    /// # Errors
    /// Returns error if the directory cannot be created
    pub fn open(state_dir: &Path) -> Result<Self, StoreError> {
        let dir = state_dir.join("proposals");
        fs::create_dir_all(&dir).map_err(StoreError::io(&dir))?;
        Ok(Self {
            dir,
            audit: AuditLog::new(state_dir.join("audit.jsonl")),
        })
    }

    #[inline]
    #[must_use]
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    #[must_use]
    pub fn path_of(&self, id: ProposalId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Audit new log entries, then replace the stored record
    ///
    /// # Errors
    /// Returns error on I/O failure
    pub fn save(&self, proposal: &mut FixProposal) -> Result<(), StoreError> {
        let pending = proposal
            .decision_log
            .entries()
            .get(proposal.audited..)
            .unwrap_or_default();
        self.audit.append(proposal.id, pending)?;
        proposal.audited = proposal.decision_log.len();

        let path = self.path_of(proposal.id);
        let bytes = serde_json::to_vec_pretty(&*proposal).map_err(StoreError::serde(&path))?;
        atomic_write(&path, &bytes, None).map_err(StoreError::io(&path))?;
        debug!(proposal_id = %proposal.id, state = %proposal.state, "proposal persisted");
        Ok(())
    }

    /// Load a stored record
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] if no record exists
    pub fn load(&self, id: ProposalId) -> Result<FixProposal, StoreError> {
        let path = self.path_of(id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StoreError::NotFound(id)),
            Err(e) => return Err(StoreError::io(&path)(e)),
        };
        let mut proposal: FixProposal =
            serde_json::from_slice(&bytes).map_err(StoreError::serde(&path))?;
        proposal.audited = proposal.decision_log.len();
        Ok(proposal)
    }

    /// Every stored proposal, ordered by id
    ///
    /// # Errors
    /// Returns error on I/O failure or a malformed record
    pub fn list(&self) -> Result<Vec<FixProposal>, StoreError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(StoreError::io(&self.dir))? {
            let entry = entry.map_err(StoreError::io(&self.dir))?;
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Ok(id) = stem.parse::<ProposalId>() {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        ids.into_iter().map(|id| self.load(id)).collect()
    }
}
