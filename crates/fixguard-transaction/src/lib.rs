//! FixGuard Transactions
//!
//! All-or-nothing application of multi-file writes.
//!
//! # Guarantees
//!
//! - Intersecting file sets never apply at the same time ([`FileSetLock`]),
//!   and contending writers are granted in approval order
//! - A persisted [`Snapshot`] exists before the first file is touched
//! - Each file write is atomic and keeps the original permissions
//! - On any failure every file is restored byte-for-byte before the lock is
//!   released
//! - After a crash, [`TransactionManager::recover`] leaves each interrupted
//!   transaction all pre-patch or all post-patch
//!
//! # Example
//!
//! ```rust,ignore
//! let manager = TransactionManager::new(root, state_dir, TransactionConfig::default())?;
//! let request = ApplyRequest::from_resolved(proposal_id, &resolved);
//! let guard = manager.acquire(sequence, request.targets().cloned(), &cancel).await?;
//! let report = manager.apply(&guard, &request, &NoopVerifier, &cancel).await?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod error;
mod fsops;
mod journal;
mod lock;
mod manager;
mod snapshot;

pub use error::TransactionError;
pub use fsops::{atomic_write, check_write_path, FileMode};
pub use journal::{Journal, JournalRecord};
pub use lock::{FileSetGuard, FileSetLock, LockTimedOut};
pub use manager::{
    ApplyRequest, FileWrite, NoopVerifier, PostApplyVerifier, RecoveredTransaction,
    RecoveryOutcome, RollbackReport, TransactionConfig, TransactionEvent, TransactionManager,
    TransactionOutcome, TransactionReport, VerifyError,
};
pub use snapshot::{FileImage, Snapshot, SnapshotState, SnapshotStore};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
