//! File-set lock
//!
//! Exclusive lock over a set of target files. Waiters are ordered by their
//! approval sequence: a waiter is granted when none of its files are held
//! and no waiter with a lower sequence wants any of them. Waiting is
//! notification-driven.

use fixguard_artifact::TargetPath;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Queue position: approval sequence, then arrival order
type WaiterKey = (u64, u64);

#[derive(Debug, Default)]
struct LockState {
    held: HashMap<TargetPath, u64>,
    waiting: BTreeMap<WaiterKey, BTreeSet<TargetPath>>,
}

impl LockState {
    fn grantable(&self, key: WaiterKey) -> bool {
        let Some(paths) = self.waiting.get(&key) else {
            return false;
        };
        if paths.iter().any(|p| self.held.contains_key(p)) {
            return false;
        }
        !self
            .waiting
            .range(..key)
            .any(|(_, earlier)| !earlier.is_disjoint(paths))
    }
}

/// The lock itself; share it behind an `Arc`
#[derive(Debug, Default)]
pub struct FileSetLock {
    state: Mutex<LockState>,
    notify: Notify,
    arrivals: AtomicU64,
}

/// Lock was not granted before the deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTimedOut {
    pub waited: Duration,
}

/// Removes the waiter entry if the acquiring future is dropped
struct Registration<'a> {
    lock: &'a FileSetLock,
    key: WaiterKey,
    active: bool,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if self.active {
            self.lock.state.lock().waiting.remove(&self.key);
            // Later waiters may have been blocked only by this one
            self.lock.notify.notify_waiters();
        }
    }
}

impl FileSetLock {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wait for exclusive access to `paths`
    ///
    /// # Errors
    /// Returns [`LockTimedOut`] if not granted within `timeout`
    pub async fn acquire(
        self: &Arc<Self>,
        sequence: u64,
        paths: impl IntoIterator<Item = TargetPath>,
        timeout: Duration,
    ) -> Result<FileSetGuard, LockTimedOut> {
        let started = Instant::now();
        let deadline = started + timeout;
        let paths: BTreeSet<TargetPath> = paths.into_iter().collect();
        let key = (sequence, self.arrivals.fetch_add(1, Ordering::Relaxed));

        self.state.lock().waiting.insert(key, paths.clone());
        let mut registration = Registration {
            lock: self,
            key,
            active: true,
        };

        loop {
            // Created before the check so a release in between is not missed
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if state.grantable(key) {
                    state.waiting.remove(&key);
                    for path in &paths {
                        state.held.insert(path.clone(), sequence);
                    }
                    registration.active = false;
                    debug!(sequence, files = paths.len(), waited = ?started.elapsed(), "file-set lock granted");
                    return Ok(FileSetGuard {
                        lock: Arc::clone(self),
                        paths,
                        sequence,
                    });
                }
            }
            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep_until(deadline) => {
                    debug!(sequence, "file-set lock timed out");
                    return Err(LockTimedOut { waited: started.elapsed() });
                }
            }
        }
    }

    /// Files currently held, with the holder's sequence
    #[must_use]
    pub fn holders(&self) -> Vec<(TargetPath, u64)> {
        let state = self.state.lock();
        let mut held: Vec<_> = state.held.iter().map(|(p, s)| (p.clone(), *s)).collect();
        held.sort();
        held
    }

    /// Number of queued waiters
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.state.lock().waiting.len()
    }

    fn release(&self, paths: &BTreeSet<TargetPath>) {
        {
            let mut state = self.state.lock();
            for path in paths {
                state.held.remove(path);
            }
        }
        self.notify.notify_waiters();
    }
}

/// Held lock; released on drop
#[derive(Debug)]
pub struct FileSetGuard {
    lock: Arc<FileSetLock>,
    paths: BTreeSet<TargetPath>,
    sequence: u64,
}

impl FileSetGuard {
    #[inline]
    #[must_use]
    pub fn covers(&self, target: &TargetPath) -> bool {
        self.paths.contains(target)
    }

    #[inline]
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn paths(&self) -> impl Iterator<Item = &TargetPath> {
        self.paths.iter()
    }
}

impl Drop for FileSetGuard {
    fn drop(&mut self) {
        self.lock.release(&self.paths);
    }
}
