//! In-process named locking for chain mutations.
//!
//! One manager instance runs per node (matching the source deployment
//! model), so mutual exclusion is process-local: a set of held keys behind
//! a Mutex plus a Condvar to wake waiters. Cross-process exclusion is out
//! of scope.
//!
//! Keys are typed, not formatted strings: a volume id and a snapshot id can
//! never collide. The guard releases its key on Drop.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::errors::{ChainError, Result};
use crate::volume::{SnapshotId, VolumeId};

/// What a critical section is keyed on.
///
/// Volume-level operations (create snapshot, clone, extend) take
/// `Volume(id)`; snapshot-level operations additionally take
/// `Snapshot(volume, snapshot)` so duplicate deletes of one snapshot
/// serialize even while the volume lock is being handed around.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    Volume(VolumeId),
    Snapshot(VolumeId, SnapshotId),
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::Volume(v) => write!(f, "lock(volume {v})"),
            LockKey::Snapshot(v, s) => write!(f, "lock(volume {v}, snapshot {s})"),
        }
    }
}

struct Shared {
    held: Mutex<HashSet<LockKey>>,
    cv: Condvar,
}

#[derive(Clone)]
pub struct LockManager {
    shared: Arc<Shared>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        LockManager {
            shared: Arc::new(Shared {
                held: Mutex::new(HashSet::new()),
                cv: Condvar::new(),
            }),
        }
    }

    /// Block until `key` is free, then hold it. Poisoning is survivable
    /// here: the set of held keys stays consistent because guards release
    /// in Drop.
    pub fn acquire(&self, key: LockKey) -> LockGuard {
        let mut held = self
            .shared
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while held.contains(&key) {
            held = self
                .shared
                .cv
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(key.clone());
        LockGuard {
            shared: Arc::clone(&self.shared),
            key,
        }
    }

    /// Like `acquire`, but gives up after `timeout` with `LockTimeout`.
    pub fn acquire_timeout(&self, key: LockKey, timeout: Duration) -> Result<LockGuard> {
        let deadline = Instant::now() + timeout;
        let mut held = self
            .shared
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while held.contains(&key) {
            let now = Instant::now();
            if now >= deadline {
                return Err(ChainError::LockTimeout {
                    key,
                    waited: timeout,
                });
            }
            let (guard, res) = self
                .shared
                .cv
                .wait_timeout(held, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            held = guard;
            if res.timed_out() && held.contains(&key) {
                return Err(ChainError::LockTimeout {
                    key,
                    waited: timeout,
                });
            }
        }
        held.insert(key.clone());
        Ok(LockGuard {
            shared: Arc::clone(&self.shared),
            key,
        })
    }
}

/// Scoped ownership of one key; released on Drop.
pub struct LockGuard {
    shared: Arc<Shared>,
    key: LockKey,
}

impl LockGuard {
    pub fn key(&self) -> &LockKey {
        &self.key
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut held = self
            .shared
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        held.remove(&self.key);
        self.shared.cv.notify_all();
    }
}
