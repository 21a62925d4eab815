//! Keyed Locks
//!
//! Lazily created async mutexes keyed by name. The storage agent holds one
//! table keyed by domain name and one keyed by image ID, and the node plugin
//! one keyed by volume ID, so that operations on the same key run one at a
//! time while different keys run in parallel.
//! Entries are dropped again once nobody holds or waits for them.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Mutex of one key and the number of holders plus waiters
#[derive(Debug)]
struct Slot {
    mutex: Arc<Mutex<()>>,
    users: usize,
}

type Slots = Arc<DashMap<String, Slot>>;

/// Table of per-key exclusive sections
#[derive(Debug, Default)]
pub struct KeyedLocks {
    entries: Slots,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    ///
    /// Dropping the returned future before it completes gives up the wait
    /// and leaves no entry behind.
    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let mutex = {
            let mut slot = self.entries.entry(key.to_string()).or_insert_with(|| Slot {
                mutex: Arc::new(Mutex::new(())),
                users: 0,
            });
            slot.users += 1;
            slot.mutex.clone()
        };
        let registration = Registration {
            key: key.to_string(),
            entries: self.entries.clone(),
        };

        trace!("Waiting for lock on {}", key);
        let guard = mutex.lock_owned().await;

        KeyedGuard {
            guard,
            registration,
        }
    }

    /// Number of keys currently held or waited on
    pub fn active_keys(&self) -> usize {
        self.entries.len()
    }
}

/// Counts one user of a key until dropped
#[derive(Debug)]
struct Registration {
    key: String,
    entries: Slots,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Entry::Occupied(mut slot) = self.entries.entry(self.key.clone()) {
            slot.get_mut().users -= 1;
            if slot.get().users == 0 {
                slot.remove();
            }
        }
    }
}

/// Exclusive access to one key; released on drop
#[derive(Debug)]
pub struct KeyedGuard {
    // Field order matters: the mutex is released before the key's user
    // count drops.
    guard: OwnedMutexGuard<()>,
    registration: Registration,
}

impl KeyedGuard {
    pub fn key(&self) -> &str {
        &self.registration.key
    }
}
