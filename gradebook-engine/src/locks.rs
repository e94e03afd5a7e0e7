//! Per-key async write locks.

use dashmap::DashMap;
use gradebook_core::{SemesterId, StudentId, SubjectCode};
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of async mutexes, one per key, created on demand.
///
/// Different keys never contend. An entry is dropped from the registry
/// when its last holder releases it and nobody is waiting.
#[derive(Debug)]
pub struct KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    locks: Arc<DashMap<K, Arc<Mutex<()>>>>,
}

impl<K> Clone for KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn clone(&self) -> Self {
        Self {
            locks: Arc::clone(&self.locks),
        }
    }
}

impl<K> Default for KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: K) -> KeyedGuard<K> {
        // The shard guard must be gone before awaiting.
        let mutex = {
            let entry = self
                .locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())));
            Arc::clone(entry.value())
        };
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            key,
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Keys currently held or awaited.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Exclusive access to one key; released on drop.
#[derive(Debug)]
pub struct KeyedGuard<K>
where
    K: Eq + Hash + Clone,
{
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<K, Arc<Mutex<()>>>>,
}

impl<K> KeyedGuard<K>
where
    K: Eq + Hash + Clone,
{
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K> Drop for KeyedGuard<K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the registry's own reference left: nobody holds or waits.
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Locks of the aggregates that several records feed into.
///
/// A recompute holds its aggregate's lock from the ledger read through the
/// upsert, so the last store is always computed from the latest snapshot.
/// Acquired after a record lock, never before one.
#[derive(Debug, Clone, Default)]
pub struct AggregateLocks {
    pub rollups: KeyedLocks<StudentId>,
    pub classes: KeyedLocks<(SubjectCode, SemesterId)>,
    pub semesters: KeyedLocks<SemesterId>,
}
