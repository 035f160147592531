//! Per-key async locks
//!
//! Serializes work on one destination directory or one save while letting
//! different keys proceed in parallel. An entry lives only while someone holds
//! or waits on its lock.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

type Table<K> = Arc<Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>>;

pub struct KeyedLocks<K> {
    table: Table<K>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the lock on `key`.
    pub async fn lock(&self, key: K) -> KeyedGuard<K> {
        let lock = self.entry(&key);
        let guard = lock.lock_owned().await;
        KeyedGuard {
            table: self.table.clone(),
            key,
            guard: Some(guard),
        }
    }

    /// Wait at most `timeout` for the lock on `key`. `None` when it stayed busy.
    pub async fn lock_timeout(&self, key: K, timeout: Duration) -> Option<KeyedGuard<K>> {
        let lock = self.entry(&key);
        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => Some(KeyedGuard {
                table: self.table.clone(),
                key,
                guard: Some(guard),
            }),
            Err(_) => {
                release(&self.table, &key);
                None
            }
        }
    }

    /// Keys currently held or waited on
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    fn entry(&self, key: &K) -> Arc<tokio::sync::Mutex<()>> {
        self.table.lock().entry(key.clone()).or_default().clone()
    }
}

/// Holds the lock on one key; the entry goes away with the last user.
pub struct KeyedGuard<K: Eq + Hash> {
    table: Table<K>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash> Drop for KeyedGuard<K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        release(&self.table, &self.key);
    }
}

/// Drop `key` once only the table references its lock. New users clone
/// under the table lock, so the count cannot grow while we look.
fn release<K: Eq + Hash>(table: &Table<K>, key: &K) {
    let mut table = table.lock();
    if table.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
        table.remove(key);
    }
}
