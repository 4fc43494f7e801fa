//! In-process shared store
//!
//! Backs the simulation driver and the test suite. Clones share the same
//! underlying map, so every simulated peer sees one namespace, and `wait`
//! parks on a condition variable instead of polling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{decode_counter, encode_counter, KeyValueStore, StoreError, StoreResult};

#[derive(Default)]
struct Shared {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    changed: Condvar,
}

/// Thread-safe in-memory key-value store
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// All keys currently present, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.shared.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Keys starting with `prefix`, sorted
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.keys()
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect()
    }

    /// Number of keys present
    pub fn len(&self) -> usize {
        self.shared.entries.lock().len()
    }

    /// Whether the store holds no keys
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn all_present(entries: &HashMap<String, Vec<u8>>, keys: &[String]) -> bool {
        keys.iter().all(|k| entries.contains_key(k))
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.len())
            .finish()
    }
}

impl KeyValueStore for MemoryStore {
    fn set(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.shared
            .entries
            .lock()
            .insert(key.to_string(), value.to_vec());
        self.shared.changed.notify_all();
        Ok(())
    }

    fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.shared
            .entries
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::KeyNotFound(key.to_string()))
    }

    fn check(&self, keys: &[String]) -> StoreResult<bool> {
        Ok(Self::all_present(&self.shared.entries.lock(), keys))
    }

    fn add(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let value = {
            let mut entries = self.shared.entries.lock();
            let current = match entries.get(key) {
                Some(raw) => decode_counter(key, raw)?,
                None => 0,
            };
            let value = current + delta;
            entries.insert(key.to_string(), encode_counter(value));
            value
        };
        self.shared.changed.notify_all();
        Ok(value)
    }

    fn delete_key(&self, key: &str) -> StoreResult<bool> {
        Ok(self.shared.entries.lock().remove(key).is_some())
    }

    fn wait(&self, keys: &[String]) -> StoreResult<()> {
        let mut entries = self.shared.entries.lock();
        while !Self::all_present(&entries, keys) {
            self.shared.changed.wait(&mut entries);
        }
        Ok(())
    }

    fn wait_timeout(&self, keys: &[String], timeout: Duration) -> StoreResult<()> {
        let deadline = Instant::now() + timeout;
        let mut entries = self.shared.entries.lock();
        while !Self::all_present(&entries, keys) {
            if self
                .shared
                .changed
                .wait_until(&mut entries, deadline)
                .timed_out()
                && !Self::all_present(&entries, keys)
            {
                return Err(StoreError::WaitTimeout {
                    keys: keys.to_vec(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
        Ok(())
    }
}
