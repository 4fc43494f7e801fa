//! Shared key-value store abstraction
//!
//! The store is the only synchronization primitive peers have before a
//! transport exists. Every operation is synchronous from the caller's point
//! of view; network I/O and its retry policy belong to the implementation.

mod faulty;
mod memory;

use std::fmt;
use std::time::{Duration, Instant};

use thiserror::Error;

pub use faulty::FaultyStore;
pub use memory::MemoryStore;

/// Interval used by the default `wait_timeout` between `check` calls
pub const DEFAULT_WAIT_POLL: Duration = Duration::from_millis(2);

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failure reported by a store implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be contacted
    #[error("store unreachable: {0}")]
    Unreachable(String),

    /// `get` on a key that does not exist
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// A bounded wait expired before every key appeared
    #[error("timed out after {timeout_ms}ms waiting for {keys:?}")]
    WaitTimeout { keys: Vec<String>, timeout_ms: u64 },

    /// Any other backend failure (corrupt counter, serialization, ...)
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Store operation names, used to tag errors and fault rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Set,
    Get,
    Check,
    Add,
    Delete,
    Wait,
}

impl StoreOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreOp::Set => "set",
            StoreOp::Get => "get",
            StoreOp::Check => "check",
            StoreOp::Add => "add",
            StoreOp::Delete => "delete",
            StoreOp::Wait => "wait",
        }
    }
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, peer-addressable key-value store
///
/// Implementations must be safe to share between threads; a single store
/// handle is typically cloned into every peer of a process.
pub trait KeyValueStore: Send + Sync {
    /// Upsert `value` under `key`
    fn set(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    /// Read the value under `key`; `KeyNotFound` if absent
    fn get(&self, key: &str) -> StoreResult<Vec<u8>>;

    /// True iff every key currently exists. Never blocks.
    fn check(&self, keys: &[String]) -> StoreResult<bool>;

    /// Atomic fetch-and-add; absent keys start at 0. Returns the post-add value.
    fn add(&self, key: &str, delta: i64) -> StoreResult<i64>;

    /// Remove `key`. Returns whether it existed; absent keys are not an error.
    fn delete_key(&self, key: &str) -> StoreResult<bool>;

    /// Block until every key exists
    fn wait(&self, keys: &[String]) -> StoreResult<()>;

    /// Block until every key exists or `timeout` elapses
    ///
    /// The default implementation polls `check`; stores with native
    /// notification should override it.
    fn wait_timeout(&self, keys: &[String], timeout: Duration) -> StoreResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.check(keys)? {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(StoreError::WaitTimeout {
                    keys: keys.to_vec(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            std::thread::sleep(DEFAULT_WAIT_POLL.min(deadline - now));
        }
    }
}

/// Encode a counter value the way `add` stores it
pub(crate) fn encode_counter(value: i64) -> Vec<u8> {
    value.to_string().into_bytes()
}

/// Decode a counter value written by `add`
pub(crate) fn decode_counter(key: &str, raw: &[u8]) -> StoreResult<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| StoreError::Backend(format!("value under '{}' is not a counter", key)))
}
