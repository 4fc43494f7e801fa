//! Common test utilities and fixtures
//!
//! Shared helpers for running a peer group on plain threads.

#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use oob_bootstrap::oob::{KeyNamespace, OobCoordinator, PeerInfo, WaitPolicy};
use oob_bootstrap::store::{KeyValueStore, MemoryStore};

/// Poll interval used by group helpers
pub const POLL: Duration = Duration::from_millis(1);

/// Deterministic payload for `rank`
pub fn payload(rank: usize, len: usize) -> Vec<u8> {
    (0..len).map(|i| (rank * 10 + i) as u8).collect()
}

/// Peer descriptors for every rank of a group sharing `store`
pub fn peers(size: usize, store: Arc<dyn KeyValueStore>) -> Vec<PeerInfo> {
    (0..size)
        .map(|rank| PeerInfo::new(rank, size, store.clone()).unwrap())
        .collect()
}

/// Coordinators for every rank of a group, all on `namespace`
pub fn coordinators(
    size: usize,
    store: Arc<dyn KeyValueStore>,
    namespace: &str,
    wait_policy: WaitPolicy,
) -> Vec<OobCoordinator> {
    peers(size, store)
        .into_iter()
        .map(|peer| OobCoordinator::new(peer, KeyNamespace::new(namespace)).with_wait_policy(wait_policy))
        .collect()
}

/// Run `f(rank)` on one thread per rank and collect results in rank order
pub fn run_group<T, F>(size: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync,
{
    thread::scope(|scope| {
        let handles: Vec<_> = (0..size)
            .map(|rank| {
                let f = &f;
                scope.spawn(move || f(rank))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("peer thread panicked"))
            .collect()
    })
}

/// Full allgather for every rank over a fresh memory store
pub fn gather_all(size: usize, len: usize, namespace: &str) -> (Arc<MemoryStore>, Vec<Vec<u8>>) {
    let store = Arc::new(MemoryStore::new());
    let coords = coordinators(size, store.clone(), namespace, WaitPolicy::Unbounded);
    let results = run_group(size, |rank| {
        coords[rank]
            .allgather(&payload(rank, len), POLL)
            .expect("allgather failed")
    });
    (store, results)
}

/// Temporary directory holding a config file
pub struct TestEnvironment {
    pub root: TempDir,
    pub config_path: PathBuf,
}

impl TestEnvironment {
    /// Write `content` as `config.toml` in a fresh temp dir
    pub fn with_config(content: &str) -> Self {
        let root = TempDir::new().expect("Failed to create temp directory");
        let config_path = root.path().join("config.toml");
        fs::write(&config_path, content).expect("Failed to write config");
        Self { root, config_path }
    }

    pub fn config_str(&self) -> &str {
        self.config_path.to_str().expect("non-utf8 temp path")
    }
}

/// A small valid configuration
pub const VALID_CONFIG: &str = r#"
[rendezvous]
namespace = "itest"
poll_interval_ms = 0
wait_timeout_ms = 10000

[library]
config_prefix = "OOB"
thread_mode = "multi"

[tracing]
enabled = false

[logging]
level = "warn"
"#;

/// Parses, but fails validation
pub const INVALID_CONFIG: &str = r#"
[rendezvous]
namespace = "has space"

[logging]
level = "loud"
"#;
