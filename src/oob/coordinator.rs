//! Rendezvous allgather state machine
//!
//! `INIT -> PUBLISHED -> COLLECTING -> COMPLETE -> RELEASED`, with `ERROR`
//! reachable from any state on a store failure.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::{KeyNamespace, PeerInfo};
use crate::error::{Error, Result};
use crate::store::{StoreError, StoreOp};

/// Value written under each release key
const RELEASE_SIGNAL: &[u8] = b"1";

// ─────────────────────────────────────────────────────────────────
// States & Policies
// ─────────────────────────────────────────────────────────────────

/// Lifecycle of one rendezvous request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    /// Receive buffer allocated, nothing published yet
    Init,
    /// This peer's bytes are in the store
    Published,
    /// Every publish key exists; copying into the receive buffer
    Collecting,
    /// Receive buffer holds every peer's bytes in rank order
    Complete,
    /// Barrier passed, this peer's keys are gone
    Released,
    /// A store operation failed; the request is unusable
    Error,
}

impl RoundState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundState::Init => "init",
            RoundState::Published => "published",
            RoundState::Collecting => "collecting",
            RoundState::Complete => "complete",
            RoundState::Released => "released",
            RoundState::Error => "error",
        }
    }
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a successful `poll`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousStatus {
    InProgress,
    Complete,
}

/// How long distributed waits may block
///
/// `Unbounded` keeps the historical behaviour: a peer that never arrives
/// leaves the others waiting forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitPolicy {
    #[default]
    Unbounded,
    Bounded(Duration),
}

impl WaitPolicy {
    /// `0` means unbounded
    pub fn from_millis(ms: u64) -> Self {
        if ms == 0 {
            WaitPolicy::Unbounded
        } else {
            WaitPolicy::Bounded(Duration::from_millis(ms))
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        match self {
            WaitPolicy::Unbounded => None,
            WaitPolicy::Bounded(timeout) => Some(*timeout),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Rendezvous Request
// ─────────────────────────────────────────────────────────────────

/// One in-flight allgather round, owned by the call site that started it
pub struct RendezvousRequest {
    id: u64,
    send_len: usize,
    recv: Vec<u8>,
    state: RoundState,
}

impl RendezvousRequest {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn send_len(&self) -> usize {
        self.send_len
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    /// Receive buffer, `send_len * size` bytes, filled once `Complete`
    pub fn recv_buffer(&self) -> &[u8] {
        &self.recv
    }

    /// Consume the request and take ownership of the receive buffer
    pub fn into_buffer(self) -> Vec<u8> {
        self.recv
    }
}

impl fmt::Debug for RendezvousRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RendezvousRequest")
            .field("id", &self.id)
            .field("send_len", &self.send_len)
            .field("recv_len", &self.recv.len())
            .field("state", &self.state)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────
// Coordinator
// ─────────────────────────────────────────────────────────────────

/// Drives rendezvous rounds for one peer over the shared store
pub struct OobCoordinator {
    peer: PeerInfo,
    namespace: KeyNamespace,
    wait_policy: WaitPolicy,
    next_request: AtomicU64,
}

impl OobCoordinator {
    pub fn new(peer: PeerInfo, namespace: KeyNamespace) -> Self {
        Self {
            peer,
            namespace,
            wait_policy: WaitPolicy::default(),
            next_request: AtomicU64::new(0),
        }
    }

    pub fn with_wait_policy(mut self, wait_policy: WaitPolicy) -> Self {
        self.wait_policy = wait_policy;
        self
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    pub fn wait_policy(&self) -> WaitPolicy {
        self.wait_policy
    }

    /// Allocate a request whose receive buffer holds `send_len` bytes per peer
    ///
    /// Fails with `BufferSize` when `send_len * size` does not fit in `usize`.
    pub fn new_request(&self, send_len: usize) -> Result<RendezvousRequest> {
        let total = send_len
            .checked_mul(self.peer.size())
            .ok_or(Error::BufferSize {
                expected: usize::MAX / self.peer.size(),
                actual: send_len,
                rank: None,
            })?;
        Ok(RendezvousRequest {
            id: self.next_request.fetch_add(1, Ordering::Relaxed),
            send_len,
            recv: vec![0; total],
            state: RoundState::Init,
        })
    }

    /// Publish `send` under this peer's publish key
    pub fn initiate(&self, request: &mut RendezvousRequest, send: &[u8]) -> Result<()> {
        if request.state != RoundState::Init {
            return Err(Error::invalid_state("initiate", request.state));
        }
        if send.len() != request.send_len {
            return Err(Error::BufferSize {
                expected: request.send_len,
                actual: send.len(),
                rank: None,
            });
        }

        let key = self.namespace.publish_key(self.peer.rank());
        self.peer
            .store()
            .set(&key, send)
            .map_err(|e| self.fail(request, StoreOp::Set, &key, e))?;

        request.state = RoundState::Published;
        debug!(
            rank = self.peer.rank(),
            size = self.peer.size(),
            request = request.id,
            bytes = send.len(),
            key = %key,
            "Published rendezvous data"
        );
        Ok(())
    }

    /// Check whether every peer has published; collect if so
    ///
    /// Returns `InProgress` without touching the receive buffer while any
    /// publish key is missing. Calling again after `Complete` returns
    /// `Complete` without re-reading the store.
    pub fn poll(&self, request: &mut RendezvousRequest) -> Result<RendezvousStatus> {
        match request.state {
            RoundState::Published => {}
            RoundState::Complete => return Ok(RendezvousStatus::Complete),
            state => return Err(Error::invalid_state("poll", state)),
        }

        let store = self.peer.store();
        let keys = self.namespace.publish_keys(self.peer.size());
        let ready = store
            .check(&keys)
            .map_err(|e| self.fail(request, StoreOp::Check, self.namespace.prefix(), e))?;
        if !ready {
            trace!(rank = self.peer.rank(), request = request.id, "Rendezvous still in progress");
            return Ok(RendezvousStatus::InProgress);
        }

        request.state = RoundState::Collecting;
        let len = request.send_len;
        for (rank, key) in keys.iter().enumerate() {
            let data = store
                .get(key)
                .map_err(|e| self.fail(request, StoreOp::Get, key, e))?;
            if data.len() != len {
                request.state = RoundState::Error;
                return Err(Error::BufferSize {
                    expected: len,
                    actual: data.len(),
                    rank: Some(rank),
                });
            }
            request.recv[rank * len..(rank + 1) * len].copy_from_slice(&data);
        }

        request.state = RoundState::Complete;
        debug!(
            rank = self.peer.rank(),
            request = request.id,
            bytes = request.recv.len(),
            "Rendezvous data collected"
        );
        Ok(RendezvousStatus::Complete)
    }

    /// Fetch-and-barrier cleanup
    ///
    /// The last peer to bump the completion counter deletes the counter and
    /// every publish key, then sets a release key for each rank; the others
    /// block on their own release key. Every peer deletes its release key
    /// before returning, so the namespace is empty once all have returned.
    ///
    /// A store failure part-way through the last arriver's cleanup leaves
    /// the namespace partially drained and is not rolled back.
    pub fn release(&self, request: &mut RendezvousRequest) -> Result<()> {
        if request.state != RoundState::Complete {
            return Err(Error::invalid_state("release", request.state));
        }

        let store = self.peer.store();
        let rank = self.peer.rank();
        let size = self.peer.size();
        let done_key = self.namespace.done_key();

        let arrived = store
            .add(&done_key, 1)
            .map_err(|e| self.fail(request, StoreOp::Add, &done_key, e))?;

        if arrived == size as i64 {
            debug!(rank, size, request = request.id, "Last to arrive, draining namespace");
            store
                .delete_key(&done_key)
                .map_err(|e| self.fail(request, StoreOp::Delete, &done_key, e))?;
            for key in self.namespace.publish_keys(size) {
                store
                    .delete_key(&key)
                    .map_err(|e| self.fail(request, StoreOp::Delete, &key, e))?;
            }
            for peer_rank in 0..size {
                let key = self.namespace.release_key(peer_rank);
                store
                    .set(&key, RELEASE_SIGNAL)
                    .map_err(|e| self.fail(request, StoreOp::Set, &key, e))?;
            }
        } else if arrived < size as i64 {
            let key = self.namespace.release_key(rank);
            debug!(rank, arrived, size, request = request.id, "Waiting at release barrier");
            let waited = match self.wait_policy {
                WaitPolicy::Unbounded => store.wait(std::slice::from_ref(&key)),
                WaitPolicy::Bounded(timeout) => {
                    store.wait_timeout(std::slice::from_ref(&key), timeout)
                }
            };
            waited.map_err(|e| self.fail(request, StoreOp::Wait, &key, e))?;
        } else {
            request.state = RoundState::Error;
            warn!(rank, arrived, size, key = %done_key, "Completion counter overshoot");
            return Err(Error::CounterOvershoot {
                key: done_key,
                value: arrived,
                size,
            });
        }

        let own_key = self.namespace.release_key(rank);
        store
            .delete_key(&own_key)
            .map_err(|e| self.fail(request, StoreOp::Delete, &own_key, e))?;

        request.state = RoundState::Released;
        debug!(rank, request = request.id, "Released rendezvous round");
        Ok(())
    }

    /// Discard the request and hand the receive buffer to the caller
    pub fn free(&self, request: RendezvousRequest) -> Vec<u8> {
        if request.state != RoundState::Released {
            debug!(
                rank = self.peer.rank(),
                request = request.id,
                state = %request.state,
                "Freeing rendezvous request that was not released"
            );
        }
        request.into_buffer()
    }

    /// Run a whole round, sleeping `poll_interval` between polls
    ///
    /// Under a bounded wait policy the collect phase gives up once the
    /// timeout elapses; this peer's publish key is left in the store.
    pub fn allgather(&self, send: &[u8], poll_interval: Duration) -> Result<Vec<u8>> {
        let mut request = self.new_request(send.len())?;
        self.initiate(&mut request, send)?;

        let started = Instant::now();
        while self.poll(&mut request)? == RendezvousStatus::InProgress {
            if let Some(timeout) = self.wait_policy.timeout() {
                if started.elapsed() >= timeout {
                    let keys = self.namespace.publish_keys(self.peer.size());
                    let source = StoreError::WaitTimeout {
                        keys,
                        timeout_ms: timeout.as_millis() as u64,
                    };
                    return Err(self.fail(
                        &mut request,
                        StoreOp::Check,
                        self.namespace.prefix(),
                        source,
                    ));
                }
            }
            if poll_interval.is_zero() {
                std::thread::yield_now();
            } else {
                std::thread::sleep(poll_interval);
            }
        }

        self.release(&mut request)?;
        Ok(self.free(request))
    }

    fn fail(
        &self,
        request: &mut RendezvousRequest,
        op: StoreOp,
        key: &str,
        source: StoreError,
    ) -> Error {
        request.state = RoundState::Error;
        warn!(
            rank = self.peer.rank(),
            request = request.id,
            op = %op,
            key = %key,
            error = %source,
            "Store operation failed during rendezvous"
        );
        Error::store(op, key, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::{FaultyStore, KeyValueStore, MemoryStore};
    use std::sync::Arc;

    fn coordinator(rank: usize, size: usize, store: Arc<dyn KeyValueStore>) -> OobCoordinator {
        let peer = PeerInfo::new(rank, size, store).unwrap();
        OobCoordinator::new(peer, KeyNamespace::new("test"))
    }

    #[test]
    fn test_singleton_round() {
        let store = MemoryStore::new();
        let coord = coordinator(0, 1, Arc::new(store.clone()));

        let mut req = coord.new_request(3).unwrap();
        assert_eq!(req.state(), RoundState::Init);
        coord.initiate(&mut req, &[7, 8, 9]).unwrap();
        assert_eq!(req.state(), RoundState::Published);
        assert_eq!(coord.poll(&mut req).unwrap(), RendezvousStatus::Complete);
        assert_eq!(req.recv_buffer(), &[7, 8, 9]);

        coord.release(&mut req).unwrap();
        assert_eq!(req.state(), RoundState::Released);
        assert_eq!(coord.free(req), vec![7, 8, 9]);
        assert!(store.is_empty());
    }

    #[test]
    fn test_poll_in_progress_leaves_buffer_untouched() {
        let store = MemoryStore::new();
        let coord = coordinator(0, 2, Arc::new(store.clone()));

        let mut req = coord.new_request(2).unwrap();
        coord.initiate(&mut req, &[1, 1]).unwrap();
        for _ in 0..5 {
            assert_eq!(coord.poll(&mut req).unwrap(), RendezvousStatus::InProgress);
            assert_eq!(req.recv_buffer(), &[0, 0, 0, 0]);
            assert_eq!(req.state(), RoundState::Published);
        }

        store.set("test/teamr1", &[2, 2]).unwrap();
        assert_eq!(coord.poll(&mut req).unwrap(), RendezvousStatus::Complete);
        assert_eq!(req.recv_buffer(), &[1, 1, 2, 2]);
        // idempotent once complete
        assert_eq!(coord.poll(&mut req).unwrap(), RendezvousStatus::Complete);
    }

    #[test]
    fn test_initiate_rejects_wrong_length() {
        let coord = coordinator(0, 1, Arc::new(MemoryStore::new()));
        let mut req = coord.new_request(4).unwrap();
        let err = coord.initiate(&mut req, &[1, 2]).unwrap_err();
        assert!(matches!(err, Error::BufferSize { expected: 4, actual: 2, .. }));
        assert_eq!(req.state(), RoundState::Init);
    }

    #[test]
    fn test_initiate_twice_is_protocol_error() {
        let coord = coordinator(0, 2, Arc::new(MemoryStore::new()));
        let mut req = coord.new_request(1).unwrap();
        coord.initiate(&mut req, &[1]).unwrap();
        let err = coord.initiate(&mut req, &[1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_poll_before_initiate_is_protocol_error() {
        let coord = coordinator(0, 1, Arc::new(MemoryStore::new()));
        let mut req = coord.new_request(1).unwrap();
        assert_eq!(coord.poll(&mut req).unwrap_err().kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_release_before_complete_is_protocol_error() {
        let coord = coordinator(0, 2, Arc::new(MemoryStore::new()));
        let mut req = coord.new_request(1).unwrap();
        coord.initiate(&mut req, &[1]).unwrap();
        let err = coord.release(&mut req).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(req.state(), RoundState::Published);
    }

    #[test]
    fn test_initiate_store_failure_moves_to_error() {
        let store = FaultyStore::new(Arc::new(MemoryStore::new())).fail(StoreOp::Set);
        let coord = coordinator(0, 1, Arc::new(store));
        let mut req = coord.new_request(1).unwrap();

        let err = coord.initiate(&mut req, &[1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Store);
        assert_eq!(req.state(), RoundState::Error);

        assert_eq!(coord.poll(&mut req).unwrap_err().kind(), ErrorKind::Protocol);
        assert_eq!(coord.release(&mut req).unwrap_err().kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_mismatched_published_length() {
        let store = MemoryStore::new();
        let coord = coordinator(0, 2, Arc::new(store.clone()));
        let mut req = coord.new_request(2).unwrap();
        coord.initiate(&mut req, &[1, 1]).unwrap();
        store.set("test/teamr1", &[2, 2, 2]).unwrap();

        let err = coord.poll(&mut req).unwrap_err();
        assert!(matches!(err, Error::BufferSize { rank: Some(1), .. }));
        assert_eq!(req.state(), RoundState::Error);
    }

    #[test]
    fn test_counter_overshoot_detected() {
        let store = MemoryStore::new();
        store.add("test/ag_done", 1).unwrap();
        let coord = coordinator(0, 1, Arc::new(store));
        let mut req = coord.new_request(1).unwrap();
        coord.initiate(&mut req, &[5]).unwrap();
        coord.poll(&mut req).unwrap();

        let err = coord.release(&mut req).unwrap_err();
        assert!(matches!(err, Error::CounterOvershoot { value: 2, size: 1, .. }));
        assert_eq!(req.state(), RoundState::Error);
    }

    #[test]
    fn test_bounded_release_wait_times_out() {
        let store = MemoryStore::new();
        // rank 1 published but will never reach the barrier
        store.set("test/teamr1", &[0]).unwrap();
        let coord = coordinator(0, 2, Arc::new(store.clone()))
            .with_wait_policy(WaitPolicy::Bounded(Duration::from_millis(20)));

        let mut req = coord.new_request(1).unwrap();
        coord.initiate(&mut req, &[1]).unwrap();
        assert_eq!(coord.poll(&mut req).unwrap(), RendezvousStatus::Complete);

        let err = coord.release(&mut req).unwrap_err();
        assert!(matches!(
            err,
            Error::Store {
                op: StoreOp::Wait,
                source: StoreError::WaitTimeout { .. },
                ..
            }
        ));
        assert_eq!(req.state(), RoundState::Error);
    }

    #[test]
    fn test_new_request_overflow_is_buffer_size_error() {
        let coord = coordinator(0, 2, Arc::new(MemoryStore::new()));
        let err = coord.new_request(usize::MAX).unwrap_err();
        assert!(matches!(err, Error::BufferSize { actual: usize::MAX, rank: None, .. }));
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    /// Drive a fresh round to `Complete`
    fn completed(coord: &OobCoordinator, send: &[u8]) -> RendezvousRequest {
        let mut req = coord.new_request(send.len()).unwrap();
        coord.initiate(&mut req, send).unwrap();
        assert_eq!(coord.poll(&mut req).unwrap(), RendezvousStatus::Complete);
        req
    }

    #[test]
    fn test_release_add_failure_keeps_publish_key() {
        let memory = MemoryStore::new();
        let faulty = Arc::new(FaultyStore::new(Arc::new(memory.clone())).fail(StoreOp::Add));
        let coord = coordinator(0, 1, faulty.clone());

        let mut req = completed(&coord, &[4]);
        let err = coord.release(&mut req).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Store);
        assert!(matches!(err, Error::Store { op: StoreOp::Add, .. }));
        assert_eq!(req.state(), RoundState::Error);
        assert_eq!(memory.keys(), vec!["test/teamr0".to_string()]);

        // Once the store recovers a new round drains the leftover
        faulty.heal(StoreOp::Add);
        let mut req = completed(&coord, &[5]);
        coord.release(&mut req).unwrap();
        assert!(memory.is_empty());
    }

    #[test]
    fn test_last_arriver_delete_failure_is_not_rolled_back() {
        let memory = MemoryStore::new();
        // rank 1 already published and reached the barrier
        memory.set("test/teamr1", &[2]).unwrap();
        memory.add("test/ag_done", 1).unwrap();
        let faulty =
            FaultyStore::new(Arc::new(memory.clone())).fail_on_key(StoreOp::Delete, "teamr1");
        let coord = coordinator(0, 2, Arc::new(faulty));

        let mut req = completed(&coord, &[1]);
        let err = coord.release(&mut req).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Store);
        assert!(matches!(err, Error::Store { op: StoreOp::Delete, ref key, .. } if key == "test/teamr1"));
        assert_eq!(req.state(), RoundState::Error);

        // Counter and rank 0's publish key are gone; no release key was set
        assert_eq!(memory.keys(), vec!["test/teamr1".to_string()]);
    }

    #[test]
    fn test_release_key_set_failure_leaves_earlier_signals() {
        let memory = MemoryStore::new();
        memory.set("test/teamr1", &[2]).unwrap();
        memory.add("test/ag_done", 1).unwrap();
        let faulty =
            FaultyStore::new(Arc::new(memory.clone())).fail_on_key(StoreOp::Set, "ag_free1");
        let coord = coordinator(0, 2, Arc::new(faulty));

        let mut req = completed(&coord, &[1]);
        let err = coord.release(&mut req).unwrap_err();
        assert!(matches!(err, Error::Store { op: StoreOp::Set, ref key, .. } if key == "test/ag_free1"));
        assert_eq!(err.kind(), ErrorKind::Store);
        assert_eq!(req.state(), RoundState::Error);
        assert_eq!(memory.keys(), vec!["test/ag_free0".to_string()]);
    }

    #[test]
    fn test_unbounded_release_wait_failure() {
        let memory = MemoryStore::new();
        memory.set("test/teamr1", &[2]).unwrap();
        let faulty = FaultyStore::new(Arc::new(memory.clone())).fail(StoreOp::Wait);
        let coord = coordinator(0, 2, Arc::new(faulty));
        assert_eq!(coord.wait_policy(), WaitPolicy::Unbounded);

        let mut req = completed(&coord, &[1]);
        let err = coord.release(&mut req).unwrap_err();
        assert!(matches!(
            err,
            Error::Store {
                op: StoreOp::Wait,
                source: StoreError::Unreachable(_),
                ..
            }
        ));
        assert_eq!(err.kind(), ErrorKind::Store);
        assert_eq!(req.state(), RoundState::Error);
        assert_eq!(
            memory.keys(),
            vec![
                "test/ag_done".to_string(),
                "test/teamr0".to_string(),
                "test/teamr1".to_string(),
            ]
        );
    }

    #[test]
    fn test_get_failure_after_check_moves_to_error() {
        let memory = MemoryStore::new();
        memory.set("test/teamr1", &[2, 2]).unwrap();
        let faulty =
            Arc::new(FaultyStore::new(Arc::new(memory.clone())).fail_on_key(StoreOp::Get, "teamr1"));
        let coord = coordinator(0, 2, faulty.clone());

        let mut req = coord.new_request(2).unwrap();
        coord.initiate(&mut req, &[1, 1]).unwrap();
        let err = coord.poll(&mut req).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Store);
        assert!(matches!(err, Error::Store { op: StoreOp::Get, ref key, .. } if key == "test/teamr1"));
        assert_eq!(req.state(), RoundState::Error);
        assert_eq!(faulty.call_count(StoreOp::Check), 1);
        assert_eq!(coord.poll(&mut req).unwrap_err().kind(), ErrorKind::Protocol);

        // Both publish keys survive the failed collect
        assert_eq!(
            memory.keys(),
            vec!["test/teamr0".to_string(), "test/teamr1".to_string()]
        );

        faulty.heal(StoreOp::Get);
        let req = completed(&coord, &[3, 3]);
        assert_eq!(req.recv_buffer(), &[3, 3, 2, 2]);
    }

    #[test]
    fn test_allgather_times_out_under_bounded_policy() {
        let coord = coordinator(0, 2, Arc::new(MemoryStore::new()))
            .with_wait_policy(WaitPolicy::from_millis(15));
        let err = coord.allgather(&[1], Duration::from_millis(1)).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_wait_policy_from_millis() {
        assert_eq!(WaitPolicy::from_millis(0), WaitPolicy::Unbounded);
        assert_eq!(
            WaitPolicy::from_millis(250).timeout(),
            Some(Duration::from_millis(250))
        );
    }
}
