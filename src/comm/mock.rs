//! Mock communication library for testing and simulation
//!
//! Behaves like a real library from the communicator's point of view:
//! context creation runs a full out-of-band exchange of per-rank worker
//! addresses, and posted operations finish after a fixed number of
//! `progress` ticks. Each setup step can be made to fail, and every call is
//! logged so tests can check acquisition and release order.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use super::{
    CommLibrary, ContextHandle, ContextParams, LibraryAttributes, LibraryConfig, LibraryError,
    LibraryHandle, LibraryResult, OobAllgather, OobStatus, OperationDesc, OperationId,
    OperationStatus, ThreadMode, WorkerHandle, ESTIMATED_NUM_EPS,
};

/// Length of the address each mock worker publishes
pub const ADDRESS_LEN: usize = 32;

// ─────────────────────────────────────────────────────────────────
// Mock Library Configuration
// ─────────────────────────────────────────────────────────────────

/// Configuration for mock library behavior
#[derive(Debug, Clone)]
pub struct MockLibraryConfig {
    /// Reported library name
    pub name: String,

    /// Thread mode reported by `query_attributes`
    pub thread_mode: ThreadMode,

    /// Whether to fail on certain operations
    pub fail_query: bool,
    pub fail_config_read: bool,
    pub fail_init: bool,
    pub fail_worker: bool,
    pub fail_context: bool,
    pub fail_progress: bool,
    pub fail_destroy_context: bool,

    /// `progress` calls an operation needs before it completes
    pub ticks_to_complete: u32,

    /// Sleep between OOB `test` calls during context creation
    pub poll_interval: Duration,
}

impl Default for MockLibraryConfig {
    fn default() -> Self {
        Self {
            name: "mock".to_string(),
            thread_mode: ThreadMode::Multi,
            fail_query: false,
            fail_config_read: false,
            fail_init: false,
            fail_worker: false,
            fail_context: false,
            fail_progress: false,
            fail_destroy_context: false,
            ticks_to_complete: 1,
            poll_interval: Duration::from_millis(1),
        }
    }
}

/// One recorded library call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryCall {
    QueryAttributes,
    ReadConfig,
    Init,
    CreateWorker,
    CreateContext,
    ContextPeers,
    Progress,
    PostOperation,
    OperationStatus,
    FinalizeOperation,
    DestroyContext(ContextHandle),
    DestroyWorker(WorkerHandle),
    Finalize(LibraryHandle),
}

impl LibraryCall {
    /// Whether this call releases a resource
    pub fn is_teardown(&self) -> bool {
        matches!(
            self,
            LibraryCall::DestroyContext(_) | LibraryCall::DestroyWorker(_) | LibraryCall::Finalize(_)
        )
    }
}

// ─────────────────────────────────────────────────────────────────
// Mock Library
// ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct ContextEntry {
    worker: WorkerHandle,
    peers: Vec<Vec<u8>>,
}

#[derive(Debug)]
struct OperationEntry {
    ctx: ContextHandle,
    remaining_ticks: u32,
}

#[derive(Debug, Default)]
struct MockState {
    next_handle: u64,
    libraries: HashSet<LibraryHandle>,
    workers: HashMap<WorkerHandle, LibraryHandle>,
    contexts: HashMap<ContextHandle, ContextEntry>,
    operations: HashMap<OperationId, OperationEntry>,
    last_config: Option<LibraryConfig>,
}

impl MockState {
    fn next(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

/// Mock implementation of `CommLibrary` for testing
pub struct MockCommLibrary {
    config: MockLibraryConfig,
    state: Mutex<MockState>,
    calls: RwLock<Vec<LibraryCall>>,
}

impl Default for MockCommLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCommLibrary {
    /// Create a new mock library with default configuration
    pub fn new() -> Self {
        Self::with_config(MockLibraryConfig::default())
    }

    /// Create a new mock library with custom configuration
    pub fn with_config(config: MockLibraryConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MockState::default()),
            calls: RwLock::new(Vec::new()),
        }
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<LibraryCall> {
        self.calls.read().clone()
    }

    /// Teardown calls made so far, in order
    pub fn teardown_calls(&self) -> Vec<LibraryCall> {
        self.calls
            .read()
            .iter()
            .copied()
            .filter(LibraryCall::is_teardown)
            .collect()
    }

    /// Number of calls matching `predicate`
    pub fn call_count(&self, predicate: impl Fn(&LibraryCall) -> bool) -> usize {
        self.calls.read().iter().filter(|c| predicate(c)).count()
    }

    /// Reset the call log
    pub fn reset_calls(&self) {
        self.calls.write().clear();
    }

    pub fn live_libraries(&self) -> usize {
        self.state.lock().libraries.len()
    }

    pub fn live_workers(&self) -> usize {
        self.state.lock().workers.len()
    }

    pub fn live_contexts(&self) -> usize {
        self.state.lock().contexts.len()
    }

    pub fn pending_operations(&self) -> usize {
        self.state.lock().operations.len()
    }

    /// Configuration passed to the most recent `init`
    pub fn last_config(&self) -> Option<LibraryConfig> {
        self.state.lock().last_config.clone()
    }

    /// Address a mock worker publishes during context creation
    pub fn worker_address(name: &str, worker: WorkerHandle, rank: usize) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update(worker.0.to_le_bytes());
        hasher.update((rank as u64).to_le_bytes());
        hasher.finalize().to_vec()
    }

    fn record(&self, call: LibraryCall) {
        self.calls.write().push(call);
    }

    fn exchange_addresses(
        &self,
        worker: WorkerHandle,
        oob: &dyn OobAllgather,
    ) -> LibraryResult<Vec<Vec<u8>>> {
        let address = Self::worker_address(&self.config.name, worker, oob.ep());
        let oob_err = |e: crate::error::Error| LibraryError::OobFailed(e.to_string());

        let mut request = oob.allgather(&address).map_err(oob_err)?;
        loop {
            match oob.test(&mut request) {
                OobStatus::Ok => break,
                OobStatus::InProgress => {
                    trace!(ep = oob.ep(), "Waiting for peer addresses");
                    std::thread::sleep(self.config.poll_interval);
                }
                OobStatus::Error => {
                    return Err(LibraryError::OobFailed("address exchange test failed".into()));
                }
            }
        }
        let table = oob.free(request).map_err(oob_err)?;

        if table.len() != ADDRESS_LEN * oob.n_eps() {
            return Err(LibraryError::OobFailed(format!(
                "address table is {} bytes, expected {}",
                table.len(),
                ADDRESS_LEN * oob.n_eps()
            )));
        }
        Ok(table.chunks(ADDRESS_LEN).map(<[u8]>::to_vec).collect())
    }
}

impl CommLibrary for MockCommLibrary {
    fn query_attributes(&self) -> LibraryResult<LibraryAttributes> {
        self.record(LibraryCall::QueryAttributes);
        if self.config.fail_query {
            return Err(LibraryError::Unsupported("mock query failure".into()));
        }
        Ok(LibraryAttributes {
            name: self.config.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            max_thread_mode: self.config.thread_mode,
        })
    }

    fn read_config(&self, prefix: &str) -> LibraryResult<LibraryConfig> {
        self.record(LibraryCall::ReadConfig);
        if self.config.fail_config_read {
            return Err(LibraryError::NoResource("mock config read failure".into()));
        }
        Ok(LibraryConfig::new(prefix)
            .with_option(ESTIMATED_NUM_EPS, "0")
            .with_option("TRANSPORTS", "mock"))
    }

    fn init(&self, config: &LibraryConfig) -> LibraryResult<LibraryHandle> {
        self.record(LibraryCall::Init);
        if self.config.fail_init {
            return Err(LibraryError::NoResource("mock init failure".into()));
        }
        let mut state = self.state.lock();
        let lib = LibraryHandle(state.next());
        state.libraries.insert(lib);
        state.last_config = Some(config.clone());
        debug!(lib = lib.0, "Mock library initialized");
        Ok(lib)
    }

    fn create_worker(
        &self,
        lib: LibraryHandle,
        thread_mode: ThreadMode,
    ) -> LibraryResult<WorkerHandle> {
        self.record(LibraryCall::CreateWorker);
        if self.config.fail_worker {
            return Err(LibraryError::NoResource("mock worker failure".into()));
        }
        if thread_mode > self.config.thread_mode {
            return Err(LibraryError::Unsupported(format!(
                "thread mode {} not available",
                thread_mode
            )));
        }
        let mut state = self.state.lock();
        if !state.libraries.contains(&lib) {
            return Err(LibraryError::InvalidHandle(format!("library {}", lib.0)));
        }
        let worker = WorkerHandle(state.next());
        state.workers.insert(worker, lib);
        Ok(worker)
    }

    fn create_context(
        &self,
        lib: LibraryHandle,
        worker: WorkerHandle,
        params: &ContextParams,
        oob: &dyn OobAllgather,
    ) -> LibraryResult<ContextHandle> {
        self.record(LibraryCall::CreateContext);
        if self.config.fail_context {
            return Err(LibraryError::NoResource("mock context failure".into()));
        }
        {
            let state = self.state.lock();
            if state.workers.get(&worker) != Some(&lib) {
                return Err(LibraryError::InvalidHandle(format!("worker {}", worker.0)));
            }
        }
        if oob.n_eps() != params.size || oob.ep() != params.rank {
            return Err(LibraryError::InvalidParam(format!(
                "oob endpoint {}/{} does not match rank {}/{}",
                oob.ep(),
                oob.n_eps(),
                params.rank,
                params.size
            )));
        }

        // state lock is not held while peers rendezvous
        let peers = self.exchange_addresses(worker, oob)?;

        let mut state = self.state.lock();
        let ctx = ContextHandle(state.next());
        debug!(
            ctx = ctx.0,
            rank = params.rank,
            peers = peers.len(),
            self_addr = %peers.get(params.rank).map(|a| hex::encode(&a[..8])).unwrap_or_default(),
            "Mock context created"
        );
        state.contexts.insert(ctx, ContextEntry { worker, peers });
        Ok(ctx)
    }

    fn context_peers(&self, ctx: ContextHandle) -> LibraryResult<Vec<Vec<u8>>> {
        self.record(LibraryCall::ContextPeers);
        let state = self.state.lock();
        state
            .contexts
            .get(&ctx)
            .map(|entry| entry.peers.clone())
            .ok_or_else(|| LibraryError::InvalidHandle(format!("context {}", ctx.0)))
    }

    fn progress(&self, ctx: ContextHandle) -> LibraryResult<usize> {
        self.record(LibraryCall::Progress);
        if self.config.fail_progress {
            return Err(LibraryError::Engine("mock progress failure".into()));
        }
        let mut state = self.state.lock();
        if !state.contexts.contains_key(&ctx) {
            return Err(LibraryError::InvalidHandle(format!("context {}", ctx.0)));
        }
        let mut completed = 0;
        for entry in state.operations.values_mut().filter(|e| e.ctx == ctx) {
            if entry.remaining_ticks > 0 {
                entry.remaining_ticks -= 1;
                if entry.remaining_ticks == 0 {
                    completed += 1;
                }
            }
        }
        Ok(completed)
    }

    fn post_operation(
        &self,
        ctx: ContextHandle,
        desc: &OperationDesc,
    ) -> LibraryResult<OperationId> {
        self.record(LibraryCall::PostOperation);
        let mut state = self.state.lock();
        if !state.contexts.contains_key(&ctx) {
            return Err(LibraryError::InvalidHandle(format!("context {}", ctx.0)));
        }
        let op = OperationId(state.next());
        state.operations.insert(
            op,
            OperationEntry {
                ctx,
                remaining_ticks: self.config.ticks_to_complete,
            },
        );
        trace!(op = op.0, name = %desc.name, "Mock operation posted");
        Ok(op)
    }

    fn operation_status(
        &self,
        ctx: ContextHandle,
        op: OperationId,
    ) -> LibraryResult<OperationStatus> {
        self.record(LibraryCall::OperationStatus);
        let state = self.state.lock();
        match state.operations.get(&op) {
            Some(entry) if entry.ctx == ctx => Ok(if entry.remaining_ticks == 0 {
                OperationStatus::Complete
            } else {
                OperationStatus::InProgress
            }),
            _ => Err(LibraryError::InvalidHandle(format!("operation {}", op))),
        }
    }

    fn finalize_operation(&self, ctx: ContextHandle, op: OperationId) -> LibraryResult<()> {
        self.record(LibraryCall::FinalizeOperation);
        let mut state = self.state.lock();
        match state.operations.get(&op) {
            Some(entry) if entry.ctx == ctx && entry.remaining_ticks == 0 => {
                state.operations.remove(&op);
                Ok(())
            }
            Some(entry) if entry.ctx == ctx => Err(LibraryError::InvalidParam(format!(
                "operation {} still in progress",
                op
            ))),
            _ => Err(LibraryError::InvalidHandle(format!("operation {}", op))),
        }
    }

    fn destroy_context(&self, ctx: ContextHandle) -> LibraryResult<()> {
        self.record(LibraryCall::DestroyContext(ctx));
        let mut state = self.state.lock();
        let entry = state
            .contexts
            .remove(&ctx)
            .ok_or_else(|| LibraryError::InvalidHandle(format!("context {}", ctx.0)))?;
        state.operations.retain(|_, op| op.ctx != ctx);
        trace!(ctx = ctx.0, worker = entry.worker.0, "Mock context destroyed");
        if self.config.fail_destroy_context {
            return Err(LibraryError::Engine("mock context destroy failure".into()));
        }
        Ok(())
    }

    fn destroy_worker(&self, worker: WorkerHandle) -> LibraryResult<()> {
        self.record(LibraryCall::DestroyWorker(worker));
        self.state
            .lock()
            .workers
            .remove(&worker)
            .map(|_| ())
            .ok_or_else(|| LibraryError::InvalidHandle(format!("worker {}", worker.0)))
    }

    fn finalize(&self, lib: LibraryHandle) -> LibraryResult<()> {
        self.record(LibraryCall::Finalize(lib));
        if self.state.lock().libraries.remove(&lib) {
            Ok(())
        } else {
            Err(LibraryError::InvalidHandle(format!("library {}", lib.0)))
        }
    }
}
