//! Communicator lifecycle wrapper
//!
//! `UNINITIALIZED -> VALIDATING -> CONFIGURED -> BOOTSTRAPPING -> READY ->
//! DESTROYED`, with `FAILED` for a handle whose engine broke at runtime.
//! A failed `create` releases whatever it acquired, newest first, and
//! returns no handle at all.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, Level};

use super::{
    CommLibrary, ContextHandle, ContextParams, LibraryConfig, LibraryError, LibraryHandle,
    LibraryResult, OperationDesc, OperationId, OperationStatus, StoreOobAllgather, ThreadMode,
    WorkerHandle, ESTIMATED_NUM_EPS,
};
use crate::config::BootstrapConfig;
use crate::error::{Error, Result};
use crate::logging::{Phase, PhaseLogger};
use crate::oob::{KeyNamespace, OobCoordinator, PeerInfo, WaitPolicy};
use crate::trace::SharedTracer;

// ─────────────────────────────────────────────────────────────────
// State & Configuration
// ─────────────────────────────────────────────────────────────────

/// Lifecycle state of a communicator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommState {
    Uninitialized,
    Validating,
    Configured,
    Bootstrapping,
    Ready,
    Destroyed,
    Failed,
}

impl CommState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommState::Uninitialized => "uninitialized",
            CommState::Validating => "validating",
            CommState::Configured => "configured",
            CommState::Bootstrapping => "bootstrapping",
            CommState::Ready => "ready",
            CommState::Destroyed => "destroyed",
            CommState::Failed => "failed",
        }
    }
}

impl fmt::Display for CommState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings a communicator is created with
#[derive(Debug, Clone)]
pub struct CommConfig {
    /// Store key prefix for the bootstrap rendezvous
    pub namespace: String,

    /// Bound on the rendezvous release barrier
    pub wait_policy: WaitPolicy,

    /// Environment prefix the library reads its options from
    pub config_prefix: String,

    /// Endpoint estimate passed to the library; defaults to the peer count
    pub estimated_num_eps: Option<usize>,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            namespace: "oob".to_string(),
            wait_policy: WaitPolicy::Unbounded,
            config_prefix: "OOB".to_string(),
            estimated_num_eps: None,
        }
    }
}

impl CommConfig {
    pub fn from_config(config: &BootstrapConfig) -> Self {
        Self {
            namespace: config.rendezvous.namespace.clone(),
            wait_policy: WaitPolicy::from_millis(config.rendezvous.wait_timeout_ms),
            config_prefix: config.library.config_prefix.clone(),
            estimated_num_eps: config.library.estimated_num_eps,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_policy = WaitPolicy::Bounded(timeout);
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct Resources {
    lib: LibraryHandle,
    worker: WorkerHandle,
    ctx: ContextHandle,
}

#[derive(Debug)]
struct Inner {
    state: CommState,
    resources: Option<Resources>,
}

impl Inner {
    fn ready_context(&self, operation: &'static str) -> Result<ContextHandle> {
        match (self.state, self.resources) {
            (CommState::Ready, Some(resources)) => Ok(resources.ctx),
            (state, _) => Err(Error::invalid_state(operation, state)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Communicator
// ─────────────────────────────────────────────────────────────────

/// Owns one bootstrapped communication context
pub struct Communicator {
    peer: PeerInfo,
    library: Arc<dyn CommLibrary>,
    inner: RwLock<Inner>,
    outstanding: Mutex<HashSet<OperationId>>,
    tracer: Option<SharedTracer>,
    logger: PhaseLogger,
}

impl Communicator {
    /// Validate the library, acquire its resources and bootstrap a context
    ///
    /// Runs one rendezvous round with every other peer of `peer`'s group, so
    /// all of them must call `create` with the same namespace.
    pub fn create(
        peer: PeerInfo,
        config: &CommConfig,
        library: Arc<dyn CommLibrary>,
    ) -> Result<Self> {
        let mut logger = PhaseLogger::new(
            format!("[Communicator rank {}/{}]", peer.rank(), peer.size()),
            Phase::Init,
        );
        let mut state = CommState::Uninitialized;

        match Self::bootstrap(&peer, config, library.as_ref(), &mut logger, &mut state) {
            Ok(resources) => {
                logger.set_phase(Phase::Runtime);
                logger.log(Level::INFO, Phase::Bootstrap, "communicator ready");
                Ok(Self {
                    peer,
                    library,
                    inner: RwLock::new(Inner {
                        state: CommState::Ready,
                        resources: Some(resources),
                    }),
                    outstanding: Mutex::new(HashSet::new()),
                    tracer: None,
                    logger,
                })
            }
            Err(e) => {
                logger.log(
                    Level::ERROR,
                    Phase::Unknown,
                    format_args!("creation failed while {}: {}", state, e.format_for_log()),
                );
                Err(e)
            }
        }
    }

    fn bootstrap(
        peer: &PeerInfo,
        config: &CommConfig,
        library: &dyn CommLibrary,
        logger: &mut PhaseLogger,
        state: &mut CommState,
    ) -> Result<Resources> {
        *state = CommState::Validating;
        let attributes = library
            .query_attributes()
            .map_err(|e| Error::CapabilityQuery {
                message: e.to_string(),
            })?;
        // progress() is called from any thread, so nothing short of multi will do
        if attributes.max_thread_mode != ThreadMode::Multi {
            return Err(Error::ThreadModeUnsupported {
                required: ThreadMode::Multi.to_string(),
                actual: attributes.max_thread_mode.to_string(),
            });
        }
        debug!(
            library = %attributes.name,
            version = %attributes.version,
            thread_mode = %attributes.max_thread_mode,
            "Library capabilities validated"
        );

        let lib_config = Self::library_config(peer, config, library)?;
        *state = CommState::Configured;

        let lib = library.init(&lib_config).map_err(|e| Error::LibraryInit {
            message: e.to_string(),
        })?;

        let worker = match library.create_worker(lib, ThreadMode::Multi) {
            Ok(worker) => worker,
            Err(e) => {
                Self::rollback(library, logger, None, lib);
                return Err(Error::WorkerCreate {
                    message: e.to_string(),
                });
            }
        };

        *state = CommState::Bootstrapping;
        logger.set_phase(Phase::Bootstrap);
        let coordinator = OobCoordinator::new(peer.clone(), KeyNamespace::new(&config.namespace))
            .with_wait_policy(config.wait_policy);
        let oob = StoreOobAllgather::new(coordinator);
        let params = ContextParams {
            rank: peer.rank(),
            size: peer.size(),
            shared: true,
        };

        let ctx = match library.create_context(lib, worker, &params, &oob) {
            Ok(ctx) => ctx,
            Err(e) => {
                Self::rollback(library, logger, Some(worker), lib);
                return Err(Error::ContextCreate {
                    message: e.to_string(),
                });
            }
        };

        *state = CommState::Ready;
        Ok(Resources { lib, worker, ctx })
    }

    fn library_config(
        peer: &PeerInfo,
        config: &CommConfig,
        library: &dyn CommLibrary,
    ) -> Result<LibraryConfig> {
        let mut lib_config = library
            .read_config(&config.config_prefix)
            .map_err(|e| Error::ConfigRead {
                message: e.to_string(),
            })?;
        let eps = config.estimated_num_eps.unwrap_or(peer.size());
        lib_config
            .modify(ESTIMATED_NUM_EPS, eps.to_string())
            .map_err(|e| Error::ConfigRead {
                message: e.to_string(),
            })?;
        Ok(lib_config)
    }

    /// Release partially acquired resources, newest first
    fn rollback(
        library: &dyn CommLibrary,
        logger: &PhaseLogger,
        worker: Option<WorkerHandle>,
        lib: LibraryHandle,
    ) {
        if let Some(worker) = worker {
            if let Err(e) = library.destroy_worker(worker) {
                logger.log(Level::WARN, Phase::Teardown, format_args!("rollback: destroy worker failed: {}", e));
            }
        }
        if let Err(e) = library.finalize(lib) {
            logger.log(Level::WARN, Phase::Teardown, format_args!("rollback: finalize failed: {}", e));
        }
    }

    /// Attach a tracer; every `submit` is recorded to it
    pub fn with_tracer(mut self, tracer: SharedTracer) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn tracer(&self) -> Option<&SharedTracer> {
        self.tracer.as_ref()
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn state(&self) -> CommState {
        self.inner.read().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == CommState::Ready
    }

    /// Operations submitted and not yet completed
    pub fn outstanding(&self) -> usize {
        self.outstanding.lock().len()
    }

    /// Peer addresses gathered during bootstrap, by rank
    pub fn peer_addresses(&self) -> Result<Vec<Vec<u8>>> {
        let result = {
            let inner = self.inner.read();
            let ctx = inner.ready_context("read peer addresses")?;
            self.library.context_peers(ctx)
        };
        result.map_err(|e| self.fail("context_peers", e))
    }

    // ─────────────────────────────────────────────────────────────
    // Runtime
    // ─────────────────────────────────────────────────────────────

    /// Advance the engine one non-blocking step
    ///
    /// Safe to call from several threads at once; returns how many
    /// operations the step completed.
    pub fn progress(&self) -> Result<usize> {
        let result = {
            let inner = self.inner.read();
            let ctx = inner.ready_context("progress")?;
            self.library.progress(ctx)
        };
        result.map_err(|e| self.fail("progress", e))
    }

    /// Post an operation and record it to the attached tracer
    pub fn submit(&self, desc: &OperationDesc) -> Result<OperationId> {
        let result = {
            let inner = self.inner.read();
            let ctx = inner.ready_context("submit")?;
            let result = self.library.post_operation(ctx, desc);
            if let Ok(op) = result {
                self.outstanding.lock().insert(op);
            }
            result
        };
        let op = result.map_err(|e| self.fail("post_operation", e))?;

        if let Some(tracer) = &self.tracer {
            let mut tracer = tracer.lock();
            if let Some(root) = desc.root {
                tracer.record_optional_root(root);
            }
            if desc.in_split.is_some() || desc.out_split.is_some() {
                tracer.record_optional_splits(
                    desc.in_split.clone().unwrap_or_default(),
                    desc.out_split.clone().unwrap_or_default(),
                );
            }
            tracer.record_comms(
                &desc.name,
                op.0,
                self.peer.size(),
                desc.input.as_ref(),
                desc.output.as_ref(),
            );
        }

        debug!(op = op.0, name = %desc.name, "Operation submitted");
        Ok(op)
    }

    /// Current status of a submitted operation
    pub fn operation_status(&self, op: OperationId) -> Result<OperationStatus> {
        let result = {
            let inner = self.inner.read();
            let ctx = inner.ready_context("query operation")?;
            if !self.outstanding.lock().contains(&op) {
                return Err(Error::OperationAlreadyCompleted { op: op.0 });
            }
            self.library.operation_status(ctx, op)
        };
        result.map_err(|e| self.fail("operation_status", e))
    }

    /// Hand a finished operation's resources back to the engine
    ///
    /// Fails with a protocol error if `op` is still running or was already
    /// completed.
    pub fn complete_operation(&self, op: OperationId) -> Result<()> {
        let result = {
            let inner = self.inner.read();
            let ctx = inner.ready_context("complete operation")?;
            let mut outstanding = self.outstanding.lock();
            if !outstanding.contains(&op) {
                return Err(Error::OperationAlreadyCompleted { op: op.0 });
            }
            let result = match self.library.operation_status(ctx, op) {
                Ok(OperationStatus::InProgress) => {
                    return Err(Error::OperationNotFinished { op: op.0 });
                }
                Ok(OperationStatus::Complete) => self.library.finalize_operation(ctx, op),
                Ok(OperationStatus::Failed(message)) => Err(LibraryError::Engine(message)),
                Err(e) => Err(e),
            };
            outstanding.remove(&op);
            result
        };
        result.map_err(|e| self.fail("complete_operation", e))
    }

    fn fail(&self, operation: &'static str, source: LibraryError) -> Error {
        let mut inner = self.inner.write();
        if inner.state == CommState::Ready {
            inner.state = CommState::Failed;
        }
        self.logger.log(
            Level::ERROR,
            Phase::Runtime,
            format_args!("engine failure during {}: {}", operation, source),
        );
        Error::EngineFailure {
            operation,
            message: source.to_string(),
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Teardown
    // ─────────────────────────────────────────────────────────────

    /// Release the context, the worker and the library handle, in that order
    ///
    /// Idempotent. Every step is attempted even if an earlier one fails; the
    /// first failure is returned and the handle is `Destroyed` regardless.
    pub fn destroy(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.state == CommState::Destroyed {
            return Ok(());
        }
        inner.state = CommState::Destroyed;
        let Some(resources) = inner.resources.take() else {
            return Ok(());
        };
        self.outstanding.lock().clear();

        let mut first_error = None;
        let mut release = |resource: &'static str, result: LibraryResult<()>| {
            if let Err(e) = result {
                self.logger.log(
                    Level::WARN,
                    Phase::Teardown,
                    format_args!("failed to release {}: {}", resource, e),
                );
                first_error.get_or_insert(Error::Teardown {
                    resource,
                    message: e.to_string(),
                });
            }
        };
        release("context", self.library.destroy_context(resources.ctx));
        release("worker", self.library.destroy_worker(resources.worker));
        release("library", self.library.finalize(resources.lib));

        self.logger.log(Level::DEBUG, Phase::Teardown, "communicator destroyed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            self.logger.log(
                Level::WARN,
                Phase::Teardown,
                format_args!("destroy on drop failed: {}", e.format_for_log()),
            );
        }
    }
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{LibraryCall, MockCommLibrary, MockLibraryConfig};
    use crate::error::ErrorKind;
    use crate::store::MemoryStore;

    fn singleton_peer() -> PeerInfo {
        PeerInfo::new(0, 1, Arc::new(MemoryStore::new())).unwrap()
    }

    fn create_with(config: MockLibraryConfig) -> (Arc<MockCommLibrary>, Result<Communicator>) {
        let library = Arc::new(MockCommLibrary::with_config(config));
        let comm = Communicator::create(singleton_peer(), &CommConfig::default(), library.clone());
        (library, comm)
    }

    #[test]
    fn test_create_singleton() {
        let (library, comm) = create_with(MockLibraryConfig::default());
        let comm = comm.unwrap();
        assert_eq!(comm.state(), CommState::Ready);
        assert_eq!(comm.peer_addresses().unwrap().len(), 1);
        assert_eq!(library.live_contexts(), 1);
    }

    #[test]
    fn test_estimated_eps_override() {
        let library = Arc::new(MockCommLibrary::new());
        let config = CommConfig {
            estimated_num_eps: Some(64),
            ..Default::default()
        };
        let _comm = Communicator::create(singleton_peer(), &config, library.clone()).unwrap();
        let lib_config = library.last_config().unwrap();
        assert_eq!(lib_config.get(ESTIMATED_NUM_EPS), Some("64"));
    }

    #[test]
    fn test_query_failure_is_init_error() {
        let (library, comm) = create_with(MockLibraryConfig {
            fail_query: true,
            ..Default::default()
        });
        assert_eq!(comm.unwrap_err().kind(), ErrorKind::Init);
        assert!(library.teardown_calls().is_empty());
    }

    #[test]
    fn test_config_read_failure_acquires_nothing() {
        let (library, comm) = create_with(MockLibraryConfig {
            fail_config_read: true,
            ..Default::default()
        });
        assert!(matches!(comm.unwrap_err(), Error::ConfigRead { .. }));
        assert_eq!(library.call_count(|c| *c == LibraryCall::Init), 0);
    }

    #[test]
    fn test_init_failure_releases_nothing() {
        let (library, comm) = create_with(MockLibraryConfig {
            fail_init: true,
            ..Default::default()
        });
        assert_eq!(comm.unwrap_err().kind(), ErrorKind::Resource);
        assert!(library.teardown_calls().is_empty());
    }

    #[test]
    fn test_worker_failure_finalizes_library() {
        let (library, comm) = create_with(MockLibraryConfig {
            fail_worker: true,
            ..Default::default()
        });
        assert!(matches!(comm.unwrap_err(), Error::WorkerCreate { .. }));
        let teardown = library.teardown_calls();
        assert_eq!(teardown.len(), 1);
        assert!(matches!(teardown[0], LibraryCall::Finalize(_)));
        assert_eq!(library.live_libraries(), 0);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let (library, comm) = create_with(MockLibraryConfig::default());
        let comm = comm.unwrap();
        comm.destroy().unwrap();
        comm.destroy().unwrap();
        assert_eq!(comm.state(), CommState::Destroyed);
        assert_eq!(library.teardown_calls().len(), 3);
        assert_eq!(comm.progress().unwrap_err().kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_drop_destroys() {
        let (library, comm) = create_with(MockLibraryConfig::default());
        drop(comm.unwrap());
        assert_eq!(library.live_contexts(), 0);
        assert_eq!(library.live_workers(), 0);
        assert_eq!(library.live_libraries(), 0);
    }

    #[test]
    fn test_teardown_failure_still_releases_everything() {
        let (library, comm) = create_with(MockLibraryConfig {
            fail_destroy_context: true,
            ..Default::default()
        });
        let comm = comm.unwrap();
        let err = comm.destroy().unwrap_err();
        assert!(matches!(err, Error::Teardown { resource: "context", .. }));
        assert_eq!(comm.state(), CommState::Destroyed);
        assert_eq!(library.live_libraries(), 0);
    }
}
