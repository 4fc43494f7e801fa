//! In-process simulation driver
//!
//! Runs a whole peer group inside one process: every peer gets its own OS
//! thread, all of them sharing one `MemoryStore`. Each peer
//! first runs a raw rendezvous round, then bootstraps a `Communicator` over
//! the mock library and drives a batch of operations to completion.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};
use uuid::Uuid;

use crate::comm::{CommConfig, CommLibrary, Communicator, MockCommLibrary, MockLibraryConfig, OperationDesc, OperationId};
use crate::config::BootstrapConfig;
use crate::error::{Error, Result};
use crate::oob::{KeyNamespace, OobCoordinator, PeerInfo};
use crate::store::{KeyValueStore, MemoryStore};
use crate::trace::{CommsTracer, PayloadInfo};

/// Collective names cycled through by submitted operations
const OPERATION_NAMES: [&str; 4] = ["allreduce", "allgather", "broadcast", "alltoallv"];

/// Parameters of one simulation run
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub peers: usize,
    pub msg_len: usize,
    pub ops: u32,
    /// Record operations even when tracing is disabled in the config
    pub trace: bool,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            peers: 4,
            msg_len: 16,
            ops: 8,
            trace: false,
        }
    }
}

/// What a single peer observed
#[derive(Debug, Clone)]
pub struct PeerOutcome {
    pub rank: usize,
    pub gathered_bytes: usize,
    pub peer_addresses: usize,
    pub operations_completed: u32,
    pub trace_file: Option<PathBuf>,
}

/// Summary of a finished run
#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub run_id: String,
    pub namespace: String,
    pub peers: usize,
    pub msg_len: usize,
    pub outcomes: Vec<PeerOutcome>,
    /// Keys still present under the run namespace after every peer finished
    pub leftover_keys: usize,
    pub elapsed: Duration,
}

impl SimulationReport {
    pub fn operations_completed(&self) -> u64 {
        self.outcomes
            .iter()
            .map(|o| u64::from(o.operations_completed))
            .sum()
    }

    pub fn trace_files(&self) -> Vec<&PathBuf> {
        self.outcomes
            .iter()
            .filter_map(|o| o.trace_file.as_ref())
            .collect()
    }
}

impl fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Simulation {} complete", self.run_id)?;
        writeln!(f, "  Namespace:     {}", self.namespace)?;
        writeln!(f, "  Peers:         {}", self.peers)?;
        writeln!(
            f,
            "  Gathered:      {} bytes per peer",
            self.msg_len * self.peers
        )?;
        writeln!(f, "  Operations:    {}", self.operations_completed())?;
        writeln!(f, "  Leftover keys: {}", self.leftover_keys)?;
        for path in self.trace_files() {
            writeln!(f, "  Trace:         {}", path.display())?;
        }
        writeln!(f, "  Elapsed:       {:.2?}", self.elapsed)?;
        Ok(())
    }
}

/// Deterministic payload each rank publishes
pub fn payload_for(rank: usize, len: usize) -> Vec<u8> {
    (0..len).map(|i| (rank * 31 + i) as u8).collect()
}

/// Run the simulation described by `options`
pub async fn run(options: SimulationOptions, config: &BootstrapConfig) -> Result<SimulationReport> {
    if options.peers == 0 {
        return Err(Error::config_field_invalid("peers", "at least one peer is required"));
    }

    let started = Instant::now();
    let run_id = Uuid::new_v4().simple().to_string();
    let namespace = KeyNamespace::for_round(&config.rendezvous.namespace, &run_id);
    let store = Arc::new(MemoryStore::new());
    let library = Arc::new(MockCommLibrary::with_config(MockLibraryConfig {
        poll_interval: Duration::from_millis(config.rendezvous.poll_interval_ms),
        ..MockLibraryConfig::default()
    }));
    let comm_config = CommConfig::from_config(config).with_namespace(namespace.prefix());
    let trace = options.trace || config.tracing.enabled;
    let poll_interval = Duration::from_millis(config.rendezvous.poll_interval_ms);

    info!(
        run_id = %run_id,
        peers = options.peers,
        msg_len = options.msg_len,
        ops = options.ops,
        trace,
        "Starting simulation"
    );

    let tasks: Vec<PeerTask> = (0..options.peers)
        .map(|rank| PeerTask {
            rank,
            size: options.peers,
            msg_len: options.msg_len,
            ops: options.ops,
            store: store.clone(),
            library: library.clone(),
            comm_config: comm_config.clone(),
            poll_interval,
            trace_dir: trace.then(|| config.trace_dir()),
        })
        .collect();

    let results = tokio::task::spawn_blocking(move || run_peers(tasks))
        .await
        .map_err(|e| Error::Internal(format!("Peer supervisor panicked: {}", e)))??;

    let mut outcomes = Vec::with_capacity(options.peers);
    let mut first_error = None;
    for result in results {
        match result {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) if first_error.is_none() => first_error = Some(e),
            Err(_) => {}
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    let leftover_keys = store.keys_with_prefix(namespace.prefix()).len();
    let report = SimulationReport {
        run_id,
        namespace: namespace.prefix().to_string(),
        peers: options.peers,
        msg_len: options.msg_len,
        outcomes,
        leftover_keys,
        elapsed: started.elapsed(),
    };

    info!(
        operations = report.operations_completed(),
        leftover_keys,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Simulation finished"
    );
    Ok(report)
}

/// Run every peer on a dedicated thread and join them in rank order
///
/// No peer can finish its rendezvous until all have published, so the
/// group must never be sized by a shared pool such as tokio's blocking
/// threads.
fn run_peers(tasks: Vec<PeerTask>) -> Result<Vec<Result<PeerOutcome>>> {
    let mut handles = Vec::with_capacity(tasks.len());
    for task in tasks {
        let rank = task.rank;
        let handle = std::thread::Builder::new()
            .name(format!("oob-peer-{}", rank))
            .spawn(move || task.run())
            .map_err(|e| Error::Internal(format!("Failed to spawn peer {}: {}", rank, e)))?;
        handles.push(handle);
    }

    Ok(handles
        .into_iter()
        .enumerate()
        .map(|(rank, handle)| {
            handle
                .join()
                .map_err(|_| Error::Internal(format!("Peer {} panicked", rank)))
                .and_then(|r| r)
        })
        .collect())
}

/// Everything one peer needs on its thread
struct PeerTask {
    rank: usize,
    size: usize,
    msg_len: usize,
    ops: u32,
    store: Arc<MemoryStore>,
    library: Arc<MockCommLibrary>,
    comm_config: CommConfig,
    poll_interval: Duration,
    /// `Some` when tracing; the inner value is the configured directory
    trace_dir: Option<Option<PathBuf>>,
}

impl PeerTask {
    fn run(self) -> Result<PeerOutcome> {
        let store: Arc<dyn KeyValueStore> = self.store.clone();
        let peer = PeerInfo::new(self.rank, self.size, store)?;

        let gathered = self.rendezvous(&peer)?;

        let library: Arc<dyn CommLibrary> = self.library.clone();
        let mut comm = Communicator::create(peer, &self.comm_config, library)?;
        let tracer = self.trace_dir.clone().map(|dir| {
            let tracer = match dir {
                Some(dir) => CommsTracer::new().with_output_dir(dir),
                None => CommsTracer::new(),
            };
            tracer.shared()
        });
        if let Some(tracer) = &tracer {
            comm = comm.with_tracer(tracer.clone());
        }

        let peer_addresses = comm.peer_addresses()?.len();
        let operations_completed = self.drive_operations(&comm)?;

        let trace_file = match &tracer {
            Some(tracer) => tracer.lock().flush(self.rank, self.size)?,
            None => None,
        };
        comm.destroy()?;

        Ok(PeerOutcome {
            rank: self.rank,
            gathered_bytes: gathered,
            peer_addresses,
            operations_completed,
            trace_file,
        })
    }

    /// One raw round; every rank's block must match what that rank sent
    fn rendezvous(&self, peer: &PeerInfo) -> Result<usize> {
        let coordinator = OobCoordinator::new(
            peer.clone(),
            KeyNamespace::new(&self.comm_config.namespace),
        )
        .with_wait_policy(self.comm_config.wait_policy);
        let gathered = coordinator.allgather(&payload_for(self.rank, self.msg_len), self.poll_interval)?;

        let chunk = self.msg_len.max(1);
        for (rank, block) in gathered.chunks(chunk).enumerate() {
            if block != payload_for(rank, self.msg_len).as_slice() {
                return Err(Error::Internal(format!(
                    "rank {} received a corrupt block from rank {}",
                    self.rank, rank
                )));
            }
        }
        debug!(rank = self.rank, bytes = gathered.len(), "Rendezvous round verified");
        Ok(gathered.len())
    }

    fn drive_operations(&self, comm: &Communicator) -> Result<u32> {
        let mut pending = (0..self.ops)
            .map(|i| comm.submit(&self.describe(i as usize)))
            .collect::<Result<Vec<OperationId>>>()?;

        let mut completed = 0;
        while !pending.is_empty() {
            comm.progress()?;
            let mut unfinished = Vec::with_capacity(pending.len());
            for op in pending {
                match comm.complete_operation(op) {
                    Ok(()) => completed += 1,
                    Err(Error::OperationNotFinished { .. }) => unfinished.push(op),
                    Err(e) => return Err(e),
                }
            }
            pending = unfinished;
        }
        Ok(completed)
    }

    fn describe(&self, index: usize) -> OperationDesc {
        let name = OPERATION_NAMES[index % OPERATION_NAMES.len()];
        let len = self.msg_len as u64;
        let desc = OperationDesc::new(name).with_input(PayloadInfo::bytes(len));
        match name {
            "allgather" => desc.with_output(PayloadInfo::bytes(len * self.size as u64)),
            "broadcast" => desc
                .with_output(PayloadInfo::bytes(len))
                .with_root(index % self.size),
            "alltoallv" => {
                let split = vec![len / self.size as u64; self.size];
                desc.with_output(PayloadInfo::bytes(len))
                    .with_splits(split.clone(), split)
            }
            _ => desc.with_output(PayloadInfo::bytes(len)),
        }
    }
}
