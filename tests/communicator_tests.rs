//! Communicator integration tests
//!
//! Bootstraps peer groups over the mock library and checks the lifecycle,
//! rollback and runtime paths.

mod common;

use std::sync::Arc;
use std::time::Duration;

use oob_bootstrap::comm::{
    CommConfig, CommLibrary, CommState, Communicator, LibraryCall, MockCommLibrary,
    MockLibraryConfig, OperationDesc, OperationStatus, ThreadMode,
};
use oob_bootstrap::error::{Error, ErrorKind};
use oob_bootstrap::store::MemoryStore;
use oob_bootstrap::trace::{CommsTracer, PayloadInfo};

use common::{peers, run_group};

fn quick_config(namespace: &str) -> CommConfig {
    CommConfig::default()
        .with_namespace(namespace)
        .with_wait_timeout(Duration::from_secs(10))
}

fn mock(config: MockLibraryConfig) -> Arc<MockCommLibrary> {
    Arc::new(MockCommLibrary::with_config(MockLibraryConfig {
        poll_interval: Duration::from_millis(1),
        ..config
    }))
}

/// Create one communicator per rank, each on its own thread
fn create_group(
    size: usize,
    namespace: &str,
    library: &Arc<MockCommLibrary>,
) -> (Arc<MemoryStore>, Vec<Result<Communicator, Error>>) {
    let store = Arc::new(MemoryStore::new());
    let group = peers(size, store.clone());
    let config = quick_config(namespace);
    let comms = run_group(size, |rank| {
        let library: Arc<dyn CommLibrary> = library.clone();
        Communicator::create(group[rank].clone(), &config, library)
    });
    (store, comms)
}

// ─────────────────────────────────────────────────────────────────
// Creation
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_group_create_exchanges_addresses() {
    let library = mock(MockLibraryConfig::default());
    let (store, comms) = create_group(4, "create", &library);
    let comms: Vec<Communicator> = comms.into_iter().map(|c| c.unwrap()).collect();

    let reference = comms[0].peer_addresses().unwrap();
    assert_eq!(reference.len(), 4);
    for comm in &comms {
        assert!(comm.is_ready());
        assert_eq!(comm.peer_addresses().unwrap(), reference);
    }
    assert_eq!(library.live_contexts(), 4);
    assert!(store.is_empty(), "bootstrap round left keys: {:?}", store.keys());
}

#[test]
fn test_estimated_eps_defaults_to_group_size() {
    let library = mock(MockLibraryConfig::default());
    let (_store, comms) = create_group(3, "eps", &library);
    assert!(comms.iter().all(|c| c.is_ok()));

    let config = library.last_config().unwrap();
    assert_eq!(config.get("ESTIMATED_NUM_EPS"), Some("3"));
    assert_eq!(config.prefix(), "OOB");
}

#[test]
fn test_single_thread_library_rejected_without_teardown() {
    let library = mock(MockLibraryConfig {
        thread_mode: ThreadMode::Single,
        ..Default::default()
    });
    let (_store, comms) = create_group(1, "single", &library);

    let err = comms.into_iter().next().unwrap().unwrap_err();
    assert!(matches!(err, Error::ThreadModeUnsupported { .. }));
    assert_eq!(err.kind(), ErrorKind::Init);
    assert!(library.teardown_calls().is_empty());
    assert_eq!(library.call_count(|c| *c == LibraryCall::Init), 0);
}

#[test]
fn test_funneled_library_rejected() {
    let library = mock(MockLibraryConfig {
        thread_mode: ThreadMode::Funneled,
        ..Default::default()
    });
    let (_store, comms) = create_group(1, "funneled", &library);

    let err = comms.into_iter().next().unwrap().unwrap_err();
    match &err {
        Error::ThreadModeUnsupported { required, actual } => {
            assert_eq!(required, "multi");
            assert_eq!(actual, "funneled");
        }
        other => panic!("expected ThreadModeUnsupported, got {:?}", other),
    }
    assert!(library.teardown_calls().is_empty());
    assert_eq!(library.call_count(|c| *c == LibraryCall::CreateWorker), 0);
}

#[test]
fn test_worker_failure_finalizes_library() {
    let library = mock(MockLibraryConfig {
        fail_worker: true,
        ..Default::default()
    });
    let (_store, comms) = create_group(1, "worker", &library);

    let err = comms.into_iter().next().unwrap().unwrap_err();
    assert!(matches!(err, Error::WorkerCreate { .. }));
    assert_eq!(err.kind(), ErrorKind::Resource);

    let teardown = library.teardown_calls();
    assert_eq!(teardown.len(), 1);
    assert!(matches!(teardown[0], LibraryCall::Finalize(_)));
    assert_eq!(library.live_libraries(), 0);
}

#[test]
fn test_context_failure_rolls_back_in_reverse_order() {
    let library = mock(MockLibraryConfig {
        fail_context: true,
        ..Default::default()
    });
    let (_store, comms) = create_group(2, "ctx", &library);

    for result in comms {
        let err = result.unwrap_err();
        assert!(matches!(err, Error::ContextCreate { .. }));
    }

    // Two peers, each releasing worker then library exactly once
    let teardown = library.teardown_calls();
    assert_eq!(teardown.len(), 4);
    assert_eq!(
        library.call_count(|c| matches!(c, LibraryCall::DestroyWorker(_))),
        2
    );
    assert_eq!(library.call_count(|c| matches!(c, LibraryCall::Finalize(_))), 2);
    assert_eq!(library.call_count(|c| matches!(c, LibraryCall::DestroyContext(_))), 0);
    assert_eq!(library.live_workers(), 0);
    assert_eq!(library.live_libraries(), 0);
}

#[test]
fn test_context_failure_order_single_peer() {
    let library = mock(MockLibraryConfig {
        fail_context: true,
        ..Default::default()
    });
    let (_store, _comms) = create_group(1, "ctx-order", &library);

    let teardown = library.teardown_calls();
    assert_eq!(teardown.len(), 2);
    assert!(matches!(teardown[0], LibraryCall::DestroyWorker(_)));
    assert!(matches!(teardown[1], LibraryCall::Finalize(_)));
}

#[test]
fn test_init_failure_releases_nothing() {
    let library = mock(MockLibraryConfig {
        fail_init: true,
        ..Default::default()
    });
    let (_store, comms) = create_group(1, "init", &library);

    let err = comms.into_iter().next().unwrap().unwrap_err();
    assert!(matches!(err, Error::LibraryInit { .. }));
    assert!(library.teardown_calls().is_empty());
}

// ─────────────────────────────────────────────────────────────────
// Runtime
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_operation_lifecycle() {
    let library = mock(MockLibraryConfig {
        ticks_to_complete: 2,
        ..Default::default()
    });
    let (_store, comms) = create_group(1, "ops", &library);
    let comm = comms.into_iter().next().unwrap().unwrap();

    let op = comm.submit(&OperationDesc::new("allreduce")).unwrap();
    assert_eq!(comm.outstanding(), 1);
    assert_eq!(comm.operation_status(op).unwrap(), OperationStatus::InProgress);

    let err = comm.complete_operation(op).unwrap_err();
    assert!(matches!(err, Error::OperationNotFinished { .. }));
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(comm.is_ready());

    comm.progress().unwrap();
    comm.progress().unwrap();
    assert_eq!(comm.operation_status(op).unwrap(), OperationStatus::Complete);
    comm.complete_operation(op).unwrap();
    assert_eq!(comm.outstanding(), 0);

    let err = comm.complete_operation(op).unwrap_err();
    assert!(matches!(err, Error::OperationAlreadyCompleted { .. }));
    assert!(comm.is_ready());
}

#[test]
fn test_concurrent_progress() {
    let library = mock(MockLibraryConfig {
        ticks_to_complete: 50,
        ..Default::default()
    });
    let (_store, comms) = create_group(1, "progress", &library);
    let comm = comms.into_iter().next().unwrap().unwrap();

    let ops: Vec<_> = (0..4)
        .map(|_| comm.submit(&OperationDesc::new("allgather")).unwrap())
        .collect();

    run_group(4, |_| {
        for _ in 0..25 {
            comm.progress().unwrap();
        }
    });

    for op in ops {
        comm.complete_operation(op).unwrap();
    }
    assert_eq!(library.pending_operations(), 0);
}

#[test]
fn test_submit_racing_destroy_leaves_nothing_outstanding() {
    for round in 0..20 {
        let library = mock(MockLibraryConfig {
            ticks_to_complete: 1000,
            ..Default::default()
        });
        let (_store, comms) = create_group(1, &format!("race{}", round), &library);
        let comm = comms.into_iter().next().unwrap().unwrap();

        std::thread::scope(|scope| {
            let submitter = scope.spawn(|| {
                while comm.submit(&OperationDesc::new("allreduce")).is_ok() {}
            });
            std::thread::sleep(Duration::from_micros(200));
            comm.destroy().unwrap();
            submitter.join().unwrap();
        });

        assert_eq!(comm.state(), CommState::Destroyed);
        assert_eq!(comm.outstanding(), 0);
        let err = comm.submit(&OperationDesc::new("barrier")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }
}

#[test]
fn test_progress_failure_marks_failed() {
    let library = mock(MockLibraryConfig {
        fail_progress: true,
        ..Default::default()
    });
    let (_store, comms) = create_group(1, "broken", &library);
    let comm = comms.into_iter().next().unwrap().unwrap();

    let err = comm.progress().unwrap_err();
    assert!(matches!(err, Error::EngineFailure { .. }));
    assert_eq!(comm.state(), CommState::Failed);

    // Further runtime calls are refused, teardown still works
    assert!(comm.submit(&OperationDesc::new("allreduce")).is_err());
    comm.destroy().unwrap();
    assert_eq!(comm.state(), CommState::Destroyed);
    assert_eq!(library.live_contexts(), 0);
}

#[test]
fn test_destroy_is_idempotent_and_ordered() {
    let library = mock(MockLibraryConfig::default());
    let (_store, comms) = create_group(1, "destroy", &library);
    let comm = comms.into_iter().next().unwrap().unwrap();
    library.reset_calls();

    comm.destroy().unwrap();
    comm.destroy().unwrap();
    drop(comm);

    let teardown = library.teardown_calls();
    assert_eq!(teardown.len(), 3);
    assert!(matches!(teardown[0], LibraryCall::DestroyContext(_)));
    assert!(matches!(teardown[1], LibraryCall::DestroyWorker(_)));
    assert!(matches!(teardown[2], LibraryCall::Finalize(_)));
}

#[test]
fn test_destroy_reports_first_failure_and_finishes() {
    let library = mock(MockLibraryConfig {
        fail_destroy_context: true,
        ..Default::default()
    });
    let (_store, comms) = create_group(1, "teardown", &library);
    let comm = comms.into_iter().next().unwrap().unwrap();

    let err = comm.destroy().unwrap_err();
    assert!(matches!(err, Error::Teardown { resource: "context", .. }));
    assert_eq!(comm.state(), CommState::Destroyed);
    assert_eq!(library.live_workers(), 0);
    assert_eq!(library.live_libraries(), 0);
}

#[test]
fn test_submit_records_trace() {
    let library = mock(MockLibraryConfig::default());
    let (_store, comms) = create_group(1, "traced", &library);
    let tracer = CommsTracer::new().shared();
    let comm = comms
        .into_iter()
        .next()
        .unwrap()
        .unwrap()
        .with_tracer(tracer.clone());

    let desc = OperationDesc::new("broadcast")
        .with_input(PayloadInfo::bytes(64))
        .with_output(PayloadInfo::bytes(64))
        .with_root(0);
    let op = comm.submit(&desc).unwrap();
    comm.submit(&OperationDesc::new("barrier")).unwrap();

    let tracer = tracer.lock();
    assert_eq!(tracer.len(), 2);
    let first = &tracer.records()[0];
    assert_eq!(first.comms, "broadcast");
    assert_eq!(first.req, op.0);
    assert_eq!(first.seqnum, 0);
    assert_eq!(first.root, Some(0));
    assert_eq!(first.in_msg_size, Some(64));

    let second = &tracer.records()[1];
    assert_eq!(second.seqnum, 1);
    assert_eq!(second.root, None);
    assert_eq!(second.in_msg_size, None);
}
