//! oob-bootstrap - out-of-band communicator bootstrap
//!
//! Peers of a group exchange fixed-size metadata through a shared key-value
//! store (`oob`), then use the exchanged addresses to bring up a
//! communication context over a pluggable library (`comm`). Submitted
//! operations can be recorded per process and flushed as JSON (`trace`).

pub mod comm;
pub mod config;
pub mod error;
pub mod logging;
pub mod oob;
pub mod simulate;
pub mod store;
pub mod trace;
pub mod version;

pub use comm::{CommConfig, CommLibrary, CommState, Communicator};
pub use config::BootstrapConfig;
pub use error::{Error, ErrorCode, ErrorKind, Result};
pub use oob::{KeyNamespace, OobCoordinator, PeerInfo, RendezvousStatus, RoundState, WaitPolicy};
pub use store::{KeyValueStore, MemoryStore, StoreError, StoreOp};
pub use trace::{CommsTracer, SharedTracer};
