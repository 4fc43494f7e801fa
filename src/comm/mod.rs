//! Communicator lifecycle on top of an external communication library
//!
//! The library is reached through the `CommLibrary` trait. Context creation
//! needs every peer's address, which the library gathers through the
//! `OobAllgather` plugin this module hands it; `StoreOobAllgather` backs
//! that plugin with the store rendezvous in `crate::oob`.

mod communicator;
mod library;
mod mock;
mod oob;

pub use communicator::{CommConfig, CommState, Communicator};
pub use library::{
    CommLibrary, ContextHandle, ContextParams, LibraryAttributes, LibraryConfig, LibraryError,
    LibraryHandle, LibraryResult, OperationDesc, OperationId, OperationStatus, ThreadMode,
    WorkerHandle, ESTIMATED_NUM_EPS,
};
pub use mock::{LibraryCall, MockCommLibrary, MockLibraryConfig, ADDRESS_LEN};
pub use oob::{OobAllgather, OobRequest, OobStatus, StoreOobAllgather};
