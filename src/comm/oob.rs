//! Out-of-band allgather plugin handed to the communication library

use tracing::error;

use crate::error::Result;
use crate::oob::{OobCoordinator, RendezvousRequest, RendezvousStatus, RoundState};

/// Result of testing an in-flight exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OobStatus {
    Ok,
    InProgress,
    Error,
}

/// In-flight exchange handle passed back to the plugin
#[derive(Debug)]
#[non_exhaustive]
pub enum OobRequest {
    Allgather(RendezvousRequest),
}

impl OobRequest {
    pub fn state(&self) -> RoundState {
        match self {
            OobRequest::Allgather(request) => request.state(),
        }
    }

    pub fn recv_buffer(&self) -> &[u8] {
        match self {
            OobRequest::Allgather(request) => request.recv_buffer(),
        }
    }
}

/// Exchange primitive the library drives during context creation
pub trait OobAllgather: Send + Sync {
    /// Number of endpoints taking part
    fn n_eps(&self) -> usize;

    /// This endpoint's index
    fn ep(&self) -> usize;

    /// Start gathering `send` from every endpoint
    fn allgather(&self, send: &[u8]) -> Result<OobRequest>;

    /// Non-blocking completion check
    fn test(&self, request: &mut OobRequest) -> OobStatus;

    /// Finish the exchange and return the gathered bytes, ordered by endpoint
    fn free(&self, request: OobRequest) -> Result<Vec<u8>>;
}

/// `OobAllgather` backed by the store rendezvous
pub struct StoreOobAllgather {
    coordinator: OobCoordinator,
}

impl StoreOobAllgather {
    pub fn new(coordinator: OobCoordinator) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &OobCoordinator {
        &self.coordinator
    }
}

impl OobAllgather for StoreOobAllgather {
    fn n_eps(&self) -> usize {
        self.coordinator.peer().size()
    }

    fn ep(&self) -> usize {
        self.coordinator.peer().rank()
    }

    fn allgather(&self, send: &[u8]) -> Result<OobRequest> {
        let mut request = self.coordinator.new_request(send.len()).map_err(|e| {
            error!(rank = self.ep(), error = %e, "OOB allgather could not size its buffer");
            e
        })?;
        if let Err(e) = self.coordinator.initiate(&mut request, send) {
            error!(rank = self.ep(), error = %e, "OOB allgather failed to publish");
            return Err(e);
        }
        Ok(OobRequest::Allgather(request))
    }

    fn test(&self, request: &mut OobRequest) -> OobStatus {
        match request {
            OobRequest::Allgather(request) => match self.coordinator.poll(request) {
                Ok(RendezvousStatus::Complete) => OobStatus::Ok,
                Ok(RendezvousStatus::InProgress) => OobStatus::InProgress,
                Err(e) => {
                    error!(rank = self.ep(), error = %e, "OOB allgather test failed");
                    OobStatus::Error
                }
            },
        }
    }

    fn free(&self, request: OobRequest) -> Result<Vec<u8>> {
        match request {
            OobRequest::Allgather(mut request) => {
                if let Err(e) = self.coordinator.release(&mut request) {
                    error!(rank = self.ep(), error = %e, "OOB allgather release failed");
                    return Err(e);
                }
                Ok(self.coordinator.free(request))
            }
        }
    }
}
