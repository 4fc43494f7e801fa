//! Peer identity within a rendezvous group

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::store::KeyValueStore;

/// A peer's place in the group plus its handle to the shared store
#[derive(Clone)]
pub struct PeerInfo {
    rank: usize,
    size: usize,
    store: Arc<dyn KeyValueStore>,
}

impl PeerInfo {
    /// Create peer info; `rank` must be in `[0, size)`
    pub fn new(rank: usize, size: usize, store: Arc<dyn KeyValueStore>) -> Result<Self> {
        if size == 0 || rank >= size {
            return Err(Error::InvalidPeer { rank, size });
        }
        Ok(Self { rank, size, store })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Whether this peer is the only member of its group
    pub fn is_singleton(&self) -> bool {
        self.size == 1
    }
}

impl fmt::Debug for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerInfo")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}
