//! Out-of-band rendezvous allgather
//!
//! Lets `size` peers that can only reach each other through a shared
//! key-value store each obtain the rank-ordered concatenation of every
//! peer's published bytes, then drain the store namespace so the next
//! round can reuse it.
//!
//! A round runs in three phases:
//!
//! 1. **publish** - `initiate` writes this peer's bytes under its publish key
//! 2. **collect** - `poll` is called repeatedly until every publish key
//!    exists, then copies all of them into the receive buffer by rank
//! 3. **barrier-cleanup** - `release` counts arrivals on a shared counter;
//!    the last arriver deletes the round's keys and signals every rank,
//!    everyone else waits for that signal, then each peer deletes its own
//!    release key
//!
//! There is no coordinator peer; the last peer to reach the barrier does
//! the cleanup.

mod coordinator;
mod namespace;
mod peer;

pub use coordinator::{OobCoordinator, RendezvousRequest, RendezvousStatus, RoundState, WaitPolicy};
pub use namespace::KeyNamespace;
pub use peer::PeerInfo;
