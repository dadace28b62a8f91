//! Fabric module: what the engine needs from the network
//!
//! Remote windows are mapped into the origin's address space, so data is
//! moved with plain loads and stores through a possibly incoherent local
//! cache. Cache maintenance (`invalidate`, `commit`) and the remote-atomic
//! interface used by the accumulate lock complete the contract.
//!
//! `SimNetwork`/`SimFabric` provide an in-process implementation with one
//! segment per rank and an optional write-back line cache per origin.

mod sim;

pub use sim::{CachePolicy, FabricStats, SimFabric, SimNetwork};

use crate::window::{EndpointAddr, RemoteKey};

/// Transport-level failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FabricError {
    #[error("Address {addr:#x} (+{len} bytes) is not mapped")]
    Unmapped { addr: u64, len: usize },

    #[error("Unknown endpoint {0}")]
    UnknownEndpoint(EndpointAddr),

    #[error("Remote key rejected by {endpoint}")]
    AccessDenied { endpoint: EndpointAddr },

    #[error("Address {addr:#x} is not an atomic word of {endpoint}")]
    NotAtomic { endpoint: EndpointAddr, addr: u64 },

    #[error("Address {addr:#x} only accepts atomic updates")]
    ReadOnly { addr: u64 },
}

/// Memory-mapped access to every rank's window plus remote atomics
pub trait Fabric: Send + Sync {
    /// Load bytes from a mapped address (local or remote)
    fn load(&self, addr: u64, buf: &mut [u8]) -> Result<(), FabricError>;

    /// Store bytes to a mapped address (local or remote)
    fn store(&self, addr: u64, data: &[u8]) -> Result<(), FabricError>;

    /// Drop the local cached view of `[addr, addr + len)` so later loads
    /// observe committed remote data. `fence` orders the call ahead of a
    /// dependent network operation.
    fn invalidate(&self, addr: u64, len: usize, fence: bool) -> Result<(), FabricError>;

    /// Push local writes in `[addr, addr + len)` out to the owning rank
    fn commit(&self, addr: u64, len: usize, fence: bool) -> Result<(), FabricError>;

    /// Atomically write `value` to a remote word, returning the prior value
    fn fetch_atomic_write(
        &self,
        endpoint: EndpointAddr,
        addr: u64,
        key: RemoteKey,
        value: u64,
    ) -> Result<u64, FabricError>;

    /// Atomically replace a remote word equal to `compare` with `value`,
    /// returning the prior value
    fn compare_atomic(
        &self,
        endpoint: EndpointAddr,
        addr: u64,
        key: RemoteKey,
        compare: u64,
        value: u64,
    ) -> Result<u64, FabricError>;

    /// Fire-and-forget atomic write; no completion is awaited
    fn inject_atomic_write(
        &self,
        endpoint: EndpointAddr,
        addr: u64,
        key: RemoteKey,
        value: u64,
    ) -> Result<(), FabricError>;
}
