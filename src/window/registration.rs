//! Window registration table and per-rank node state
//!
//! The registration service runs outside this crate; what it publishes
//! for every rank (base address, displacement unit, remote key, endpoint
//! handle and lock word address) is captured in a `RankEntry`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cache line size assumed for lock word padding and line caching
pub const CACHELINE: usize = 64;

/// Access key a remote rank must present for fabric atomics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteKey(pub u64);

/// Fabric endpoint handle of a rank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointAddr(pub u64);

impl fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep:{:#x}", self.0)
    }
}

/// What every participant knows about one rank's window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankEntry {
    /// Address of displacement 0 in this rank's region
    pub base: u64,
    /// Bytes per unit of displacement
    pub disp_unit: u64,
    /// Size of the exposed region in bytes
    pub size: usize,
    /// Key for remote atomics against this rank
    pub key: RemoteKey,
    /// Fabric endpoint of this rank
    pub endpoint: EndpointAddr,
    /// Address of this rank's `NodeState` lock word
    pub state_addr: u64,
}

/// Per-rank state co-located with the window.
///
/// Holds the accumulate lock word; it serializes every
/// read-modify-write verb against the owning rank's region.
#[derive(Debug, Default)]
#[repr(align(64))]
pub struct NodeState {
    pub accumulate_lock: AtomicU64,
}

impl NodeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of the lock word
    pub fn lock_word(&self) -> u64 {
        self.accumulate_lock.load(Ordering::Acquire)
    }
}

/// A window as seen from one rank
#[derive(Debug, Clone)]
pub struct Window {
    /// Identifier of the registered window, shared by every rank's view
    pub id: String,
    rank: usize,
    entries: Vec<RankEntry>,
    local_state: Arc<NodeState>,
}

impl Window {
    /// Build a window view for `rank` from the published registration table
    pub fn new(
        id: impl Into<String>,
        rank: usize,
        entries: Vec<RankEntry>,
        local_state: Arc<NodeState>,
    ) -> Self {
        Self {
            id: id.into(),
            rank,
            entries,
            local_state,
        }
    }

    /// Rank of the process owning this view
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of participating ranks
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Registration entry for `target`.
    ///
    /// Ranks are validated upstream; an out-of-range rank panics.
    pub fn entry(&self, target: usize) -> &RankEntry {
        &self.entries[target]
    }

    pub fn entries(&self) -> &[RankEntry] {
        &self.entries
    }

    /// The node state of the local rank
    pub fn local_state(&self) -> &NodeState {
        &self.local_state
    }

    pub fn is_local(&self, target: usize) -> bool {
        target == self.rank
    }
}
