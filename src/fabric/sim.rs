//! Simulated fabric: every rank's window lives in one process
//!
//! `SimNetwork` plays the registration service: it allocates one segment
//! per rank (data region, lock word, remote key, endpoint) and publishes
//! the resulting `Window` views. `SimFabric` is one origin's attachment.
//! Under `CachePolicy::WriteBack` remote loads and stores go through a
//! private line cache that is only reconciled by `invalidate`/`commit`,
//! which is what makes cache maintenance observable in tests.

use super::{Fabric, FabricError};
use crate::config::SimConfig;
use crate::window::{EndpointAddr, NodeState, RankEntry, RemoteKey, Window, CACHELINE};
use log::{info, trace};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{fence, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Distance between consecutive segment base addresses
const SEGMENT_STRIDE: u64 = 1 << 32;
/// Endpoint handles are offset so that 0 is never a valid endpoint
const ENDPOINT_BASE: u64 = 0x100;

/// How an origin's view of remote memory is cached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachePolicy {
    /// Loads and stores go straight to the owning segment
    WriteThrough,
    /// Remote lines are cached per origin until invalidated or committed
    WriteBack,
}

/// One rank's registered memory
struct Segment {
    rank: usize,
    entry: RankEntry,
    state: Arc<NodeState>,
    data: Box<[AtomicU8]>,
}

impl Segment {
    fn holds_data(&self, addr: u64, len: usize) -> bool {
        addr >= self.entry.base
            && addr
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.entry.base + self.entry.size as u64)
    }

    fn holds_state(&self, addr: u64, len: usize) -> bool {
        addr >= self.entry.state_addr
            && addr
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.entry.state_addr + 8)
    }

    fn contains(&self, addr: u64, len: usize) -> bool {
        self.holds_data(addr, len) || self.holds_state(addr, len)
    }

    fn read(&self, addr: u64, buf: &mut [u8]) {
        if self.holds_state(addr, buf.len()) {
            let word = self.state.accumulate_lock.load(Ordering::Acquire).to_ne_bytes();
            let start = (addr - self.entry.state_addr) as usize;
            buf.copy_from_slice(&word[start..start + buf.len()]);
            return;
        }
        let start = (addr - self.entry.base) as usize;
        for (dst, cell) in buf.iter_mut().zip(&self.data[start..]) {
            *dst = cell.load(Ordering::Relaxed);
        }
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<(), FabricError> {
        if !self.holds_data(addr, data.len()) {
            return Err(FabricError::ReadOnly { addr });
        }
        let start = (addr - self.entry.base) as usize;
        for (cell, byte) in self.data[start..].iter().zip(data) {
            cell.store(*byte, Ordering::Relaxed);
        }
        Ok(())
    }

    fn read_line(&self, line_addr: u64) -> [u8; CACHELINE] {
        let mut bytes = [0u8; CACHELINE];
        if line_addr == self.entry.state_addr {
            self.read(line_addr, &mut bytes[..8]);
        } else {
            self.read(line_addr, &mut bytes);
        }
        bytes
    }

    fn write_back(&self, line_addr: u64, line: &CacheLine) {
        let start = (line_addr - self.entry.base) as usize;
        for (i, byte) in line.bytes.iter().enumerate() {
            if line.dirty & (1u64 << i) != 0 {
                self.data[start + i].store(*byte, Ordering::Relaxed);
            }
        }
    }
}

/// The shared "network": all segments plus the published registration table
pub struct SimNetwork {
    window_id: String,
    segments: Vec<Segment>,
    policy: CachePolicy,
}

impl SimNetwork {
    /// Allocate and register one segment per rank
    pub fn new(config: &SimConfig) -> Arc<Self> {
        let size = config.window_bytes.div_ceil(CACHELINE) * CACHELINE;
        let segments = (0..config.ranks)
            .map(|rank| {
                let base = (rank as u64 + 1) * SEGMENT_STRIDE;
                let entry = RankEntry {
                    base,
                    disp_unit: config.disp_unit,
                    size,
                    key: RemoteKey(rand::random::<u64>()),
                    endpoint: EndpointAddr(ENDPOINT_BASE + rank as u64),
                    state_addr: base - CACHELINE as u64,
                };
                Segment {
                    rank,
                    entry,
                    state: Arc::new(NodeState::new()),
                    data: (0..size).map(|_| AtomicU8::new(0)).collect(),
                }
            })
            .collect();
        let window_id = uuid::Uuid::new_v4().to_string();
        info!(
            "Registered simulated window {}: {} ranks x {} bytes, disp_unit={}, cache={:?}",
            window_id, config.ranks, size, config.disp_unit, config.cache_policy
        );
        Arc::new(Self {
            window_id,
            segments,
            policy: config.cache_policy,
        })
    }

    pub fn ranks(&self) -> usize {
        self.segments.len()
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    /// The window view published to `rank`
    pub fn window(&self, rank: usize) -> Window {
        let entries = self.segments.iter().map(|s| s.entry.clone()).collect();
        Window::new(
            self.window_id.clone(),
            rank,
            entries,
            self.segments[rank].state.clone(),
        )
    }

    /// Attach origin `rank` to the network
    pub fn endpoint(self: &Arc<Self>, rank: usize) -> SimFabric {
        SimFabric {
            rank,
            network: Arc::clone(self),
            lines: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Committed contents of `rank`'s data region
    pub fn read_memory(&self, rank: usize, offset: usize, len: usize) -> Vec<u8> {
        let seg = &self.segments[rank];
        let mut buf = vec![0u8; len];
        seg.read(seg.entry.base + offset as u64, &mut buf);
        buf
    }

    /// Current value of `rank`'s accumulate lock word
    pub fn lock_word(&self, rank: usize) -> u64 {
        self.segments[rank].state.lock_word()
    }

    fn segment_at(&self, addr: u64, len: usize) -> Result<&Segment, FabricError> {
        self.segments
            .iter()
            .find(|s| s.contains(addr, len))
            .ok_or(FabricError::Unmapped { addr, len })
    }

    fn atomic_word(
        &self,
        endpoint: EndpointAddr,
        addr: u64,
        key: RemoteKey,
    ) -> Result<&AtomicU64, FabricError> {
        let seg = self
            .segments
            .iter()
            .find(|s| s.entry.endpoint == endpoint)
            .ok_or(FabricError::UnknownEndpoint(endpoint))?;
        if seg.entry.key != key {
            return Err(FabricError::AccessDenied { endpoint });
        }
        if addr != seg.entry.state_addr {
            return Err(FabricError::NotAtomic { endpoint, addr });
        }
        Ok(&seg.state.accumulate_lock)
    }
}

struct CacheLine {
    bytes: [u8; CACHELINE],
    /// Bit i set when byte i was written since the last commit
    dirty: u64,
}

#[derive(Default)]
struct Counters {
    loads: AtomicU64,
    stores: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    invalidations: AtomicU64,
    commits: AtomicU64,
    writebacks: AtomicU64,
    atomics: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Snapshot of one origin's fabric activity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricStats {
    pub loads: u64,
    pub stores: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub invalidations: u64,
    pub commits: u64,
    pub writebacks: u64,
    pub atomics: u64,
}

/// One origin's attachment to a `SimNetwork`
pub struct SimFabric {
    rank: usize,
    network: Arc<SimNetwork>,
    /// Remote lines keyed by line address
    lines: Mutex<HashMap<u64, CacheLine>>,
    counters: Counters,
}

/// Line-aligned addresses covering `[addr, addr + len)`
fn line_span(addr: u64, len: usize) -> impl Iterator<Item = u64> {
    let first = addr & !(CACHELINE as u64 - 1);
    let end = addr + len.max(1) as u64;
    (first..end).step_by(CACHELINE)
}

impl SimFabric {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn network(&self) -> &Arc<SimNetwork> {
        &self.network
    }

    /// Number of remote lines currently cached
    pub fn cached_lines(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn stats(&self) -> FabricStats {
        let c = &self.counters;
        FabricStats {
            loads: c.loads.load(Ordering::Relaxed),
            stores: c.stores.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            cache_misses: c.cache_misses.load(Ordering::Relaxed),
            invalidations: c.invalidations.load(Ordering::Relaxed),
            commits: c.commits.load(Ordering::Relaxed),
            writebacks: c.writebacks.load(Ordering::Relaxed),
            atomics: c.atomics.load(Ordering::Relaxed),
        }
    }

    /// Whether accesses to `seg` bypass the line cache
    fn uncached(&self, seg: &Segment) -> bool {
        seg.rank == self.rank || self.network.policy == CachePolicy::WriteThrough
    }

    /// Run `f` on every cached line overlapping `[addr, addr + len)`,
    /// filling missing lines from the segment first
    fn with_lines(
        &self,
        seg: &Segment,
        addr: u64,
        len: usize,
        mut f: impl FnMut(&mut CacheLine, std::ops::Range<usize>, std::ops::Range<usize>),
    ) {
        let mut lines = self.lines.lock();
        let end = addr + len as u64;
        for line_addr in line_span(addr, len) {
            let lo = addr.max(line_addr);
            let hi = end.min(line_addr + CACHELINE as u64);
            if lo >= hi {
                continue;
            }
            let line = match lines.entry(line_addr) {
                Entry::Occupied(cached) => {
                    bump(&self.counters.cache_hits);
                    cached.into_mut()
                }
                Entry::Vacant(slot) => {
                    bump(&self.counters.cache_misses);
                    slot.insert(CacheLine {
                        bytes: seg.read_line(line_addr),
                        dirty: 0,
                    })
                }
            };
            let in_line = (lo - line_addr) as usize..(hi - line_addr) as usize;
            let in_buf = (lo - addr) as usize..(hi - addr) as usize;
            f(line, in_line, in_buf);
        }
    }
}

impl Fabric for SimFabric {
    fn load(&self, addr: u64, buf: &mut [u8]) -> Result<(), FabricError> {
        let seg = self.network.segment_at(addr, buf.len())?;
        bump(&self.counters.loads);
        if self.uncached(seg) {
            seg.read(addr, buf);
            return Ok(());
        }
        self.with_lines(seg, addr, buf.len(), |line, in_line, in_buf| {
            buf[in_buf].copy_from_slice(&line.bytes[in_line]);
        });
        Ok(())
    }

    fn store(&self, addr: u64, data: &[u8]) -> Result<(), FabricError> {
        let seg = self.network.segment_at(addr, data.len())?;
        bump(&self.counters.stores);
        if self.uncached(seg) || seg.holds_state(addr, data.len()) {
            return seg.write(addr, data);
        }
        self.with_lines(seg, addr, data.len(), |line, in_line, in_buf| {
            for i in in_line.clone() {
                line.dirty |= 1u64 << i;
            }
            line.bytes[in_line].copy_from_slice(&data[in_buf]);
        });
        Ok(())
    }

    fn invalidate(&self, addr: u64, len: usize, fence_after: bool) -> Result<(), FabricError> {
        let seg = self.network.segment_at(addr, len)?;
        bump(&self.counters.invalidations);
        if !self.uncached(seg) {
            let mut lines = self.lines.lock();
            for line_addr in line_span(addr, len) {
                if let Some(line) = lines.remove(&line_addr) {
                    // Dirty bytes are evicted, never discarded
                    if line.dirty != 0 {
                        seg.write_back(line_addr, &line);
                        bump(&self.counters.writebacks);
                    }
                }
            }
        }
        if fence_after {
            fence(Ordering::SeqCst);
        }
        trace!("rank {} invalidate {:#x}+{}", self.rank, addr, len);
        Ok(())
    }

    fn commit(&self, addr: u64, len: usize, fence_after: bool) -> Result<(), FabricError> {
        let seg = self.network.segment_at(addr, len)?;
        bump(&self.counters.commits);
        if !self.uncached(seg) {
            let mut lines = self.lines.lock();
            for line_addr in line_span(addr, len) {
                if let Some(line) = lines.get_mut(&line_addr) {
                    if line.dirty != 0 {
                        seg.write_back(line_addr, line);
                        line.dirty = 0;
                        bump(&self.counters.writebacks);
                    }
                }
            }
        }
        if fence_after {
            fence(Ordering::SeqCst);
        }
        trace!("rank {} commit {:#x}+{}", self.rank, addr, len);
        Ok(())
    }

    fn fetch_atomic_write(
        &self,
        endpoint: EndpointAddr,
        addr: u64,
        key: RemoteKey,
        value: u64,
    ) -> Result<u64, FabricError> {
        let word = self.network.atomic_word(endpoint, addr, key)?;
        bump(&self.counters.atomics);
        Ok(word.swap(value, Ordering::AcqRel))
    }

    fn compare_atomic(
        &self,
        endpoint: EndpointAddr,
        addr: u64,
        key: RemoteKey,
        compare: u64,
        value: u64,
    ) -> Result<u64, FabricError> {
        let word = self.network.atomic_word(endpoint, addr, key)?;
        bump(&self.counters.atomics);
        match word.compare_exchange(compare, value, Ordering::AcqRel, Ordering::Acquire) {
            Ok(prev) | Err(prev) => Ok(prev),
        }
    }

    fn inject_atomic_write(
        &self,
        endpoint: EndpointAddr,
        addr: u64,
        key: RemoteKey,
        value: u64,
    ) -> Result<(), FabricError> {
        let word = self.network.atomic_word(endpoint, addr, key)?;
        bump(&self.counters.atomics);
        word.store(value, Ordering::Release);
        Ok(())
    }
}
