//! Per-engine operation counters

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub puts: AtomicU64,
    pub gets: AtomicU64,
    pub accumulates: AtomicU64,
    pub get_accumulates: AtomicU64,
    pub compare_and_swaps: AtomicU64,
    pub swaps: AtomicU64,
    pub fetch_and_ops: AtomicU64,
    pub lock_acquisitions: AtomicU64,
    pub lock_spins: AtomicU64,
    pub failures: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        EngineStats {
            puts: get(&self.puts),
            gets: get(&self.gets),
            accumulates: get(&self.accumulates),
            get_accumulates: get(&self.get_accumulates),
            compare_and_swaps: get(&self.compare_and_swaps),
            successful_swaps: get(&self.swaps),
            fetch_and_ops: get(&self.fetch_and_ops),
            lock_acquisitions: get(&self.lock_acquisitions),
            lock_spins: get(&self.lock_spins),
            failures: get(&self.failures),
        }
    }
}

/// Snapshot of what an engine has done so far
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub puts: u64,
    pub gets: u64,
    pub accumulates: u64,
    pub get_accumulates: u64,
    pub compare_and_swaps: u64,
    /// Compare-and-swaps whose comparison matched
    pub successful_swaps: u64,
    pub fetch_and_ops: u64,
    pub lock_acquisitions: u64,
    /// Spin iterations spent waiting on contended locks
    pub lock_spins: u64,
    /// Verbs that returned an error
    pub failures: u64,
}

impl EngineStats {
    pub fn total_ops(&self) -> u64 {
        self.puts
            + self.gets
            + self.accumulates
            + self.get_accumulates
            + self.compare_and_swaps
            + self.fetch_and_ops
    }

    pub fn summary(&self) -> String {
        format!(
            "{} ops (put {}, get {}, acc {}, get_acc {}, cas {}/{}, fop {}) | {} locks, {} spins | {} failed",
            self.total_ops(),
            self.puts,
            self.gets,
            self.accumulates,
            self.get_accumulates,
            self.successful_swaps,
            self.compare_and_swaps,
            self.fetch_and_ops,
            self.lock_acquisitions,
            self.lock_spins,
            self.failures
        )
    }
}
