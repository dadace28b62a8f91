//! Synchronization module: accumulate lock and cache maintenance
//!
//! - **AtomicLock**: per-rank mutual exclusion, local or remote atomics
//! - **CoherenceController**: invalidate-before-read, commit-after-write
//! - **Progress**: hook the lock spin yields to on every iteration

mod coherence;
mod lock;
mod progress;

pub use coherence::{CoherenceController, Strength};
pub use lock::{
    AcquireMode, AtomicLock, DistributedLock, LocalLock, LockStrategy, RemoteLock, LOCK_LOCKED,
    LOCK_UNLOCKED,
};
pub use progress::{Progress, YieldProgress};
