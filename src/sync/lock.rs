//! AtomicLock: per-rank accumulate lock
//!
//! One lock word per rank serializes every read-modify-write verb
//! against that rank's region, across all origins including the owner.
//! The owner takes it with local atomics; everybody else goes through
//! the fabric's remote atomics. Both strategies sit behind
//! `DistributedLock` and are picked by target locality.

use super::coherence::{CoherenceController, Strength};
use super::progress::Progress;
use crate::error::{RmaError, RmaResult};
use crate::fabric::Fabric;
use crate::window::{AddressTranslator, NodeState, RankEntry, Window};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;

/// Lock word value when nobody holds the lock
pub const LOCK_UNLOCKED: u64 = 0;
/// Lock word value while held
pub const LOCK_LOCKED: u64 = 1;

/// Primitive used to take the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AcquireMode {
    /// Unconditional exchange; cheaper, and equivalent here because the
    /// prior value alone decides ownership
    #[default]
    Swap,
    /// Compare-and-swap from Unlocked to Locked
    CompareAndSwap,
}

/// Mutual exclusion on one rank's lock word
pub trait DistributedLock {
    /// Single acquisition attempt; true iff the prior value was Unlocked
    fn try_lock(&self) -> RmaResult<bool>;

    /// Read the current lock word, refreshing any cached copy first
    fn observe(&self) -> RmaResult<u64>;

    fn unlock(&self) -> RmaResult<()>;
}

/// Lock word owned by the calling rank
pub struct LocalLock<'a> {
    state: &'a NodeState,
    mode: AcquireMode,
}

impl<'a> DistributedLock for LocalLock<'a> {
    fn try_lock(&self) -> RmaResult<bool> {
        let word = &self.state.accumulate_lock;
        let acquired = match self.mode {
            AcquireMode::Swap => word.swap(LOCK_LOCKED, Ordering::Acquire) == LOCK_UNLOCKED,
            AcquireMode::CompareAndSwap => word
                .compare_exchange(LOCK_UNLOCKED, LOCK_LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok(),
        };
        Ok(acquired)
    }

    fn observe(&self) -> RmaResult<u64> {
        Ok(self.state.accumulate_lock.load(Ordering::Acquire))
    }

    fn unlock(&self) -> RmaResult<()> {
        self.state.accumulate_lock.store(LOCK_UNLOCKED, Ordering::Release);
        Ok(())
    }
}

/// Lock word of another rank, reached through remote atomics
pub struct RemoteLock<'a, F: Fabric> {
    target: usize,
    entry: &'a RankEntry,
    /// Address of the lock word on `target`
    word_addr: u64,
    fabric: &'a F,
    coherence: CoherenceController<'a, F>,
    mode: AcquireMode,
}

impl<'a, F: Fabric> DistributedLock for RemoteLock<'a, F> {
    fn try_lock(&self) -> RmaResult<bool> {
        let e = self.entry;
        let prev = match self.mode {
            AcquireMode::Swap => {
                self.fabric
                    .fetch_atomic_write(e.endpoint, self.word_addr, e.key, LOCK_LOCKED)
            }
            AcquireMode::CompareAndSwap => self.fabric.compare_atomic(
                e.endpoint,
                self.word_addr,
                e.key,
                LOCK_UNLOCKED,
                LOCK_LOCKED,
            ),
        }
        .map_err(RmaError::RemoteAtomic)?;
        Ok(prev == LOCK_UNLOCKED)
    }

    fn observe(&self) -> RmaResult<u64> {
        let mut word = [0u8; 8];
        self.coherence
            .invalidate(self.target, self.word_addr, word.len(), Strength::Fenced)?;
        self.fabric
            .load(self.word_addr, &mut word)
            .map_err(RmaError::RemoteAtomic)?;
        Ok(u64::from_ne_bytes(word))
    }

    fn unlock(&self) -> RmaResult<()> {
        let e = self.entry;
        self.fabric
            .inject_atomic_write(e.endpoint, self.word_addr, e.key, LOCK_UNLOCKED)
            .map_err(RmaError::RemoteAtomic)
    }
}

/// Locality-selected lock strategy
pub enum LockStrategy<'a, F: Fabric> {
    Local(LocalLock<'a>),
    Remote(RemoteLock<'a, F>),
}

impl<'a, F: Fabric> DistributedLock for LockStrategy<'a, F> {
    fn try_lock(&self) -> RmaResult<bool> {
        match self {
            LockStrategy::Local(l) => l.try_lock(),
            LockStrategy::Remote(r) => r.try_lock(),
        }
    }

    fn observe(&self) -> RmaResult<u64> {
        match self {
            LockStrategy::Local(l) => l.observe(),
            LockStrategy::Remote(r) => r.observe(),
        }
    }

    fn unlock(&self) -> RmaResult<()> {
        match self {
            LockStrategy::Local(l) => l.unlock(),
            LockStrategy::Remote(r) => r.unlock(),
        }
    }
}

/// Accumulate lock front-end used by the engine
pub struct AtomicLock<'a, F: Fabric> {
    window: &'a Window,
    fabric: &'a F,
    mode: AcquireMode,
    /// Log a warning every this many spins (0 disables)
    spin_warn_interval: u64,
}

impl<'a, F: Fabric> AtomicLock<'a, F> {
    pub fn new(window: &'a Window, fabric: &'a F, mode: AcquireMode, spin_warn_interval: u64) -> Self {
        Self {
            window,
            fabric,
            mode,
            spin_warn_interval,
        }
    }

    /// Strategy for `target`: local atomics for the own rank, fabric otherwise
    pub fn strategy(&self, target: usize) -> LockStrategy<'a, F> {
        if self.window.is_local(target) {
            LockStrategy::Local(LocalLock {
                state: self.window.local_state(),
                mode: self.mode,
            })
        } else {
            LockStrategy::Remote(RemoteLock {
                target,
                entry: self.window.entry(target),
                word_addr: AddressTranslator::lock_addr(self.window, target),
                fabric: self.fabric,
                coherence: CoherenceController::new(self.window, self.fabric),
                mode: self.mode,
            })
        }
    }

    pub fn try_lock(&self, target: usize) -> RmaResult<bool> {
        self.strategy(target).try_lock()
    }

    /// Acquire the lock of `target`, spinning until it is free.
    ///
    /// There is no bound on the wait: a holder that never releases stalls
    /// the caller forever. Returns the number of spin iterations.
    pub fn lock(&self, target: usize, progress: &dyn Progress) -> RmaResult<u64> {
        let lock = self.strategy(target);
        let mut spins = 0u64;
        while !lock.try_lock()? {
            while lock.observe()? != LOCK_UNLOCKED {
                progress.advance();
                spins += 1;
                if self.spin_warn_interval > 0 && spins % self.spin_warn_interval == 0 {
                    warn!(
                        "rank {} still waiting for accumulate lock of rank {} after {} spins",
                        self.window.rank(),
                        target,
                        spins
                    );
                }
            }
        }
        if spins > 0 {
            debug!(
                "rank {} acquired accumulate lock of rank {} after {} spins",
                self.window.rank(),
                target,
                spins
            );
        }
        Ok(spins)
    }

    pub fn unlock(&self, target: usize) -> RmaResult<()> {
        self.strategy(target).unlock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::fabric::{CachePolicy, SimNetwork};
    use crate::sync::YieldProgress;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn network(policy: CachePolicy) -> Arc<SimNetwork> {
        SimNetwork::new(&SimConfig {
            ranks: 2,
            window_bytes: 64,
            disp_unit: 1,
            cache_policy: policy,
        })
    }

    #[test]
    fn test_local_try_lock_and_unlock() {
        for mode in [AcquireMode::Swap, AcquireMode::CompareAndSwap] {
            let net = network(CachePolicy::WriteThrough);
            let win = net.window(0);
            let fabric = net.endpoint(0);
            let lock = AtomicLock::new(&win, &fabric, mode, 0);

            assert!(lock.try_lock(0).unwrap());
            assert_eq!(net.lock_word(0), LOCK_LOCKED);
            assert!(!lock.try_lock(0).unwrap());
            lock.unlock(0).unwrap();
            assert_eq!(net.lock_word(0), LOCK_UNLOCKED);
            assert_eq!(fabric.stats().atomics, 0);
        }
    }

    #[test]
    fn test_remote_try_lock_and_unlock() {
        for mode in [AcquireMode::Swap, AcquireMode::CompareAndSwap] {
            let net = network(CachePolicy::WriteBack);
            let win = net.window(0);
            let fabric = net.endpoint(0);
            let lock = AtomicLock::new(&win, &fabric, mode, 0);

            assert!(lock.try_lock(1).unwrap());
            assert_eq!(net.lock_word(1), LOCK_LOCKED);
            assert!(!lock.try_lock(1).unwrap());
            lock.unlock(1).unwrap();
            assert_eq!(net.lock_word(1), LOCK_UNLOCKED);
            assert!(fabric.stats().atomics >= 3);
        }
    }

    #[test]
    fn test_remote_lock_uses_published_word() {
        let net = network(CachePolicy::WriteThrough);
        let win = net.window(0);
        let fabric = net.endpoint(0);
        let lock = AtomicLock::new(&win, &fabric, AcquireMode::CompareAndSwap, 0);

        assert!(lock.try_lock(1).unwrap());
        let mut word = [0u8; 8];
        fabric
            .load(AddressTranslator::lock_addr(&win, 1), &mut word)
            .unwrap();
        assert_eq!(u64::from_ne_bytes(word), LOCK_LOCKED);
        assert_eq!(lock.strategy(1).observe().unwrap(), LOCK_LOCKED);
        lock.unlock(1).unwrap();
        assert_eq!(lock.strategy(1).observe().unwrap(), LOCK_UNLOCKED);
    }

    #[test]
    fn test_owner_and_remote_exclude_each_other() {
        let net = network(CachePolicy::WriteBack);
        let owner_win = net.window(1);
        let owner = net.endpoint(1);
        let remote_win = net.window(0);
        let remote = net.endpoint(0);

        let owner_lock = AtomicLock::new(&owner_win, &owner, AcquireMode::Swap, 0);
        let remote_lock = AtomicLock::new(&remote_win, &remote, AcquireMode::Swap, 0);

        assert!(owner_lock.try_lock(1).unwrap());
        assert!(!remote_lock.try_lock(1).unwrap());
        owner_lock.unlock(1).unwrap();
        assert!(remote_lock.try_lock(1).unwrap());
        assert!(!owner_lock.try_lock(1).unwrap());
        remote_lock.unlock(1).unwrap();
    }

    #[test]
    fn test_lock_spins_until_released() {
        let net = network(CachePolicy::WriteBack);
        let holder_win = net.window(1);
        let holder = net.endpoint(1);
        let holder_lock = AtomicLock::new(&holder_win, &holder, AcquireMode::Swap, 0);
        assert!(holder_lock.try_lock(1).unwrap());

        let released = Arc::new(AtomicBool::new(false));
        let waiter = {
            let net = Arc::clone(&net);
            let released = Arc::clone(&released);
            std::thread::spawn(move || {
                let win = net.window(0);
                let fabric = net.endpoint(0);
                let lock = AtomicLock::new(&win, &fabric, AcquireMode::CompareAndSwap, 0);
                lock.lock(1, &YieldProgress).unwrap();
                let saw_release = released.load(Ordering::SeqCst);
                lock.unlock(1).unwrap();
                saw_release
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        released.store(true, Ordering::SeqCst);
        holder_lock.unlock(1).unwrap();

        assert!(waiter.join().unwrap());
        assert_eq!(net.lock_word(1), LOCK_UNLOCKED);
    }

    #[test]
    fn test_progress_called_while_spinning() {
        let net = network(CachePolicy::WriteThrough);
        let win = net.window(0);
        let fabric = net.endpoint(0);
        let lock = AtomicLock::new(&win, &fabric, AcquireMode::Swap, 0);
        assert!(lock.try_lock(0).unwrap());

        // The progress hook is what eventually frees the lock
        let calls = std::cell::Cell::new(0u32);
        let progress = || {
            calls.set(calls.get() + 1);
            if calls.get() == 3 {
                win.local_state().accumulate_lock.store(LOCK_UNLOCKED, Ordering::Release);
            }
        };
        let spins = lock.lock(0, &progress).unwrap();
        assert_eq!(spins, 3);
        assert_eq!(calls.get(), 3);
        lock.unlock(0).unwrap();
    }
}
