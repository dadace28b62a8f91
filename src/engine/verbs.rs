//! RmaEngine: the one-sided verbs
//!
//! put/get move data without any locking. The accumulating verbs
//! (accumulate, get_accumulate, compare_and_swap, fetch_and_op) always run
//! in the same order:
//!
//! lock → invalidate → fetch → conditional mutation → commit → unlock
//!
//! The lock is released even when a step fails; whatever happened before
//! the failure stands.

use super::request::RmaRequest;
use super::stats::{Counters, EngineStats};
use crate::config::EngineConfig;
use crate::error::{RmaError, RmaResult, TransferError};
use crate::fabric::{Fabric, FabricError, SimFabric, SimNetwork};
use crate::ops::{
    ensure_len, Buf, BufMut, BuiltinReducer, Datatype, Layout, PackedTransfer, ReduceOp, Reducer,
    Transfer,
};
use crate::sync::{AtomicLock, CoherenceController, Progress, Strength, YieldProgress};
use crate::window::{AddressTranslator, Window};
use log::{error, info, trace};
use std::sync::Arc;

/// Where a verb lands: rank, displacement and layout of the target buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub rank: usize,
    pub disp: i64,
    pub layout: Layout,
}

impl Target {
    pub fn new(rank: usize, disp: i64, layout: Layout) -> Self {
        Self { rank, disp, layout }
    }
}

/// One rank's RMA engine over a window
pub struct RmaEngine<F: Fabric> {
    window: Window,
    fabric: F,
    config: EngineConfig,
    transfer: Box<dyn Transfer>,
    reducer: Box<dyn Reducer>,
    progress: Box<dyn Progress + Send + Sync>,
    counters: Counters,
}

impl RmaEngine<SimFabric> {
    /// Engine for `rank` attached to a simulated network
    pub fn attach(network: &Arc<SimNetwork>, rank: usize, config: EngineConfig) -> Self {
        Self::new(network.window(rank), network.endpoint(rank), config)
    }
}

impl<F: Fabric> RmaEngine<F> {
    pub fn new(window: Window, fabric: F, config: EngineConfig) -> Self {
        info!(
            "Creating RMA engine for rank {} of {} (window {}, acquire={:?})",
            window.rank(),
            window.size(),
            window.id,
            config.acquire_mode
        );
        Self {
            window,
            fabric,
            config,
            transfer: Box::new(PackedTransfer),
            reducer: Box::new(BuiltinReducer),
            progress: Box::new(YieldProgress),
            counters: Counters::default(),
        }
    }

    /// Replace the typed transfer primitive
    pub fn with_transfer(mut self, transfer: impl Transfer + 'static) -> Self {
        self.transfer = Box::new(transfer);
        self
    }

    /// Replace the reduction engine
    pub fn with_reducer(mut self, reducer: impl Reducer + 'static) -> Self {
        self.reducer = Box::new(reducer);
        self
    }

    /// Replace the progress hook the lock spin yields to
    pub fn with_progress(mut self, progress: impl Progress + Send + Sync + 'static) -> Self {
        self.progress = Box::new(progress);
        self
    }

    pub fn rank(&self) -> usize {
        self.window.rank()
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn fabric(&self) -> &F {
        &self.fabric
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> EngineStats {
        self.counters.snapshot()
    }

    fn lock(&self) -> AtomicLock<'_, F> {
        AtomicLock::new(
            &self.window,
            &self.fabric,
            self.config.acquire_mode,
            self.config.spin_warn_interval,
        )
    }

    fn coherence(&self) -> CoherenceController<'_, F> {
        CoherenceController::new(&self.window, &self.fabric)
    }

    /// Address of `disp` on `rank`; `layout` must fit in that rank's region
    fn address(&self, rank: usize, disp: i64, layout: Layout) -> RmaResult<u64> {
        if rank >= self.window.size() {
            return Err(RmaError::InvalidRank {
                rank,
                size: self.window.size(),
            });
        }
        let len = layout.checked_bytes()?;
        let addr = AddressTranslator::resolve(&self.window, rank, disp);
        if len > self.window.entry(rank).size {
            return Err(TransferError::from(FabricError::Unmapped { addr, len }).into());
        }
        Ok(addr)
    }

    /// Run `body` while holding the accumulate lock of `target`
    fn locked<T>(&self, target: usize, body: impl FnOnce() -> RmaResult<T>) -> RmaResult<T> {
        let lock = self.lock();
        let spins = lock.lock(target, self.progress.as_ref())?;
        Counters::bump(&self.counters.lock_acquisitions);
        Counters::add(&self.counters.lock_spins, spins);

        let result = body();
        let released = lock.unlock(target);
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(unlock_err)) => {
                error!(
                    "rank {} failed to release lock of rank {}: {}",
                    self.rank(),
                    target,
                    unlock_err
                );
                Err(e)
            }
        }
    }

    fn track<T>(&self, result: RmaResult<T>) -> RmaResult<T> {
        if result.is_err() {
            Counters::bump(&self.counters.failures);
        }
        result
    }

    fn load(&self, addr: u64, len: usize) -> Result<Vec<u8>, TransferError> {
        let mut staged = vec![0u8; len];
        self.fabric.load(addr, &mut staged)?;
        Ok(staged)
    }

    /// Typed move origin → target memory
    fn write_target(&self, origin: Buf<'_>, addr: u64, target: Layout) -> RmaResult<()> {
        let mut staged = vec![0u8; target.bytes()];
        let n = self.transfer.copy(origin.data, origin.layout, &mut staged, target)?;
        self.fabric
            .store(addr, &staged[..n])
            .map_err(TransferError::from)?;
        Ok(())
    }

    /// Typed move target memory → `dst`
    fn read_target(&self, addr: u64, target: Layout, dst: &mut [u8], dst_layout: Layout) -> RmaResult<()> {
        let staged = self.load(addr, target.bytes())?;
        self.transfer.copy(&staged, target, dst, dst_layout)?;
        Ok(())
    }

    /// target = target op origin, element by element
    fn reduce_target(&self, op: ReduceOp, origin: Buf<'_>, addr: u64, target: Layout) -> RmaResult<()> {
        ensure_len(origin.data.len(), origin.layout)?;
        if origin.layout.dtype != target.dtype {
            return Err(TransferError::TypeMismatch {
                src: origin.layout.dtype,
                dst: target.dtype,
            }
            .into());
        }
        if origin.layout.bytes() > target.bytes() {
            return Err(TransferError::Truncated {
                src_bytes: origin.layout.bytes(),
                dst_bytes: target.bytes(),
            }
            .into());
        }
        if !op.mutates() {
            return Ok(());
        }
        let mut staged = self.load(addr, origin.layout.bytes())?;
        self.reducer
            .reduce(op, origin.data, &mut staged, origin.layout.count, origin.layout.dtype)?;
        self.fabric.store(addr, &staged).map_err(TransferError::from)?;
        Ok(())
    }

    /// Replace-or-reduce step shared by the accumulating verbs
    fn apply(&self, op: ReduceOp, origin: Buf<'_>, addr: u64, target: Layout) -> RmaResult<()> {
        match op {
            ReduceOp::Replace => self.write_target(origin, addr, target),
            _ => self.reduce_target(op, origin, addr, target),
        }
    }

    /// Write `origin` into the target buffer. No lock is taken.
    pub fn put(&self, origin: Buf<'_>, target: &Target) -> RmaResult<()> {
        trace!(
            "put: {} -> rank {} disp {} as {}",
            origin.layout,
            target.rank,
            target.disp,
            target.layout
        );
        Counters::bump(&self.counters.puts);
        let addr = self.track(self.address(target.rank, target.disp, target.layout))?;
        self.track(self.write_target(origin, addr, target.layout))
    }

    /// Read the target buffer into `origin`. No lock is taken.
    pub fn get(&self, origin: BufMut<'_>, target: &Target) -> RmaResult<()> {
        trace!(
            "get: {} <- rank {} disp {} as {}",
            origin.layout,
            target.rank,
            target.disp,
            target.layout
        );
        Counters::bump(&self.counters.gets);
        let addr = self.track(self.address(target.rank, target.disp, target.layout))?;
        self.track(self.read_target(addr, target.layout, origin.data, origin.layout))
    }

    /// Combine `origin` into the target buffer with `op`
    pub fn accumulate(&self, origin: Buf<'_>, target: &Target, op: ReduceOp) -> RmaResult<()> {
        trace!(
            "accumulate: {} -> rank {} disp {} as {}, op {}",
            origin.layout,
            target.rank,
            target.disp,
            target.layout,
            op
        );
        Counters::bump(&self.counters.accumulates);
        let rank = target.rank;
        let addr = self.track(self.address(rank, target.disp, target.layout))?;
        let cc = self.coherence();

        let result = self.locked(rank, || {
            let applied = match op {
                // Overwriting discards the prior value; nothing to refresh
                ReduceOp::Replace => self.write_target(origin, addr, target.layout),
                _ => {
                    cc.invalidate(rank, addr, origin.layout.bytes(), Strength::Fenced)?;
                    self.reduce_target(op, origin, addr, target.layout)
                }
            };
            let committed = if op.mutates() {
                cc.commit(rank, addr, target.layout.bytes(), Strength::Fenced)
            } else {
                Ok(())
            };
            applied.and(committed)
        });
        self.track(result)
    }

    /// Fetch the target buffer into `result`, then combine `origin` into it
    pub fn get_accumulate(
        &self,
        origin: Buf<'_>,
        result: BufMut<'_>,
        target: &Target,
        op: ReduceOp,
    ) -> RmaResult<()> {
        trace!(
            "get_accumulate: {} -> rank {} disp {} as {}, result {}, op {}",
            origin.layout,
            target.rank,
            target.disp,
            target.layout,
            result.layout,
            op
        );
        Counters::bump(&self.counters.get_accumulates);
        let rank = target.rank;
        let addr = self.track(self.address(rank, target.disp, target.layout))?;
        let cc = self.coherence();
        let BufMut {
            data: result_data,
            layout: result_layout,
        } = result;

        let outcome = self.locked(rank, || {
            cc.invalidate(rank, addr, target.layout.bytes(), Strength::Fenced)?;
            self.read_target(addr, target.layout, result_data, result_layout)?;
            if !op.mutates() {
                return Ok(());
            }
            let applied = self.apply(op, origin, addr, target.layout);
            let committed = cc.commit(rank, addr, target.layout.bytes(), Strength::Fenced);
            applied.and(committed)
        });
        self.track(outcome)
    }

    /// Atomically: `result = target; if target == compare { target = origin }`.
    ///
    /// All three buffers hold one element of `dtype`.
    pub fn compare_and_swap(
        &self,
        origin: &[u8],
        compare: &[u8],
        result: &mut [u8],
        dtype: Datatype,
        target_rank: usize,
        target_disp: i64,
    ) -> RmaResult<()> {
        trace!(
            "compare_and_swap: {} -> rank {} disp {}",
            dtype,
            target_rank,
            target_disp
        );
        Counters::bump(&self.counters.compare_and_swaps);
        let one = Layout::new(1, dtype);
        let size = one.bytes();
        let checked: Result<(), TransferError> = ensure_len(origin.len(), one)
            .and_then(|_| ensure_len(compare.len(), one))
            .and_then(|_| ensure_len(result.len(), one));
        self.track(checked.map_err(Into::into))?;

        let addr = self.track(self.address(target_rank, target_disp, one))?;
        let cc = self.coherence();
        let outcome = self.locked(target_rank, || {
            cc.invalidate(target_rank, addr, size, Strength::Fenced)?;
            self.fabric
                .load(addr, &mut result[..size])
                .map_err(TransferError::from)?;
            if result[..size] == compare[..size] {
                self.fabric
                    .store(addr, &origin[..size])
                    .map_err(TransferError::from)?;
                cc.commit(target_rank, addr, size, Strength::Fenced)?;
                Counters::bump(&self.counters.swaps);
            }
            Ok(())
        });
        self.track(outcome)
    }

    /// Atomically: `result = target; target = target op origin`.
    ///
    /// Both buffers hold one element of `dtype`.
    pub fn fetch_and_op(
        &self,
        origin: &[u8],
        result: &mut [u8],
        dtype: Datatype,
        target_rank: usize,
        target_disp: i64,
        op: ReduceOp,
    ) -> RmaResult<()> {
        trace!(
            "fetch_and_op: {} -> rank {} disp {}, op {}",
            dtype,
            target_rank,
            target_disp,
            op
        );
        Counters::bump(&self.counters.fetch_and_ops);
        let one = Layout::new(1, dtype);
        let size = one.bytes();
        let checked: Result<(), TransferError> =
            ensure_len(origin.len(), one).and_then(|_| ensure_len(result.len(), one));
        self.track(checked.map_err(Into::into))?;

        let addr = self.track(self.address(target_rank, target_disp, one))?;
        let cc = self.coherence();
        let outcome = self.locked(target_rank, || {
            cc.invalidate(target_rank, addr, size, Strength::Fenced)?;
            self.fabric
                .load(addr, &mut result[..size])
                .map_err(TransferError::from)?;
            if !op.mutates() {
                return Ok(());
            }
            let stored = match op {
                ReduceOp::Replace => self.fabric.store(addr, &origin[..size]),
                _ => {
                    let mut updated = result[..size].to_vec();
                    self.reducer.reduce(op, &origin[..size], &mut updated, 1, dtype)?;
                    self.fabric.store(addr, &updated)
                }
            };
            stored.map_err(TransferError::from)?;
            cc.commit(target_rank, addr, size, Strength::Fenced)
        });
        self.track(outcome)
    }

    /// `put` returning an already-complete request
    pub fn rput(&self, origin: Buf<'_>, target: &Target) -> RmaRequest {
        RmaRequest::from_result(self.put(origin, target))
    }

    /// `get` returning an already-complete request
    pub fn rget(&self, origin: BufMut<'_>, target: &Target) -> RmaRequest {
        RmaRequest::from_result(self.get(origin, target))
    }

    /// `accumulate` returning an already-complete request
    pub fn raccumulate(&self, origin: Buf<'_>, target: &Target, op: ReduceOp) -> RmaRequest {
        RmaRequest::from_result(self.accumulate(origin, target, op))
    }

    /// `get_accumulate` returning an already-complete request
    pub fn rget_accumulate(
        &self,
        origin: Buf<'_>,
        result: BufMut<'_>,
        target: &Target,
        op: ReduceOp,
    ) -> RmaRequest {
        RmaRequest::from_result(self.get_accumulate(origin, result, target, op))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::fabric::CachePolicy;
    use crate::ops::{decode, encode};
    use crate::sync::{LOCK_LOCKED, LOCK_UNLOCKED};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn network(policy: CachePolicy) -> Arc<SimNetwork> {
        SimNetwork::new(&SimConfig {
            ranks: 3,
            window_bytes: 256,
            disp_unit: 8,
            cache_policy: policy,
        })
    }

    fn i64s(net: &SimNetwork, rank: usize, disp: usize, count: usize) -> Vec<i64> {
        decode(&net.read_memory(rank, disp * 8, count * 8))
    }

    #[test]
    fn test_put_then_get() {
        let net = network(CachePolicy::WriteBack);
        let engine = RmaEngine::attach(&net, 0, EngineConfig::default());
        let data = encode(&[1i64, 2, 3]);
        let target = Target::new(2, 1, Layout::new(3, Datatype::I64));

        engine.put(Buf::of(&data, Datatype::I64), &target).unwrap();
        let mut back = vec![0u8; 24];
        engine.get(BufMut::of(&mut back, Datatype::I64), &target).unwrap();
        assert_eq!(decode::<i64>(&back), vec![1, 2, 3]);

        let stats = engine.stats();
        assert_eq!(stats.puts, 1);
        assert_eq!(stats.gets, 1);
        assert_eq!(stats.lock_acquisitions, 0);
    }

    #[test]
    fn test_put_size_mismatch_fails() {
        let net = network(CachePolicy::WriteThrough);
        let engine = RmaEngine::attach(&net, 0, EngineConfig::default());
        let data = encode(&[1i64, 2, 3]);
        let target = Target::new(1, 0, Layout::new(2, Datatype::I64));

        let err = engine.put(Buf::of(&data, Datatype::I64), &target).unwrap_err();
        assert!(err.is_transfer());
        assert_eq!(engine.stats().failures, 1);
    }

    #[test]
    fn test_accumulate_sum_is_committed() {
        let net = network(CachePolicy::WriteBack);
        let engine = RmaEngine::attach(&net, 0, EngineConfig::default());
        let target = Target::new(1, 0, Layout::new(2, Datatype::I64));
        let delta = encode(&[5i64, -2]);

        engine.accumulate(Buf::of(&delta, Datatype::I64), &target, ReduceOp::Sum).unwrap();
        engine.accumulate(Buf::of(&delta, Datatype::I64), &target, ReduceOp::Sum).unwrap();

        // Commit pushed the result all the way to rank 1's memory
        assert_eq!(i64s(&net, 1, 0, 2), vec![10, -4]);
        assert_eq!(net.lock_word(1), LOCK_UNLOCKED);
        assert_eq!(engine.stats().lock_acquisitions, 2);
    }

    #[test]
    fn test_accumulate_replace_and_noop() {
        let net = network(CachePolicy::WriteBack);
        let engine = RmaEngine::attach(&net, 0, EngineConfig::default());
        let target = Target::new(2, 3, Layout::new(1, Datatype::U32));

        let value = encode(&[77u32]);
        engine.accumulate(Buf::of(&value, Datatype::U32), &target, ReduceOp::Replace).unwrap();
        assert_eq!(decode::<u32>(&net.read_memory(2, 24, 4)), vec![77]);

        let other = encode(&[1u32]);
        engine.accumulate(Buf::of(&other, Datatype::U32), &target, ReduceOp::NoOp).unwrap();
        assert_eq!(decode::<u32>(&net.read_memory(2, 24, 4)), vec![77]);
    }

    #[test]
    fn test_accumulate_type_mismatch_releases_lock() {
        let net = network(CachePolicy::WriteBack);
        let engine = RmaEngine::attach(&net, 0, EngineConfig::default());
        let target = Target::new(1, 0, Layout::new(1, Datatype::I64));
        let delta = encode(&[1.0f64]);

        let err = engine
            .accumulate(Buf::of(&delta, Datatype::F64), &target, ReduceOp::Sum)
            .unwrap_err();
        assert!(matches!(err, RmaError::Transfer(TransferError::TypeMismatch { .. })));
        assert_eq!(net.lock_word(1), LOCK_UNLOCKED);
    }

    #[test]
    fn test_unsupported_reduction_releases_lock() {
        let net = network(CachePolicy::WriteBack);
        let engine = RmaEngine::attach(&net, 0, EngineConfig::default());
        let target = Target::new(1, 0, Layout::new(1, Datatype::F64));
        let delta = encode(&[1.0f64]);

        let err = engine
            .accumulate(Buf::of(&delta, Datatype::F64), &target, ReduceOp::BXor)
            .unwrap_err();
        assert!(matches!(err, RmaError::UnsupportedReduction { .. }));
        assert_eq!(net.lock_word(1), LOCK_UNLOCKED);
        assert_eq!(engine.stats().failures, 1);
    }

    #[test]
    fn test_get_accumulate_fetches_prior_value() {
        let net = network(CachePolicy::WriteBack);
        let engine = RmaEngine::attach(&net, 0, EngineConfig::default());
        let target = Target::new(1, 2, Layout::new(2, Datatype::I32));

        let init = encode(&[10i32, 20]);
        engine.put(Buf::of(&init, Datatype::I32), &target).unwrap();

        let delta = encode(&[1i32, 2]);
        let mut prior = vec![0u8; 8];
        engine
            .get_accumulate(
                Buf::of(&delta, Datatype::I32),
                BufMut::of(&mut prior, Datatype::I32),
                &target,
                ReduceOp::Sum,
            )
            .unwrap();
        assert_eq!(decode::<i32>(&prior), vec![10, 20]);
        assert_eq!(decode::<i32>(&net.read_memory(1, 16, 8)), vec![11, 22]);
    }

    #[test]
    fn test_get_accumulate_noop_only_reads() {
        let net = network(CachePolicy::WriteThrough);
        let engine = RmaEngine::attach(&net, 0, EngineConfig::default());
        let target = Target::new(1, 0, Layout::new(1, Datatype::U64));
        let init = encode(&[9u64]);
        engine.put(Buf::of(&init, Datatype::U64), &target).unwrap();

        let ignored = encode(&[100u64]);
        let mut prior = vec![0u8; 8];
        let req = engine.rget_accumulate(
            Buf::of(&ignored, Datatype::U64),
            BufMut::of(&mut prior, Datatype::U64),
            &target,
            ReduceOp::NoOp,
        );
        assert!(req.test() && req.is_success());
        assert_eq!(decode::<u64>(&prior), vec![9]);
        assert_eq!(decode::<u64>(&net.read_memory(1, 0, 8)), vec![9]);
        assert_eq!(engine.fabric().stats().commits, 0);
    }

    #[test]
    fn test_compare_and_swap() {
        let net = network(CachePolicy::WriteBack);
        let engine = RmaEngine::attach(&net, 0, EngineConfig::default());

        let mut result = [0u8; 8];
        engine
            .compare_and_swap(&7u64.to_ne_bytes(), &0u64.to_ne_bytes(), &mut result, Datatype::U64, 2, 0)
            .unwrap();
        assert_eq!(u64::from_ne_bytes(result), 0);
        assert_eq!(decode::<u64>(&net.read_memory(2, 0, 8)), vec![7]);

        // Stale compare value: no swap, result still reports the current value
        engine
            .compare_and_swap(&9u64.to_ne_bytes(), &0u64.to_ne_bytes(), &mut result, Datatype::U64, 2, 0)
            .unwrap();
        assert_eq!(u64::from_ne_bytes(result), 7);
        assert_eq!(decode::<u64>(&net.read_memory(2, 0, 8)), vec![7]);

        let stats = engine.stats();
        assert_eq!(stats.compare_and_swaps, 2);
        assert_eq!(stats.successful_swaps, 1);
    }

    #[test]
    fn test_compare_and_swap_short_buffer() {
        let net = network(CachePolicy::WriteBack);
        let engine = RmaEngine::attach(&net, 0, EngineConfig::default());
        let mut result = [0u8; 4];
        let err = engine
            .compare_and_swap(&[0u8; 8], &[0u8; 8], &mut result, Datatype::U64, 1, 0)
            .unwrap_err();
        assert!(matches!(err, RmaError::Transfer(TransferError::BufferTooSmall { .. })));
        assert_eq!(engine.stats().lock_acquisitions, 0);
    }

    #[test]
    fn test_fetch_and_op_on_own_rank() {
        let net = network(CachePolicy::WriteBack);
        let engine = RmaEngine::attach(&net, 1, EngineConfig::default());

        let mut result = [0u8; 4];
        engine
            .fetch_and_op(&5i32.to_ne_bytes(), &mut result, Datatype::I32, 1, 4, ReduceOp::Sum)
            .unwrap();
        assert_eq!(i32::from_ne_bytes(result), 0);
        engine
            .fetch_and_op(&3i32.to_ne_bytes(), &mut result, Datatype::I32, 1, 4, ReduceOp::Max)
            .unwrap();
        assert_eq!(i32::from_ne_bytes(result), 5);
        engine
            .fetch_and_op(&(-1i32).to_ne_bytes(), &mut result, Datatype::I32, 1, 4, ReduceOp::Replace)
            .unwrap();
        assert_eq!(i32::from_ne_bytes(result), 5);
        engine
            .fetch_and_op(&0i32.to_ne_bytes(), &mut result, Datatype::I32, 1, 4, ReduceOp::NoOp)
            .unwrap();
        assert_eq!(i32::from_ne_bytes(result), -1);

        // Own rank: local atomics only, no fabric traffic for the lock
        assert_eq!(engine.fabric().stats().atomics, 0);
        assert_eq!(engine.fabric().stats().invalidations, 0);
    }

    #[test]
    fn test_request_variants() {
        let net = network(CachePolicy::WriteThrough);
        let engine = RmaEngine::attach(&net, 0, EngineConfig::default());
        let target = Target::new(1, 0, Layout::new(1, Datatype::U8));

        let one = [4u8];
        assert!(engine.rput(Buf::of(&one, Datatype::U8), &target).wait().is_ok());
        assert!(engine
            .raccumulate(Buf::of(&one, Datatype::U8), &target, ReduceOp::BOr)
            .wait()
            .is_ok());
        let mut back = [0u8; 1];
        assert!(engine.rget(BufMut::of(&mut back, Datatype::U8), &target).wait().is_ok());
        assert_eq!(back, [4]);

        let wide = Target::new(1, 0, Layout::new(4, Datatype::U8));
        let req = engine.rget(BufMut::of(&mut back, Datatype::U8), &wide);
        assert!(req.test());
        assert!(!req.is_success());
    }

    /// Always refuses to reduce
    struct RefusingReducer;

    impl Reducer for RefusingReducer {
        fn reduce(
            &self,
            op: ReduceOp,
            _src: &[u8],
            _dst: &mut [u8],
            _count: usize,
            dtype: Datatype,
        ) -> RmaResult<()> {
            Err(RmaError::UnsupportedReduction { op, dtype })
        }
    }

    /// `PackedTransfer` that counts its calls
    struct CountingTransfer(Arc<AtomicU64>);

    impl Transfer for CountingTransfer {
        fn copy(
            &self,
            src: &[u8],
            src_layout: Layout,
            dst: &mut [u8],
            dst_layout: Layout,
        ) -> Result<usize, TransferError> {
            self.0.fetch_add(1, Ordering::Relaxed);
            PackedTransfer.copy(src, src_layout, dst, dst_layout)
        }
    }

    #[test]
    fn test_wrapping_displacement_is_unmapped() {
        for policy in [CachePolicy::WriteThrough, CachePolicy::WriteBack] {
            let net = network(policy);
            let engine = RmaEngine::attach(&net, 0, EngineConfig::default());
            // Rank 1's base is 2 << 32; one element below address 0 wraps
            let target = Target::new(1, -((2i64 << 32) / 8) - 1, Layout::new(1, Datatype::U64));
            let data = encode(&[1u64]);

            let err = engine.put(Buf::of(&data, Datatype::U64), &target).unwrap_err();
            assert!(matches!(
                err,
                RmaError::Transfer(TransferError::Transport(FabricError::Unmapped { .. }))
            ));

            let mut back = [0u8; 8];
            let err = engine.get(BufMut::of(&mut back, Datatype::U64), &target).unwrap_err();
            assert!(matches!(
                err,
                RmaError::Transfer(TransferError::Transport(FabricError::Unmapped { .. }))
            ));

            assert!(engine
                .accumulate(Buf::of(&data, Datatype::U64), &target, ReduceOp::Sum)
                .is_err());
            assert_eq!(net.lock_word(1), LOCK_UNLOCKED);
            assert_eq!(engine.stats().failures, 3);
        }
    }

    #[test]
    fn test_bad_rank_and_oversized_layout_rejected() {
        let net = network(CachePolicy::WriteBack);
        let engine = RmaEngine::attach(&net, 0, EngineConfig::default());
        let data = encode(&[1u64]);

        let err = engine
            .put(Buf::of(&data, Datatype::U64), &Target::new(3, 0, Layout::new(1, Datatype::U64)))
            .unwrap_err();
        assert!(matches!(err, RmaError::InvalidRank { rank: 3, size: 3 }));

        let mut result = [0u8; 8];
        let err = engine
            .fetch_and_op(&data, &mut result, Datatype::U64, 9, 0, ReduceOp::Sum)
            .unwrap_err();
        assert!(matches!(err, RmaError::InvalidRank { .. }));

        let huge = Target::new(1, 0, Layout::new(usize::MAX / 2, Datatype::U64));
        let err = engine.put(Buf::of(&data, Datatype::U64), &huge).unwrap_err();
        assert!(matches!(err, RmaError::Transfer(TransferError::LayoutOverflow { .. })));

        // Larger than the 256-byte region
        let wide = Target::new(1, 0, Layout::new(33, Datatype::U64));
        let err = engine.put(Buf::of(&data, Datatype::U64), &wide).unwrap_err();
        assert!(matches!(
            err,
            RmaError::Transfer(TransferError::Transport(FabricError::Unmapped { .. }))
        ));
        assert_eq!(engine.stats().lock_acquisitions, 0);
    }

    #[test]
    fn test_failed_reduction_keeps_fetched_result() {
        let net = network(CachePolicy::WriteThrough);
        let engine =
            RmaEngine::attach(&net, 0, EngineConfig::default()).with_reducer(RefusingReducer);
        let target = Target::new(1, 0, Layout::new(1, Datatype::I64));
        let init = encode(&[42i64]);
        engine.put(Buf::of(&init, Datatype::I64), &target).unwrap();

        let delta = encode(&[1i64]);
        let mut prior = vec![0u8; 8];
        let err = engine
            .get_accumulate(
                Buf::of(&delta, Datatype::I64),
                BufMut::of(&mut prior, Datatype::I64),
                &target,
                ReduceOp::Sum,
            )
            .unwrap_err();
        assert!(matches!(err, RmaError::UnsupportedReduction { .. }));

        // The fetch happened before the failure and stands; the target is untouched
        assert_eq!(decode::<i64>(&prior), vec![42]);
        assert_eq!(i64s(&net, 1, 0, 1), vec![42]);
        assert_eq!(net.lock_word(1), LOCK_UNLOCKED);
        assert_eq!(engine.stats().failures, 1);
        assert_eq!(engine.stats().lock_acquisitions, 1);

        // Replace never reaches the reducer
        let seven = encode(&[7i64]);
        engine
            .accumulate(Buf::of(&seven, Datatype::I64), &target, ReduceOp::Replace)
            .unwrap();
        assert_eq!(i64s(&net, 1, 0, 1), vec![7]);
    }

    #[test]
    fn test_lock_wait_spins_on_injected_progress() {
        let net = network(CachePolicy::WriteBack);
        let holder = net.window(1);
        holder.local_state().accumulate_lock.store(LOCK_LOCKED, Ordering::Release);

        let calls = Arc::new(AtomicU64::new(0));
        let hook_calls = Arc::clone(&calls);
        let engine = RmaEngine::attach(&net, 0, EngineConfig::default()).with_progress(move || {
            // The holder lets go once the waiter has advanced five times
            if hook_calls.fetch_add(1, Ordering::SeqCst) + 1 == 5 {
                holder.local_state().accumulate_lock.store(LOCK_UNLOCKED, Ordering::Release);
            }
        });

        let mut result = [0u8; 8];
        engine
            .fetch_and_op(&3u64.to_ne_bytes(), &mut result, Datatype::U64, 1, 0, ReduceOp::Sum)
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(engine.stats().lock_spins, 5);
        assert_eq!(u64::from_ne_bytes(result), 0);
        assert_eq!(decode::<u64>(&net.read_memory(1, 0, 8)), vec![3]);
        assert_eq!(net.lock_word(1), LOCK_UNLOCKED);
    }

    #[test]
    fn test_injected_transfer_moves_the_data() {
        let net = network(CachePolicy::WriteThrough);
        let copies = Arc::new(AtomicU64::new(0));
        let engine = RmaEngine::attach(&net, 0, EngineConfig::default())
            .with_transfer(CountingTransfer(Arc::clone(&copies)));
        let target = Target::new(2, 0, Layout::new(2, Datatype::U32));

        let data = encode(&[5u32, 6]);
        engine.put(Buf::of(&data, Datatype::U32), &target).unwrap();
        let mut back = vec![0u8; 8];
        engine.get(BufMut::of(&mut back, Datatype::U32), &target).unwrap();

        assert_eq!(decode::<u32>(&back), vec![5, 6]);
        assert_eq!(copies.load(Ordering::Relaxed), 2);
    }
}
