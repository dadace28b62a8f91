//! Cache maintenance around accesses to network-visible memory
//!
//! `invalidate` before reading remote bytes, `commit` after writing them.
//! Local targets need neither, but callers invoke both uniformly.

use crate::error::{RmaError, RmaResult};
use crate::fabric::Fabric;
use crate::window::Window;
use log::trace;

/// Whether cache maintenance must be ordered ahead of a dependent
/// network operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strength {
    Fenced,
    /// No ordering; for batches that end in one fenced call
    Relaxed,
}

/// Bridges the local cached view and network-visible memory
pub struct CoherenceController<'a, F: Fabric> {
    window: &'a Window,
    fabric: &'a F,
}

impl<'a, F: Fabric> Clone for CoherenceController<'a, F> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, F: Fabric> Copy for CoherenceController<'a, F> {}

impl<'a, F: Fabric> CoherenceController<'a, F> {
    pub fn new(window: &'a Window, fabric: &'a F) -> Self {
        Self { window, fabric }
    }

    /// Refresh the local view of `[addr, addr + len)` on `target` so
    /// subsequent reads observe every already-committed write
    pub fn invalidate(&self, target: usize, addr: u64, len: usize, strength: Strength) -> RmaResult<()> {
        if self.window.is_local(target) {
            return Ok(());
        }
        trace!("invalidate rank {} {:#x}+{} ({:?})", target, addr, len, strength);
        self.fabric
            .invalidate(addr, len, strength == Strength::Fenced)
            .map_err(RmaError::Coherence)
    }

    /// Publish local writes to `[addr, addr + len)` on `target`
    pub fn commit(&self, target: usize, addr: u64, len: usize, strength: Strength) -> RmaResult<()> {
        if self.window.is_local(target) {
            return Ok(());
        }
        trace!("commit rank {} {:#x}+{} ({:?})", target, addr, len, strength);
        self.fabric
            .commit(addr, len, strength == Strength::Fenced)
            .map_err(RmaError::Coherence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::fabric::{CachePolicy, SimNetwork};

    fn setup() -> (std::sync::Arc<SimNetwork>, Window) {
        let net = SimNetwork::new(&SimConfig {
            ranks: 2,
            window_bytes: 128,
            disp_unit: 1,
            cache_policy: CachePolicy::WriteBack,
        });
        let win = net.window(0);
        (net, win)
    }

    #[test]
    fn test_local_target_is_noop() {
        let (net, win) = setup();
        let fabric = net.endpoint(0);
        let cc = CoherenceController::new(&win, &fabric);
        let addr = win.entry(0).base;
        cc.invalidate(0, addr, 8, Strength::Fenced).unwrap();
        cc.commit(0, addr, 8, Strength::Fenced).unwrap();
        assert_eq!(fabric.stats().invalidations, 0);
        assert_eq!(fabric.stats().commits, 0);
    }

    #[test]
    fn test_remote_commit_publishes() {
        let (net, win) = setup();
        let fabric = net.endpoint(0);
        let cc = CoherenceController::new(&win, &fabric);
        let addr = win.entry(1).base + 16;

        fabric.store(addr, &[3, 4]).unwrap();
        assert_eq!(net.read_memory(1, 16, 2), vec![0, 0]);
        cc.commit(1, addr, 2, Strength::Relaxed).unwrap();
        assert_eq!(net.read_memory(1, 16, 2), vec![3, 4]);
        assert_eq!(fabric.stats().commits, 1);
    }

    #[test]
    fn test_unmapped_range_is_reported() {
        let (net, win) = setup();
        let fabric = net.endpoint(0);
        let cc = CoherenceController::new(&win, &fabric);
        let err = cc.invalidate(1, 0x10, 8, Strength::Fenced).unwrap_err();
        assert!(matches!(err, RmaError::Coherence(_)));
    }
}
