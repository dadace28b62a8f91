//! Engine and simulation configuration
//!
//! Stored as pretty JSON. Missing files fall back to defaults on `load_or_default`.

use crate::error::{RmaError, RmaResult};
use crate::fabric::CachePolicy;
use crate::sync::AcquireMode;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Tunables of an `RmaEngine`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Primitive used to take the accumulate lock
    pub acquire_mode: AcquireMode,
    /// Warn every this many spins while waiting on a lock (0 = never)
    pub spin_warn_interval: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            acquire_mode: AcquireMode::Swap,
            spin_warn_interval: 10_000,
        }
    }
}

/// Shape of an in-process simulated cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Number of ranks
    pub ranks: usize,
    /// Bytes exposed by every rank (rounded up to a cache line)
    pub window_bytes: usize,
    /// Displacement unit published for every rank
    pub disp_unit: u64,
    /// How origins cache remote memory
    pub cache_policy: CachePolicy,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            ranks: 4,
            window_bytes: 4096,
            disp_unit: 8,
            cache_policy: CachePolicy::WriteBack,
        }
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RmaConfig {
    pub engine: EngineConfig,
    pub sim: SimConfig,
}

impl RmaConfig {
    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> RmaResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let config: RmaConfig = serde_json::from_str(&json)?;
        config.validate()?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load `path` if it exists, defaults otherwise
    pub fn load_or_default(path: impl AsRef<Path>) -> RmaResult<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> RmaResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> RmaResult<()> {
        if self.sim.ranks == 0 {
            return Err(RmaError::Config("sim.ranks must be at least 1".into()));
        }
        if self.sim.disp_unit == 0 {
            return Err(RmaError::Config("sim.disp_unit must be non-zero".into()));
        }
        if self.sim.window_bytes == 0 {
            return Err(RmaError::Config("sim.window_bytes must be non-zero".into()));
        }
        Ok(())
    }
}
