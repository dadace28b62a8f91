//! RMA core: one-sided remote memory access over a mapped fabric
//!
//! Every rank exposes a window of memory. Origins write, read and
//! atomically combine into remote windows without the target's
//! participation; read-modify-write verbs are serialized per target rank
//! by a lock word living in that rank's node state.

pub mod config;
pub mod engine;
pub mod error;
pub mod fabric;
pub mod ops;
pub mod sync;
pub mod window;

pub use config::{EngineConfig, RmaConfig, SimConfig};
pub use engine::{EngineStats, RmaEngine, RmaRequest, Target};
pub use error::{RmaError, RmaResult, TransferError};
pub use fabric::{CachePolicy, Fabric, FabricError, SimFabric, SimNetwork};
pub use ops::{Buf, BufMut, Datatype, Layout, ReduceOp};
pub use sync::{AcquireMode, Progress};
pub use window::{AddressTranslator, Window};
