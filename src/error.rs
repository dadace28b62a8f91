//! Error types for the RMA engine

use crate::fabric::FabricError;
use crate::ops::{Datatype, ReduceOp};

/// Failure of a typed move between two buffers
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Buffer too small: layout needs {needed} bytes, buffer has {actual}")]
    BufferTooSmall { needed: usize, actual: usize },

    #[error("Datatype mismatch: cannot move {src} into {dst}")]
    TypeMismatch { src: Datatype, dst: Datatype },

    #[error("Message truncated: {src_bytes} source bytes into {dst_bytes} destination bytes")]
    Truncated { src_bytes: usize, dst_bytes: usize },

    #[error("Layout overflow: {count} elements of {dtype} exceed the address space")]
    LayoutOverflow { count: usize, dtype: Datatype },

    #[error("Transport failure: {0}")]
    Transport(#[from] FabricError),
}

/// Errors surfaced by the RMA verbs
#[derive(Debug, thiserror::Error)]
pub enum RmaError {
    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("Remote atomic failed: {0}")]
    RemoteAtomic(#[source] FabricError),

    #[error("Cache maintenance failed: {0}")]
    Coherence(#[source] FabricError),

    #[error("Reduction '{op}' is not defined for datatype {dtype}")]
    UnsupportedReduction { op: ReduceOp, dtype: Datatype },

    #[error("Target rank {rank} outside window of {size} ranks")]
    InvalidRank { rank: usize, size: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type RmaResult<T> = Result<T, RmaError>;

impl RmaError {
    /// Whether this error came from a descriptor mismatch or data movement
    pub fn is_transfer(&self) -> bool {
        matches!(self, RmaError::Transfer(_))
    }
}
