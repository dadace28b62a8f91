//! Typed buffers and the external data-movement collaborators
//!
//! - `Transfer`: layout-checked byte moves (`PackedTransfer` by default)
//! - `Reducer`: elementwise reductions over `ReduceOp` (`BuiltinReducer`)

mod datatype;
mod reduce;

pub use datatype::{
    decode, encode, ensure_len, Buf, BufMut, Datatype, Element, Layout, PackedTransfer, Transfer,
};
pub use reduce::{BuiltinReducer, ReduceOp, Reducer};
