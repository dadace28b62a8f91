//! Reduction operators and the elementwise reduction engine
//!
//! `ReduceOp` is a closed set; the engine matches on it structurally.
//! `BuiltinReducer` applies `dst = dst op src` element by element.

use super::datatype::{ensure_len, Datatype, Element, Layout};
use crate::error::{RmaError, RmaResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Operators accepted by the accumulating verbs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceOp {
    /// Leave the target untouched
    NoOp,
    /// Overwrite the target with the origin
    Replace,
    Sum,
    Product,
    Min,
    Max,
    /// Bitwise and
    BAnd,
    /// Bitwise or
    BOr,
    /// Bitwise xor
    BXor,
    /// Logical and (non-zero is true, result is 0 or 1)
    LAnd,
    /// Logical or
    LOr,
    /// Logical xor
    LXor,
}

impl ReduceOp {
    pub const ALL: [ReduceOp; 12] = [
        ReduceOp::NoOp,
        ReduceOp::Replace,
        ReduceOp::Sum,
        ReduceOp::Product,
        ReduceOp::Min,
        ReduceOp::Max,
        ReduceOp::BAnd,
        ReduceOp::BOr,
        ReduceOp::BXor,
        ReduceOp::LAnd,
        ReduceOp::LOr,
        ReduceOp::LXor,
    ];

    pub fn name(&self) -> &str {
        match self {
            ReduceOp::NoOp => "no_op",
            ReduceOp::Replace => "replace",
            ReduceOp::Sum => "sum",
            ReduceOp::Product => "prod",
            ReduceOp::Min => "min",
            ReduceOp::Max => "max",
            ReduceOp::BAnd => "band",
            ReduceOp::BOr => "bor",
            ReduceOp::BXor => "bxor",
            ReduceOp::LAnd => "land",
            ReduceOp::LOr => "lor",
            ReduceOp::LXor => "lxor",
        }
    }

    /// Whether applying this op can change the target
    pub fn mutates(&self) -> bool {
        !matches!(self, ReduceOp::NoOp)
    }
}

impl fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Associative reduction applied in place on a target buffer
pub trait Reducer: Send + Sync {
    /// Combine `count` elements of `src` into `dst`: `dst[i] = dst[i] op src[i]`
    fn reduce(
        &self,
        op: ReduceOp,
        src: &[u8],
        dst: &mut [u8],
        count: usize,
        dtype: Datatype,
    ) -> RmaResult<()>;
}

/// Reducer over the fixed operator set and the basic datatypes
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinReducer;

fn apply<T: Element>(src: &[u8], dst: &mut [u8], count: usize, f: impl Fn(T, T) -> T) {
    let size = T::DTYPE.size();
    let n = count * size;
    for (d, s) in dst[..n].chunks_exact_mut(size).zip(src[..n].chunks_exact(size)) {
        f(T::get_ne(d), T::get_ne(s)).put_ne(d);
    }
}

macro_rules! int_kernel {
    ($t:ty, $op:expr, $src:expr, $dst:expr, $count:expr) => {{
        match $op {
            ReduceOp::NoOp => {}
            ReduceOp::Replace => apply::<$t>($src, $dst, $count, |_, b| b),
            ReduceOp::Sum => apply::<$t>($src, $dst, $count, |a, b| a.wrapping_add(b)),
            ReduceOp::Product => apply::<$t>($src, $dst, $count, |a, b| a.wrapping_mul(b)),
            ReduceOp::Min => apply::<$t>($src, $dst, $count, |a, b| a.min(b)),
            ReduceOp::Max => apply::<$t>($src, $dst, $count, |a, b| a.max(b)),
            ReduceOp::BAnd => apply::<$t>($src, $dst, $count, |a, b| a & b),
            ReduceOp::BOr => apply::<$t>($src, $dst, $count, |a, b| a | b),
            ReduceOp::BXor => apply::<$t>($src, $dst, $count, |a, b| a ^ b),
            ReduceOp::LAnd => apply::<$t>($src, $dst, $count, |a, b| ((a != 0) && (b != 0)) as $t),
            ReduceOp::LOr => apply::<$t>($src, $dst, $count, |a, b| ((a != 0) || (b != 0)) as $t),
            ReduceOp::LXor => apply::<$t>($src, $dst, $count, |a, b| ((a != 0) != (b != 0)) as $t),
        }
        Ok(())
    }};
}

macro_rules! float_kernel {
    ($t:ty, $op:expr, $dtype:expr, $src:expr, $dst:expr, $count:expr) => {{
        match $op {
            ReduceOp::NoOp => {}
            ReduceOp::Replace => apply::<$t>($src, $dst, $count, |_, b| b),
            ReduceOp::Sum => apply::<$t>($src, $dst, $count, |a, b| a + b),
            ReduceOp::Product => apply::<$t>($src, $dst, $count, |a, b| a * b),
            ReduceOp::Min => apply::<$t>($src, $dst, $count, |a: $t, b| a.min(b)),
            ReduceOp::Max => apply::<$t>($src, $dst, $count, |a: $t, b| a.max(b)),
            other => return Err(RmaError::UnsupportedReduction { op: other, dtype: $dtype }),
        }
        Ok(())
    }};
}

impl Reducer for BuiltinReducer {
    fn reduce(
        &self,
        op: ReduceOp,
        src: &[u8],
        dst: &mut [u8],
        count: usize,
        dtype: Datatype,
    ) -> RmaResult<()> {
        let layout = Layout::new(count, dtype);
        ensure_len(src.len(), layout)?;
        ensure_len(dst.len(), layout)?;

        match dtype {
            // Raw bytes only support moves and bit operations
            Datatype::Byte => match op {
                ReduceOp::NoOp
                | ReduceOp::Replace
                | ReduceOp::BAnd
                | ReduceOp::BOr
                | ReduceOp::BXor => int_kernel!(u8, op, src, dst, count),
                other => Err(RmaError::UnsupportedReduction { op: other, dtype }),
            },
            Datatype::I8 => int_kernel!(i8, op, src, dst, count),
            Datatype::U8 => int_kernel!(u8, op, src, dst, count),
            Datatype::I16 => int_kernel!(i16, op, src, dst, count),
            Datatype::U16 => int_kernel!(u16, op, src, dst, count),
            Datatype::I32 => int_kernel!(i32, op, src, dst, count),
            Datatype::U32 => int_kernel!(u32, op, src, dst, count),
            Datatype::I64 => int_kernel!(i64, op, src, dst, count),
            Datatype::U64 => int_kernel!(u64, op, src, dst, count),
            Datatype::F32 => float_kernel!(f32, op, dtype, src, dst, count),
            Datatype::F64 => float_kernel!(f64, op, dtype, src, dst, count),
        }
    }
}
