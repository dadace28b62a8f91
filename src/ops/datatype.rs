//! Datatypes, layouts and the typed transfer primitive
//!
//! Every buffer handed to the engine is a byte slice paired with a
//! `Layout` (element count + element type). The `Transfer` trait moves
//! bytes between two such buffers and rejects mismatched signatures.

use crate::error::TransferError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Basic element types understood by transfer and reduction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Datatype {
    /// Untyped byte, compatible with every other type for plain moves
    Byte,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl Datatype {
    /// Size of one element in bytes
    pub fn size(&self) -> usize {
        match self {
            Datatype::Byte | Datatype::I8 | Datatype::U8 => 1,
            Datatype::I16 | Datatype::U16 => 2,
            Datatype::I32 | Datatype::U32 | Datatype::F32 => 4,
            Datatype::I64 | Datatype::U64 | Datatype::F64 => 8,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Datatype::Byte => "byte",
            Datatype::I8 => "i8",
            Datatype::U8 => "u8",
            Datatype::I16 => "i16",
            Datatype::U16 => "u16",
            Datatype::I32 => "i32",
            Datatype::U32 => "u32",
            Datatype::I64 => "i64",
            Datatype::U64 => "u64",
            Datatype::F32 => "f32",
            Datatype::F64 => "f64",
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Datatype::F32 | Datatype::F64)
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Element count and type of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub count: usize,
    pub dtype: Datatype,
}

impl Layout {
    pub fn new(count: usize, dtype: Datatype) -> Self {
        Self { count, dtype }
    }

    /// Total number of bytes described by this layout, saturating at
    /// `usize::MAX`
    pub fn bytes(&self) -> usize {
        self.count.saturating_mul(self.dtype.size())
    }

    /// Total number of bytes, or an error when the count overflows
    pub fn checked_bytes(&self) -> Result<usize, TransferError> {
        self.count
            .checked_mul(self.dtype.size())
            .ok_or(TransferError::LayoutOverflow {
                count: self.count,
                dtype: self.dtype,
            })
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.count, self.dtype)
    }
}

/// Read-only typed buffer (origin or compare operand)
#[derive(Debug, Clone, Copy)]
pub struct Buf<'a> {
    pub data: &'a [u8],
    pub layout: Layout,
}

impl<'a> Buf<'a> {
    pub fn new(data: &'a [u8], layout: Layout) -> Self {
        Self { data, layout }
    }

    /// Describe a whole byte slice as `data.len() / dtype.size()` elements
    pub fn of(data: &'a [u8], dtype: Datatype) -> Self {
        Self::new(data, Layout::new(data.len() / dtype.size(), dtype))
    }
}

/// Writable typed buffer (result or get destination)
#[derive(Debug)]
pub struct BufMut<'a> {
    pub data: &'a mut [u8],
    pub layout: Layout,
}

impl<'a> BufMut<'a> {
    pub fn new(data: &'a mut [u8], layout: Layout) -> Self {
        Self { data, layout }
    }

    pub fn of(data: &'a mut [u8], dtype: Datatype) -> Self {
        let count = data.len() / dtype.size();
        Self::new(data, Layout::new(count, dtype))
    }
}

/// Primitive types that can be packed into engine buffers
pub trait Element: Copy {
    const DTYPE: Datatype;
    fn put_ne(self, out: &mut [u8]);
    fn get_ne(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($t:ty => $d:ident),* $(,)?) => {
        $(
            impl Element for $t {
                const DTYPE: Datatype = Datatype::$d;

                fn put_ne(self, out: &mut [u8]) {
                    out[..std::mem::size_of::<$t>()].copy_from_slice(&self.to_ne_bytes());
                }

                fn get_ne(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(&bytes[..std::mem::size_of::<$t>()]);
                    <$t>::from_ne_bytes(raw)
                }
            }
        )*
    };
}

impl_element!(
    i8 => I8, u8 => U8, i16 => I16, u16 => U16, i32 => I32, u32 => U32,
    i64 => I64, u64 => U64, f32 => F32, f64 => F64,
);

/// Pack a slice of elements into native-endian bytes
pub fn encode<T: Element>(values: &[T]) -> Vec<u8> {
    let size = T::DTYPE.size();
    let mut out = vec![0u8; values.len() * size];
    for (chunk, v) in out.chunks_exact_mut(size).zip(values) {
        v.put_ne(chunk);
    }
    out
}

/// Unpack native-endian bytes into elements; trailing partial elements are ignored
pub fn decode<T: Element>(bytes: &[u8]) -> Vec<T> {
    bytes.chunks_exact(T::DTYPE.size()).map(T::get_ne).collect()
}

/// Typed move between two buffers
pub trait Transfer: Send + Sync {
    /// Copy `src` (described by `src_layout`) into `dst` (described by
    /// `dst_layout`). Returns the number of bytes written into `dst`.
    fn copy(
        &self,
        src: &[u8],
        src_layout: Layout,
        dst: &mut [u8],
        dst_layout: Layout,
    ) -> Result<usize, TransferError>;
}

/// Contiguous transfer: element types must agree (or one side is `Byte`),
/// and the destination must be large enough to hold the source.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackedTransfer;

impl PackedTransfer {
    /// Validate a pair of layouts without moving anything
    pub fn check(src_layout: Layout, dst_layout: Layout) -> Result<(), TransferError> {
        let compatible = src_layout.dtype == dst_layout.dtype
            || src_layout.dtype == Datatype::Byte
            || dst_layout.dtype == Datatype::Byte;
        if !compatible {
            return Err(TransferError::TypeMismatch {
                src: src_layout.dtype,
                dst: dst_layout.dtype,
            });
        }
        if src_layout.bytes() > dst_layout.bytes() {
            return Err(TransferError::Truncated {
                src_bytes: src_layout.bytes(),
                dst_bytes: dst_layout.bytes(),
            });
        }
        Ok(())
    }
}

impl Transfer for PackedTransfer {
    fn copy(
        &self,
        src: &[u8],
        src_layout: Layout,
        dst: &mut [u8],
        dst_layout: Layout,
    ) -> Result<usize, TransferError> {
        ensure_len(src.len(), src_layout)?;
        ensure_len(dst.len(), dst_layout)?;
        Self::check(src_layout, dst_layout)?;
        let n = src_layout.bytes();
        dst[..n].copy_from_slice(&src[..n]);
        Ok(n)
    }
}

/// Fail when a slice is shorter than its declared layout
pub fn ensure_len(len: usize, layout: Layout) -> Result<(), TransferError> {
    let needed = layout.checked_bytes()?;
    if len < needed {
        return Err(TransferError::BufferTooSmall {
            needed,
            actual: len,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_bytes() {
        assert_eq!(Layout::new(4, Datatype::U64).bytes(), 32);
        assert_eq!(Layout::new(3, Datatype::I16).bytes(), 6);
        assert_eq!(Layout::new(0, Datatype::F32).bytes(), 0);
    }

    #[test]
    fn test_overflowing_layout_rejected() {
        let huge = Layout::new(usize::MAX / 2, Datatype::U64);
        assert_eq!(huge.bytes(), usize::MAX);
        assert!(matches!(
            huge.checked_bytes(),
            Err(TransferError::LayoutOverflow { .. })
        ));
        assert!(matches!(
            ensure_len(64, huge),
            Err(TransferError::LayoutOverflow { .. })
        ));

        let mut dst = [0u8; 8];
        let err = PackedTransfer
            .copy(&[0u8; 8], huge, &mut dst, Layout::new(1, Datatype::U64))
            .unwrap_err();
        assert!(matches!(err, TransferError::LayoutOverflow { .. }));
    }

    #[test]
    fn test_encode_decode() {
        let values = [1u32, 0xdead_beef, 7];
        let bytes = encode(&values);
        assert_eq!(bytes.len(), 12);
        assert_eq!(decode::<u32>(&bytes), values.to_vec());
    }

    #[test]
    fn test_packed_copy() {
        let src = encode(&[5u64, 6]);
        let mut dst = vec![0u8; 24];
        let n = PackedTransfer
            .copy(&src, Layout::new(2, Datatype::U64), &mut dst, Layout::new(3, Datatype::U64))
            .unwrap();
        assert_eq!(n, 16);
        assert_eq!(decode::<u64>(&dst), vec![5, 6, 0]);
    }

    #[test]
    fn test_type_mismatch() {
        let src = encode(&[1.0f64]);
        let mut dst = vec![0u8; 8];
        let err = PackedTransfer
            .copy(&src, Layout::new(1, Datatype::F64), &mut dst, Layout::new(1, Datatype::I64))
            .unwrap_err();
        assert!(matches!(err, TransferError::TypeMismatch { .. }));
    }

    #[test]
    fn test_byte_is_compatible() {
        let src = encode(&[42i32]);
        let mut dst = vec![0u8; 4];
        PackedTransfer
            .copy(&src, Layout::new(1, Datatype::I32), &mut dst, Layout::new(4, Datatype::Byte))
            .unwrap();
        assert_eq!(decode::<i32>(&dst), vec![42]);
    }

    #[test]
    fn test_truncation_and_short_buffers() {
        let src = encode(&[1u16, 2, 3]);
        let mut dst = vec![0u8; 4];
        let err = PackedTransfer
            .copy(&src, Layout::new(3, Datatype::U16), &mut dst, Layout::new(2, Datatype::U16))
            .unwrap_err();
        assert!(matches!(err, TransferError::Truncated { src_bytes: 6, dst_bytes: 4 }));

        let err = PackedTransfer
            .copy(&src[..2], Layout::new(3, Datatype::U16), &mut dst, Layout::new(2, Datatype::U16))
            .unwrap_err();
        assert!(matches!(err, TransferError::BufferTooSmall { needed: 6, actual: 2 }));
    }
}
