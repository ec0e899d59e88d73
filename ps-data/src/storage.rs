//! Backing storage for tensors. A [`TensorStorage`] owns a flat, typed
//! buffer; a [`crate::tensor::Tensor`] is a `(shape, element type, shared
//! storage, byte offset)` tuple that may alias a slice of it, per §3 of the
//! data model.

use serde::{Deserialize, Serialize};

use crate::element_type::ElementType;

/// A flat, typed buffer of tensor elements. One variant per
/// [`ElementType`]. `F16` is kept as raw `u16` bit patterns since no
/// arithmetic kernel operates on it (see DESIGN.md).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorStorage {
    /// `bool` elements.
    Bool(Vec<bool>),
    /// `u8` elements.
    U8(Vec<u8>),
    /// `u16` elements.
    U16(Vec<u16>),
    /// `u32` elements.
    U32(Vec<u32>),
    /// `u64` elements.
    U64(Vec<u64>),
    /// `i8` elements.
    I8(Vec<i8>),
    /// `i16` elements.
    I16(Vec<i16>),
    /// `i32` elements.
    I32(Vec<i32>),
    /// `i64` elements.
    I64(Vec<i64>),
    /// `f16` elements, stored as raw bit patterns.
    F16(Vec<u16>),
    /// `f32` elements.
    F32(Vec<f32>),
    /// `f64` elements.
    F64(Vec<f64>),
}

impl TensorStorage {
    /// Allocate a zero-filled buffer of `len` elements of type `etype`.
    pub fn zeros(etype: ElementType, len: usize) -> Self {
        use ElementType::*;
        match etype {
            Bool => TensorStorage::Bool(vec![false; len]),
            U8 => TensorStorage::U8(vec![0; len]),
            U16 => TensorStorage::U16(vec![0; len]),
            U32 => TensorStorage::U32(vec![0; len]),
            U64 => TensorStorage::U64(vec![0; len]),
            I8 => TensorStorage::I8(vec![0; len]),
            I16 => TensorStorage::I16(vec![0; len]),
            I32 => TensorStorage::I32(vec![0; len]),
            I64 => TensorStorage::I64(vec![0; len]),
            F16 => TensorStorage::F16(vec![0; len]),
            F32 => TensorStorage::F32(vec![0.0; len]),
            F64 => TensorStorage::F64(vec![0.0; len]),
        }
    }

    /// The element type this storage holds.
    pub fn element_type(&self) -> ElementType {
        use TensorStorage::*;
        match self {
            Bool(_) => ElementType::Bool,
            U8(_) => ElementType::U8,
            U16(_) => ElementType::U16,
            U32(_) => ElementType::U32,
            U64(_) => ElementType::U64,
            I8(_) => ElementType::I8,
            I16(_) => ElementType::I16,
            I32(_) => ElementType::I32,
            I64(_) => ElementType::I64,
            F16(_) => ElementType::F16,
            F32(_) => ElementType::F32,
            F64(_) => ElementType::F64,
        }
    }

    /// The number of elements in this buffer.
    pub fn len(&self) -> usize {
        use TensorStorage::*;
        match self {
            Bool(v) => v.len(),
            U8(v) => v.len(),
            U16(v) => v.len(),
            U32(v) => v.len(),
            U64(v) => v.len(),
            I8(v) => v.len(),
            I16(v) => v.len(),
            I32(v) => v.len(),
            I64(v) => v.len(),
            F16(v) => v.len(),
            F32(v) => v.len(),
            F64(v) => v.len(),
        }
    }

    /// Whether this buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A mutable view of the `f32` elements in `[offset, offset+len)`, or
    /// `None` if this storage isn't `F32`.
    pub fn f32_slice_mut(&mut self, offset: usize, len: usize) -> Option<&mut [f32]> {
        match self {
            TensorStorage::F32(v) => Some(&mut v[offset..offset + len]),
            _ => None,
        }
    }

    /// A read-only view of the `f32` elements in `[offset, offset+len)`.
    pub fn f32_slice(&self, offset: usize, len: usize) -> Option<&[f32]> {
        match self {
            TensorStorage::F32(v) => Some(&v[offset..offset + len]),
            _ => None,
        }
    }

    /// A mutable view of the `f64` elements in `[offset, offset+len)`.
    pub fn f64_slice_mut(&mut self, offset: usize, len: usize) -> Option<&mut [f64]> {
        match self {
            TensorStorage::F64(v) => Some(&mut v[offset..offset + len]),
            _ => None,
        }
    }

    /// A read-only view of the `f64` elements in `[offset, offset+len)`.
    pub fn f64_slice(&self, offset: usize, len: usize) -> Option<&[f64]> {
        match self {
            TensorStorage::F64(v) => Some(&v[offset..offset + len]),
            _ => None,
        }
    }

    /// Serialize `[offset, offset+len)` of this storage to raw
    /// little-endian element bytes in row-major order, per the wire format.
    pub fn raw_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        macro_rules! le_bytes {
            ($v:expr) => {
                $v[offset..offset + len]
                    .iter()
                    .flat_map(|x| x.to_le_bytes())
                    .collect()
            };
        }
        use TensorStorage::*;
        match self {
            Bool(v) => v[offset..offset + len].iter().map(|&b| b as u8).collect(),
            U8(v) => v[offset..offset + len].to_vec(),
            U16(v) => le_bytes!(v),
            U32(v) => le_bytes!(v),
            U64(v) => le_bytes!(v),
            I8(v) => v[offset..offset + len].iter().map(|&b| b as u8).collect(),
            I16(v) => le_bytes!(v),
            I32(v) => le_bytes!(v),
            I64(v) => le_bytes!(v),
            F16(v) => le_bytes!(v),
            F32(v) => le_bytes!(v),
            F64(v) => le_bytes!(v),
        }
    }

    /// Reconstruct storage of `etype` holding `len` elements from raw
    /// little-endian element bytes, the inverse of [`Self::raw_bytes`].
    /// Returns `None` if `bytes.len()` doesn't match `len * etype.byte_width()`.
    pub fn from_raw_bytes(etype: ElementType, len: usize, bytes: &[u8]) -> Option<Self> {
        if bytes.len() != len * etype.byte_width() {
            return None;
        }
        macro_rules! from_le {
            ($ty:ty, $variant:ident) => {
                TensorStorage::$variant(
                    bytes
                        .chunks_exact(std::mem::size_of::<$ty>())
                        .map(|c| <$ty>::from_le_bytes(c.try_into().unwrap()))
                        .collect(),
                )
            };
        }
        use ElementType::*;
        Some(match etype {
            Bool => TensorStorage::Bool(bytes.iter().map(|&b| b != 0).collect()),
            U8 => TensorStorage::U8(bytes.to_vec()),
            U16 => from_le!(u16, U16),
            U32 => from_le!(u32, U32),
            U64 => from_le!(u64, U64),
            I8 => TensorStorage::I8(bytes.iter().map(|&b| b as i8).collect()),
            I16 => from_le!(i16, I16),
            I32 => from_le!(i32, I32),
            I64 => from_le!(i64, I64),
            F16 => from_le!(u16, F16),
            F32 => from_le!(f32, F32),
            F64 => from_le!(f64, F64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeros_has_requested_len_and_type() {
        let s = TensorStorage::zeros(ElementType::F32, 4);
        assert_eq!(s.len(), 4);
        assert_eq!(s.element_type(), ElementType::F32);
    }

    #[test]
    fn raw_bytes_round_trip_lengths() {
        let s = TensorStorage::F32(vec![1.0, 2.0, 3.0]);
        let bytes = s.raw_bytes(0, 3);
        assert_eq!(bytes.len(), 3 * std::mem::size_of::<f32>());
    }

    #[test]
    fn raw_bytes_round_trips_through_from_raw_bytes() {
        let s = TensorStorage::F32(vec![1.0, -2.5, 3.25]);
        let bytes = s.raw_bytes(0, 3);
        let back = TensorStorage::from_raw_bytes(ElementType::F32, 3, &bytes).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn from_raw_bytes_rejects_wrong_length() {
        assert!(TensorStorage::from_raw_bytes(ElementType::F32, 3, &[0u8; 4]).is_none());
    }
}
