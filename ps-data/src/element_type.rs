//! The closed element-type enumeration shared by every tensor, dense table,
//! and sparse table in the system. A table's element type is fixed at
//! registration time; every `Value` held in that table must share it (see
//! the per-table element-type-uniformity invariant).

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::EnumIter;

/// A closed enumeration of the element types a tensor can hold.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter,
)]
#[repr(u8)]
pub enum ElementType {
    /// A boolean, stored as one byte.
    Bool = 0,
    /// Unsigned 8-bit integer.
    U8 = 1,
    /// Unsigned 16-bit integer.
    U16 = 2,
    /// Unsigned 32-bit integer.
    U32 = 3,
    /// Unsigned 64-bit integer.
    U64 = 4,
    /// Signed 8-bit integer.
    I8 = 5,
    /// Signed 16-bit integer.
    I16 = 6,
    /// Signed 32-bit integer.
    I32 = 7,
    /// Signed 64-bit integer.
    I64 = 8,
    /// IEEE-754 half precision float, stored as its raw bit pattern. No
    /// arithmetic kernel is provided for this type (see DESIGN.md); it
    /// exists in the enumeration for storage/serialization completeness.
    F16 = 9,
    /// IEEE-754 single precision float.
    F32 = 10,
    /// IEEE-754 double precision float.
    F64 = 11,
}

impl ElementType {
    /// The width, in bytes, of a single element of this type.
    pub fn byte_width(self) -> usize {
        use ElementType::*;
        match self {
            Bool | U8 | I8 => 1,
            U16 | I16 | F16 => 2,
            U32 | I32 | F32 => 4,
            U64 | I64 | F64 => 8,
        }
    }

    /// Whether the optimizer kernels in `ps-optim` can operate directly on
    /// this element type.
    pub fn is_floating_point(self) -> bool {
        matches!(self, ElementType::F32 | ElementType::F64)
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ElementType::*;
        let s = match self {
            Bool => "bool",
            U8 => "u8",
            U16 => "u16",
            U32 => "u32",
            U64 => "u64",
            I8 => "i8",
            I16 => "i16",
            I32 => "i32",
            I64 => "i64",
            F16 => "f16",
            F32 => "f32",
            F64 => "f64",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn byte_widths_are_nonzero_and_match_rust_primitives() {
        assert_eq!(ElementType::F32.byte_width(), std::mem::size_of::<f32>());
        assert_eq!(ElementType::F64.byte_width(), std::mem::size_of::<f64>());
        assert_eq!(ElementType::U64.byte_width(), std::mem::size_of::<u64>());
        assert_eq!(ElementType::Bool.byte_width(), 1);
    }

    #[test]
    fn only_f32_f64_are_floating_point() {
        for et in ElementType::iter() {
            assert_eq!(
                et.is_floating_point(),
                matches!(et, ElementType::F32 | ElementType::F64)
            );
        }
    }
}
