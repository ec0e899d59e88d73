//! Tensor shapes and their derived row-major strides.

use serde::{Deserialize, Serialize};

/// An ordered sequence of dimensions, plus derived row-major strides.
///
/// Serializes as just its `dims` — strides are a derived quantity recomputed
/// on deserialize, not wire state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Vec<usize>,
    strides: Vec<usize>,
}

impl Serialize for Shape {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.dims.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Shape {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let dims = Vec::<usize>::deserialize(deserializer)?;
        Ok(Shape::new(dims))
    }
}

impl Shape {
    /// Construct a new shape from its dimensions, computing strides.
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        let dims = dims.into();
        let strides = Self::compute_strides(&dims);
        Shape { dims, strides }
    }

    fn compute_strides(dims: &[usize]) -> Vec<usize> {
        let mut strides = vec![1usize; dims.len()];
        for i in (0..dims.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1].saturating_mul(dims[i + 1]);
        }
        strides
    }

    /// The dimensions of this shape.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// The number of dimensions.
    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    /// The row-major stride for `axis`.
    pub fn stride(&self, axis: usize) -> usize {
        self.strides[axis]
    }

    /// The size of `axis`.
    pub fn dim(&self, axis: usize) -> usize {
        self.dims[axis]
    }

    /// The total number of elements: the product of all dimensions. A
    /// zero-dimension shape (a scalar) has size 1.
    pub fn size(&self) -> usize {
        self.dims.iter().product()
    }

    /// A 1-D shape of length `n`, as used for sparse table rows.
    pub fn vector(n: usize) -> Self {
        Shape::new(vec![n])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strides_are_row_major() {
        let s = Shape::new(vec![2, 3, 4]);
        assert_eq!(s.stride(0), 12);
        assert_eq!(s.stride(1), 4);
        assert_eq!(s.stride(2), 1);
        assert_eq!(s.size(), 24);
    }

    #[test]
    fn scalar_shape_has_size_one() {
        let s = Shape::new(Vec::<usize>::new());
        assert_eq!(s.size(), 1);
        assert_eq!(s.ndims(), 0);
    }

    #[test]
    fn serde_round_trip_recomputes_strides() {
        let s = Shape::new(vec![5, 2]);
        let json = serde_json::to_string(&s).unwrap();
        let back: Shape = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
        assert_eq!(back.stride(0), 2);
    }
}
