//! [`Tensor`]: `(shape, element_type, shared storage, byte offset)`, per §3
//! of the data model. Storage is shared by reference count (`Arc`); a
//! tensor may view a slice of someone else's storage (e.g. one row of a
//! matrix via [`Tensor::row`]) — mutating such a view mutates the
//! underlying storage, exactly as it would with a raw pointer + offset in
//! the source system this crate reimplements.
//!
//! Element-wise arithmetic (the numeric kernels the optimizer variants in
//! `ps-optim` are built from) is implemented generically over
//! `num_traits::Float` for `f32`/`f64`; other element types may be stored
//! and serialized but are rejected with `ElementTypeMismatch` by every
//! arithmetic method here.

use std::sync::Arc;

use num_traits::Float;
use parking_lot::RwLock;
use ps_errors::{PsError, PsResult};
use rand::Rng;

use crate::device::DeviceContext;
use crate::element_type::ElementType;
use crate::shape::Shape;
use crate::storage::TensorStorage;

/// A tensor: a shape and element type describing a view into shared,
/// reference-counted storage at some byte offset.
#[derive(Debug, Clone)]
pub struct Tensor {
    storage: Arc<RwLock<TensorStorage>>,
    offset: usize,
    shape: Shape,
    element_type: ElementType,
}

fn type_mismatch(expected: ElementType, actual: ElementType) -> PsError {
    PsError::ElementTypeMismatch {
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}

fn shape_mismatch(expected: &Shape, actual: &Shape) -> PsError {
    PsError::ShapeMismatch {
        expected: expected.dims().to_vec(),
        actual: actual.dims().to_vec(),
    }
}

impl Tensor {
    /// Allocate a new, zero-filled tensor owning its own storage.
    ///
    /// `device` is accepted (rather than assumed) to keep allocation
    /// decisions explicit instead of routed through a hidden global
    /// allocator; today there's only [`DeviceContext::cpu`].
    pub fn zeros(shape: Shape, element_type: ElementType, _device: &DeviceContext) -> Self {
        let storage = TensorStorage::zeros(element_type, shape.size());
        Tensor {
            storage: Arc::new(RwLock::new(storage)),
            offset: 0,
            shape,
            element_type,
        }
    }

    /// Construct a floating-point tensor from host-side `f64` values,
    /// narrowing to `f32` storage if `element_type` is `F32`.
    pub fn from_f64_slice(
        shape: Shape,
        element_type: ElementType,
        values: &[f64],
    ) -> PsResult<Self> {
        if values.len() != shape.size() {
            return Err(shape_mismatch(&shape, &Shape::new(vec![values.len()])));
        }
        let storage = match element_type {
            ElementType::F32 => {
                TensorStorage::F32(values.iter().map(|&v| v as f32).collect())
            }
            ElementType::F64 => TensorStorage::F64(values.to_vec()),
            other => return Err(type_mismatch(ElementType::F32, other)),
        };
        Ok(Tensor {
            storage: Arc::new(RwLock::new(storage)),
            offset: 0,
            shape,
            element_type,
        })
    }

    /// Sample a uniform-random tensor in `[low, high)`, as used by the
    /// sparse table initializer and by dense table creation helpers in
    /// tests.
    pub fn random_uniform(
        shape: Shape,
        element_type: ElementType,
        low: f64,
        high: f64,
        rng: &mut impl Rng,
    ) -> PsResult<Self> {
        if !element_type.is_floating_point() {
            return Err(type_mismatch(ElementType::F32, element_type));
        }
        let values: Vec<f64> = (0..shape.size())
            .map(|_| rng.random_range(low..high))
            .collect();
        Tensor::from_f64_slice(shape, element_type, &values)
    }

    /// This tensor's shape.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// This tensor's element type.
    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// The byte offset of this tensor's view into its storage.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The number of elements in this tensor (the product of its shape's
    /// dimensions).
    pub fn size(&self) -> usize {
        self.shape.size()
    }

    /// The number of bytes this tensor's elements occupy.
    pub fn num_bytes(&self) -> usize {
        self.size() * self.element_type.byte_width()
    }

    /// Whether two tensors alias the same underlying storage allocation
    /// (regardless of shape/offset) — used by tests asserting that a view
    /// really does share memory with its parent.
    pub fn aliases(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Deep-copy this tensor's view into freshly allocated, independent
    /// storage. Used for pull responses (dense and sparse) and for
    /// `Value::clone_deep`.
    pub fn clone_deep(&self) -> Self {
        let guard = self.storage.read();
        let bytes_storage = clone_range(&guard, self.offset, self.size());
        Tensor {
            storage: Arc::new(RwLock::new(bytes_storage)),
            offset: 0,
            shape: self.shape.clone(),
            element_type: self.element_type,
        }
    }

    /// Serialize this tensor's elements to raw little-endian bytes in
    /// row-major order, per the wire format (shape and element type are
    /// serialized separately by the caller).
    pub fn raw_bytes(&self) -> Vec<u8> {
        self.storage.read().raw_bytes(self.offset, self.size())
    }

    /// Reconstruct a tensor owning fresh storage from `shape`, its
    /// element type, and raw little-endian element bytes, the inverse of
    /// [`Self::raw_bytes`] — used to decode tensors off the wire.
    pub fn from_raw_bytes(shape: Shape, element_type: ElementType, bytes: &[u8]) -> PsResult<Self> {
        let storage = TensorStorage::from_raw_bytes(element_type, shape.size(), bytes)
            .ok_or_else(|| PsError::internal("raw byte length does not match shape/element type"))?;
        Ok(Tensor {
            storage: Arc::new(RwLock::new(storage)),
            offset: 0,
            shape,
            element_type,
        })
    }

    /// Read out this tensor's elements as `f64`, regardless of whether the
    /// underlying storage is `f32` or `f64`. Used by tests and by pull
    /// responses that need a uniform comparison type.
    pub fn as_f64_vec(&self) -> PsResult<Vec<f64>> {
        let guard = self.storage.read();
        match self.element_type {
            ElementType::F32 => Ok(guard
                .f32_slice(self.offset, self.size())
                .unwrap()
                .iter()
                .map(|&v| v as f64)
                .collect()),
            ElementType::F64 => Ok(guard.f64_slice(self.offset, self.size()).unwrap().to_vec()),
            other => Err(type_mismatch(ElementType::F32, other)),
        }
    }

    /// Extract one row of a 2-D tensor as a 1-D tensor that *aliases* this
    /// tensor's storage (`Vector(i)` in the source system). Mutating the
    /// returned tensor mutates `self`'s storage.
    pub fn row(&self, idx: usize) -> PsResult<Tensor> {
        ps_errors::invariant!(
            self.shape.ndims() == 2,
            "row() requires a 2-D tensor, got {} dims",
            self.shape.ndims()
        );
        ps_errors::invariant!(
            idx < self.shape.dim(0),
            "row index {idx} out of bounds for dim0={}",
            self.shape.dim(0)
        );
        let row_len = self.shape.dim(1);
        Ok(Tensor {
            storage: Arc::clone(&self.storage),
            offset: self.offset + idx * self.shape.stride(0),
            shape: Shape::vector(row_len),
            element_type: self.element_type,
        })
    }

    fn check_same_layout(&self, other: &Tensor) -> PsResult<()> {
        if self.element_type != other.element_type {
            return Err(type_mismatch(self.element_type, other.element_type));
        }
        if self.shape.size() != other.shape.size() {
            return Err(shape_mismatch(&self.shape, &other.shape));
        }
        Ok(())
    }

    /// `self += scale * other`, element-wise. Used by every optimizer
    /// kernel's parameter update (e.g. SGD's `v -= lr * grad` is
    /// `add_scaled_in_place(grad, -lr)`).
    pub fn add_scaled_in_place(&mut self, other: &Tensor, scale: f64) -> PsResult<()> {
        self.check_same_layout(other)?;
        with_matching_float_pair(self, other, |dst, src| add_scaled(dst, src, scale))
    }

    /// `self *= scalar`, element-wise.
    pub fn mul_scalar_in_place(&mut self, scalar: f64) -> PsResult<()> {
        with_float_slice_mut(self, |dst| mul_scalar(dst, scalar))
    }

    /// `self = self.powi(2)`, element-wise, in place.
    pub fn square_in_place(&mut self) -> PsResult<()> {
        with_float_slice_mut(self, |dst| {
            for x in dst.iter_mut() {
                *x = *x * *x;
            }
        })
    }

    /// `self = sqrt(self)`, element-wise, in place.
    pub fn sqrt_in_place(&mut self) -> PsResult<()> {
        with_float_slice_mut(self, |dst| {
            for x in dst.iter_mut() {
                *x = x.sqrt();
            }
        })
    }

    /// `self = max(self, other)`, element-wise, in place.
    pub fn max_in_place(&mut self, other: &Tensor) -> PsResult<()> {
        self.check_same_layout(other)?;
        with_matching_float_pair(self, other, |dst, src| {
            for (d, s) in dst.iter_mut().zip(src.iter()) {
                if *s > *d {
                    *d = *s;
                }
            }
        })
    }

    /// `self = self / other`, element-wise, in place.
    pub fn div_in_place(&mut self, other: &Tensor) -> PsResult<()> {
        self.check_same_layout(other)?;
        with_matching_float_pair(self, other, |dst, src| {
            for (d, s) in dst.iter_mut().zip(src.iter()) {
                *d = *d / *s;
            }
        })
    }

    /// `self = self / (other + eps)`, element-wise, in place — the division
    /// step every adaptive optimizer kernel here uses to avoid dividing by
    /// (near-)zero state.
    pub fn div_add_eps_in_place(&mut self, other: &Tensor, eps: f64) -> PsResult<()> {
        self.check_same_layout(other)?;
        with_matching_float_pair(self, other, |dst, src| {
            for (d, s) in dst.iter_mut().zip(src.iter()) {
                *d = *d / (*s + num_traits::cast(eps).unwrap());
            }
        })
    }

    /// `self = beta * self + (1 - beta) * other`, element-wise, in place —
    /// the exponential-moving-average update used by RMSprop's running
    /// averages and Adam's moment estimates.
    pub fn ema_in_place(&mut self, other: &Tensor, beta: f64) -> PsResult<()> {
        self.check_same_layout(other)?;
        with_matching_float_pair(self, other, |dst, src| ema(dst, src, beta))
    }

    /// `self = beta * self + (1 - beta) * other^2`, element-wise, in place
    /// — Adam/RMSprop's second-moment update, without materializing
    /// `other^2` as an intermediate tensor.
    pub fn ema_of_square_in_place(&mut self, other: &Tensor, beta: f64) -> PsResult<()> {
        self.check_same_layout(other)?;
        with_matching_float_pair(self, other, |dst, src| {
            for (d, s) in dst.iter_mut().zip(src.iter()) {
                *d = *d * num_traits::cast::<_, f32>(beta).unwrap()
                    + (1.0 - num_traits::cast::<_, f32>(beta).unwrap()) * (*s * *s);
            }
        })
    }
}

fn clone_range(storage: &TensorStorage, offset: usize, len: usize) -> TensorStorage {
    use TensorStorage::*;
    match storage {
        Bool(v) => Bool(v[offset..offset + len].to_vec()),
        U8(v) => U8(v[offset..offset + len].to_vec()),
        U16(v) => U16(v[offset..offset + len].to_vec()),
        U32(v) => U32(v[offset..offset + len].to_vec()),
        U64(v) => U64(v[offset..offset + len].to_vec()),
        I8(v) => I8(v[offset..offset + len].to_vec()),
        I16(v) => I16(v[offset..offset + len].to_vec()),
        I32(v) => I32(v[offset..offset + len].to_vec()),
        I64(v) => I64(v[offset..offset + len].to_vec()),
        F16(v) => F16(v[offset..offset + len].to_vec()),
        F32(v) => F32(v[offset..offset + len].to_vec()),
        F64(v) => F64(v[offset..offset + len].to_vec()),
    }
}

fn with_float_slice_mut(t: &mut Tensor, f: impl FnOnce(&mut [f32])) -> PsResult<()> {
    let mut guard = t.storage.write();
    match t.element_type {
        ElementType::F32 => match guard.f32_slice_mut(t.offset, t.size()) {
            Some(slice) => {
                f(slice);
                Ok(())
            }
            None => Err(type_mismatch(ElementType::F32, t.element_type)),
        },
        ElementType::F64 => match guard.f64_slice_mut(t.offset, t.size()) {
            Some(slice) => {
                apply_f64_single_via_f32_fn(slice, f);
                Ok(())
            }
            None => Err(type_mismatch(ElementType::F64, t.element_type)),
        },
        other => Err(type_mismatch(ElementType::F32, other)),
    }
}

/// Run `f(dst_slice, src_slice)` over `a`'s and `b`'s underlying storage,
/// dispatching on whichever concrete float type both share. Both tensors
/// must already have been checked for matching element type and size.
fn with_matching_float_pair<F>(a: &mut Tensor, b: &Tensor, f: F) -> PsResult<()>
where
    F: FnOnce(&mut [f32], &[f32]),
{
    match a.element_type {
        ElementType::F32 => {
            let mut a_guard = a.storage.write();
            // `a` and `b` may alias the same storage (e.g. accumulating a
            // gradient into itself is not something callers do, but a self
            // EMA is, for e.g. a scalar state); avoid a double-borrow
            // panic by cloning `b`'s slice out first when they alias.
            if Arc::ptr_eq(&a.storage, &b.storage) {
                let src: Vec<f32> = a_guard
                    .f32_slice(b.offset, b.size())
                    .unwrap()
                    .to_vec();
                let dst = a_guard.f32_slice_mut(a.offset, a.size()).unwrap();
                f(dst, &src);
            } else {
                let b_guard = b.storage.read();
                let src = b_guard
                    .f32_slice(b.offset, b.size())
                    .ok_or_else(|| type_mismatch(ElementType::F32, b.element_type))?;
                let dst = a_guard
                    .f32_slice_mut(a.offset, a.size())
                    .ok_or_else(|| type_mismatch(ElementType::F32, a.element_type))?;
                f(dst, src);
            }
            Ok(())
        }
        ElementType::F64 => {
            // f64 path shares the same structure but via a thin adapter
            // that casts through f64 slices directly (no narrowing).
            let mut a_guard = a.storage.write();
            if Arc::ptr_eq(&a.storage, &b.storage) {
                let src: Vec<f64> = a_guard.f64_slice(b.offset, b.size()).unwrap().to_vec();
                let dst = a_guard.f64_slice_mut(a.offset, a.size()).unwrap();
                apply_f64_via_f32_fn(dst, &src, f);
            } else {
                let b_guard = b.storage.read();
                let src = b_guard
                    .f64_slice(b.offset, b.size())
                    .ok_or_else(|| type_mismatch(ElementType::F64, b.element_type))?
                    .to_vec();
                let dst = a_guard
                    .f64_slice_mut(a.offset, a.size())
                    .ok_or_else(|| type_mismatch(ElementType::F64, a.element_type))?;
                apply_f64_via_f32_fn(dst, &src, f);
            }
            Ok(())
        }
        other => Err(type_mismatch(ElementType::F32, other)),
    }
}

/// Bridge an `f32`-slice kernel to operate on `f64` slices by round-tripping
/// through `f32` buffers of the same length. Kept private: real double
/// tables are rare in this workspace (most models are `f32`), and this
/// avoids duplicating every kernel body for a second float width.
fn apply_f64_via_f32_fn(dst: &mut [f64], src: &[f64], f: impl FnOnce(&mut [f32], &[f32])) {
    let mut dst32: Vec<f32> = dst.iter().map(|&v| v as f32).collect();
    let src32: Vec<f32> = src.iter().map(|&v| v as f32).collect();
    f(&mut dst32, &src32);
    for (d, s) in dst.iter_mut().zip(dst32.iter()) {
        *d = *s as f64;
    }
}

/// Single-slice counterpart of [`apply_f64_via_f32_fn`], for the
/// `with_float_slice_mut` kernels (`square_in_place`, `sqrt_in_place`,
/// `mul_scalar_in_place`) that only ever touch one tensor's storage.
fn apply_f64_single_via_f32_fn(dst: &mut [f64], f: impl FnOnce(&mut [f32])) {
    let mut dst32: Vec<f32> = dst.iter().map(|&v| v as f32).collect();
    f(&mut dst32);
    for (d, s) in dst.iter_mut().zip(dst32.iter()) {
        *d = *s as f64;
    }
}

fn add_scaled<T: Float>(dst: &mut [T], src: &[T], scale: f64) {
    let scale = num_traits::cast(scale).unwrap();
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d = *d + scale * *s;
    }
}

fn mul_scalar<T: Float>(dst: &mut [T], scalar: f64) {
    let scalar = num_traits::cast(scalar).unwrap();
    for d in dst.iter_mut() {
        *d = *d * scalar;
    }
}

fn ema<T: Float>(dst: &mut [T], src: &[T], beta: f64) {
    let beta: T = num_traits::cast(beta).unwrap();
    let one_minus_beta = T::one() - beta;
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d = beta * *d + one_minus_beta * *s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev() -> DeviceContext {
        DeviceContext::cpu()
    }

    #[test]
    fn clone_deep_produces_independent_storage() {
        let mut a = Tensor::zeros(Shape::vector(3), ElementType::F32, &dev());
        let b = a.clone_deep();
        assert!(!a.aliases(&b));
        a.mul_scalar_in_place(2.0).unwrap();
        assert_eq!(b.as_f64_vec().unwrap(), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn row_view_aliases_parent_storage() {
        let t = Tensor::from_f64_slice(
            Shape::new(vec![2, 2]),
            ElementType::F32,
            &[1.0, 2.0, 3.0, 4.0],
        )
        .unwrap();
        let mut row0 = t.row(0).unwrap();
        assert!(row0.aliases(&t));
        row0.mul_scalar_in_place(10.0).unwrap();
        assert_eq!(t.as_f64_vec().unwrap(), vec![10.0, 20.0, 3.0, 4.0]);
    }

    #[test]
    fn add_scaled_matches_sgd_formula() {
        let mut v = Tensor::from_f64_slice(Shape::vector(4), ElementType::F32, &[1.0; 4]).unwrap();
        let grad =
            Tensor::from_f64_slice(Shape::vector(4), ElementType::F32, &[1.0; 4]).unwrap();
        v.add_scaled_in_place(&grad, -0.1).unwrap();
        for x in v.as_f64_vec().unwrap() {
            assert!((x - 0.9).abs() < 1e-6);
        }
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let mut a = Tensor::zeros(Shape::vector(3), ElementType::F32, &dev());
        let b = Tensor::zeros(Shape::vector(4), ElementType::F32, &dev());
        assert!(a.add_scaled_in_place(&b, 1.0).is_err());
    }

    #[test]
    fn mismatched_element_types_are_rejected() {
        let mut a = Tensor::zeros(Shape::vector(3), ElementType::F32, &dev());
        let b = Tensor::zeros(Shape::vector(3), ElementType::F64, &dev());
        assert!(a.add_scaled_in_place(&b, 1.0).is_err());
    }

    #[test]
    fn raw_bytes_round_trips_via_from_raw_bytes() {
        let t = Tensor::from_f64_slice(Shape::new(vec![2, 2]), ElementType::F32, &[1.0, 2.0, 3.0, 4.0])
            .unwrap();
        let bytes = t.raw_bytes();
        let back = Tensor::from_raw_bytes(t.shape().clone(), t.element_type(), &bytes).unwrap();
        assert_eq!(back.as_f64_vec().unwrap(), t.as_f64_vec().unwrap());
    }

    #[test]
    fn square_sqrt_and_mul_scalar_work_on_f64_storage() {
        let mut t = Tensor::from_f64_slice(Shape::vector(2), ElementType::F64, &[3.0, 4.0]).unwrap();
        t.square_in_place().unwrap();
        assert_eq!(t.as_f64_vec().unwrap(), vec![9.0, 16.0]);
        t.sqrt_in_place().unwrap();
        assert_eq!(t.as_f64_vec().unwrap(), vec![3.0, 4.0]);
        t.mul_scalar_in_place(2.0).unwrap();
        assert_eq!(t.as_f64_vec().unwrap(), vec![6.0, 8.0]);
    }

    #[test]
    fn ema_of_square_matches_manual_computation() {
        let mut avg =
            Tensor::from_f64_slice(Shape::vector(1), ElementType::F32, &[0.0]).unwrap();
        let grad = Tensor::from_f64_slice(Shape::vector(1), ElementType::F32, &[2.0]).unwrap();
        avg.ema_of_square_in_place(&grad, 0.9).unwrap();
        // 0.9*0 + 0.1*4 = 0.4
        assert!((avg.as_f64_vec().unwrap()[0] - 0.4).abs() < 1e-5);
    }
}
