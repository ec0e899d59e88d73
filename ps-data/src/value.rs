//! [`Value`]: the unit held by a table — a parameter tensor plus whatever
//! auxiliary optimizer state an optimizer kernel has allocated against it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::element_type::ElementType;
use crate::shape::Shape;
use crate::tensor::Tensor;
use ps_errors::PsResult;

/// A closed enumeration naming the auxiliary state an optimizer kernel may
/// attach to a [`Value`]. Not every optimizer uses every tag; each kernel
/// in `ps-optim` only ever reads/writes the tags it defined in SPEC_FULL.md
/// §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StateTag {
    /// Adagrad's running sum of squared gradients.
    StateSum,
    /// RMSprop's running average of squared gradients.
    SquareAvg,
    /// RMSprop (centred)'s running average of gradients.
    GradAvg,
    /// Adam's first moment estimate.
    FirstMoment,
    /// Adam's second moment estimate.
    SecondMoment,
    /// Adam (amsgrad)'s running maximum of the second moment estimate.
    SecondMomentMax,
    /// Adam's step counter, stored as a scalar (see [`Value::scalars`]).
    Steps,
}

impl StateTag {
    /// Every tag in the enumeration, for code that needs to enumerate
    /// possibly-allocated state (e.g. encoding a `Value` for the wire).
    pub const ALL: [StateTag; 7] = [
        StateTag::StateSum,
        StateTag::SquareAvg,
        StateTag::GradAvg,
        StateTag::FirstMoment,
        StateTag::SecondMoment,
        StateTag::SecondMomentMax,
        StateTag::Steps,
    ];
}

/// A parameter tensor plus whatever optimizer state has been lazily
/// allocated against it. Cheap to [`Clone`] in the `Arc`-aliasing sense —
/// use [`Value::clone_deep`] when an independent copy is required (e.g. a
/// pull response).
#[derive(Debug, Clone)]
pub struct Value {
    tensor: Tensor,
    states: HashMap<StateTag, Tensor>,
    scalars: HashMap<StateTag, i64>,
}

impl Value {
    /// Construct a fresh value with no optimizer state allocated yet.
    pub fn new(tensor: Tensor) -> Self {
        Value {
            tensor,
            states: HashMap::new(),
            scalars: HashMap::new(),
        }
    }

    /// The parameter tensor.
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    /// A mutable reference to the parameter tensor, for in-place optimizer
    /// updates.
    pub fn tensor_mut(&mut self) -> &mut Tensor {
        &mut self.tensor
    }

    /// This value's element type (the parameter tensor's).
    pub fn element_type(&self) -> ElementType {
        self.tensor.element_type()
    }

    /// This value's shape (the parameter tensor's).
    pub fn shape(&self) -> &Shape {
        self.tensor.shape()
    }

    /// The auxiliary state tensor for `tag`, allocating a zero-filled one
    /// shaped like the parameter tensor if absent. Used by kernels'
    /// lazy-allocation step (§4.2 point 2).
    pub fn state_or_init(&mut self, tag: StateTag, device: &crate::device::DeviceContext) -> &mut Tensor {
        self.states
            .entry(tag)
            .or_insert_with(|| Tensor::zeros(self.tensor.shape().clone(), self.tensor.element_type(), device))
    }

    /// The auxiliary state tensor for `tag`, if it has been allocated.
    pub fn state(&self, tag: StateTag) -> Option<&Tensor> {
        self.states.get(&tag)
    }

    /// The scalar for `tag` (e.g. Adam's step counter), defaulting to 0 if
    /// absent.
    pub fn scalar(&self, tag: StateTag) -> i64 {
        self.scalars.get(&tag).copied().unwrap_or(0)
    }

    /// Set the scalar for `tag`.
    pub fn set_scalar(&mut self, tag: StateTag, value: i64) {
        self.scalars.insert(tag, value);
    }

    /// An independent deep copy: the parameter tensor and every allocated
    /// state tensor are copied into fresh storage, so mutating the clone
    /// never mutates `self`. Used for pull responses, per §3: "A value is
    /// Clone-able to an independent deep copy."
    pub fn clone_deep(&self) -> Self {
        Value {
            tensor: self.tensor.clone_deep(),
            states: self
                .states
                .iter()
                .map(|(&tag, t)| (tag, t.clone_deep()))
                .collect(),
            scalars: self.scalars.clone(),
        }
    }

    /// Verify this value's tensor (and, if present, its state tensors)
    /// match `expected_type`/`expected_shape` — the per-table element-type
    /// and optimizer-state-shape invariants from §3.
    pub fn check_invariants(
        &self,
        expected_type: ElementType,
        expected_shape: &Shape,
    ) -> PsResult<()> {
        ps_errors::invariant_eq!(self.tensor.element_type(), expected_type);
        ps_errors::invariant_eq!(self.tensor.shape().dims(), expected_shape.dims());
        for state in self.states.values() {
            ps_errors::invariant_eq!(state.element_type(), expected_type);
            ps_errors::invariant_eq!(state.shape().dims(), self.tensor.shape().dims());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceContext;

    fn dev() -> DeviceContext {
        DeviceContext::cpu()
    }

    #[test]
    fn state_or_init_allocates_zeros_shaped_like_parameter() {
        let t = Tensor::zeros(Shape::vector(3), ElementType::F32, &dev());
        let mut v = Value::new(t);
        let state = v.state_or_init(StateTag::StateSum, &dev());
        assert_eq!(state.shape().dims(), &[3]);
        assert_eq!(state.as_f64_vec().unwrap(), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn clone_deep_is_independent() {
        let t = Tensor::zeros(Shape::vector(2), ElementType::F32, &dev());
        let mut v = Value::new(t);
        v.state_or_init(StateTag::SquareAvg, &dev());
        let mut clone = v.clone_deep();
        clone.tensor_mut().mul_scalar_in_place(5.0).unwrap();
        assert!(!v.tensor().aliases(clone.tensor()));
        assert_eq!(v.tensor().as_f64_vec().unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn scalar_defaults_to_zero() {
        let t = Tensor::zeros(Shape::vector(1), ElementType::F32, &dev());
        let v = Value::new(t);
        assert_eq!(v.scalar(StateTag::Steps), 0);
    }

    #[test]
    fn check_invariants_rejects_shape_drift() {
        let t = Tensor::zeros(Shape::vector(3), ElementType::F32, &dev());
        let v = Value::new(t);
        assert!(v.check_invariants(ElementType::F32, &Shape::vector(4)).is_err());
        assert!(v.check_invariants(ElementType::F32, &Shape::vector(3)).is_ok());
    }
}
