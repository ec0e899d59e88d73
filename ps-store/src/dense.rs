//! [`DenseTable`]: a single [`Value`] whose tensor has `meta.shape`, guarded
//! by one read-mostly lock (§4.1).

use parking_lot::RwLock;

use ps_data::{DeviceContext, TableMetaData, Value};
use ps_errors::{PsError, PsResult};
use ps_optim::Optimizer;

/// A dense table: one parameter value, shared by every worker that pushes
/// or pulls it. The entire table lives on exactly one PS under any given
/// router version (§3's keyspace-partition invariant).
pub struct DenseTable {
    meta: TableMetaData,
    value: RwLock<Value>,
}

impl DenseTable {
    /// Construct a dense table already holding `initial`. `initial` must
    /// already match `meta`'s shape/element type; this is checked once at
    /// registration, not on every push/pull.
    pub fn new(meta: TableMetaData, initial: Value) -> PsResult<Self> {
        let shape = meta
            .dense_shape()
            .ok_or_else(|| PsError::internal("DenseTable::new called with non-dense metadata"))?;
        initial.check_invariants(meta.element_type, shape)?;
        Ok(DenseTable {
            meta,
            value: RwLock::new(initial),
        })
    }

    /// This table's metadata.
    pub fn meta(&self) -> &TableMetaData {
        &self.meta
    }

    /// Pull semantics (dense): a deep copy of the current parameter tensor,
    /// taken under the table's read lock. No optimizer state is returned
    /// (§4.1 pull semantics).
    pub fn pull(&self) -> Value {
        self.value.read().clone_deep()
    }

    /// Push semantics (dense): acquire the table's write lock, verify
    /// shape/type, then run `optimizer` on `(tensor, states, grad, lr)` in
    /// place (§4.1 push semantics).
    pub fn push(
        &self,
        optimizer: &Optimizer,
        grad: &ps_data::Tensor,
        lr: f64,
        device: &DeviceContext,
    ) -> PsResult<()> {
        let mut value = self.value.write();
        optimizer.update(&mut value, grad, lr, device)
    }

    /// A deep copy of the current value, including optimizer state — used
    /// by `TryFetchDense` and by save.
    pub fn fetch(&self) -> Value {
        self.value.read().clone_deep()
    }

    /// Overwrite this table's value wholesale — used by load.
    pub fn restore(&self, value: Value) {
        *self.value.write() = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ps_data::{ElementType, Shape, Tensor};

    fn dev() -> DeviceContext {
        DeviceContext::cpu()
    }

    fn table() -> DenseTable {
        let meta = TableMetaData::dense(0, "w", Shape::vector(4), ElementType::F32);
        let initial = Value::new(Tensor::from_f64_slice(Shape::vector(4), ElementType::F32, &[1.0; 4]).unwrap());
        DenseTable::new(meta, initial).unwrap()
    }

    #[test]
    fn push_then_pull_round_trips_sgd_update() {
        let t = table();
        let opt = Optimizer::Sgd;
        let grad = Tensor::from_f64_slice(Shape::vector(4), ElementType::F32, &[1.0; 4]).unwrap();
        t.push(&opt, &grad, 0.1, &dev()).unwrap();
        let pulled = t.pull();
        for x in pulled.tensor().as_f64_vec().unwrap() {
            assert!((x - 0.9).abs() < 1e-6);
        }
    }

    #[test]
    fn pull_returns_independent_copy() {
        let t = table();
        let mut a = t.pull();
        a.tensor_mut().mul_scalar_in_place(100.0).unwrap();
        let b = t.pull();
        assert_eq!(b.tensor().as_f64_vec().unwrap(), vec![1.0; 4]);
    }

    #[test]
    fn construction_rejects_shape_mismatch() {
        let meta = TableMetaData::dense(0, "w", Shape::vector(4), ElementType::F32);
        let bad = Value::new(Tensor::zeros(Shape::vector(3), ElementType::F32, &dev()));
        assert!(DenseTable::new(meta, bad).is_err());
    }
}
