//! [`ModelShard`]: one PS node's local view of a model — its cached
//! [`ModelMetaData`] (kept in sync with the scheduler's authoritative copy)
//! plus whatever tables of that model this PS actually owns storage for.
//!
//! Table registration (§4.1's `RegisterDenseTable`/`RegisterSparseTable`)
//! is driven by the scheduler, which has already assigned `table_id` via
//! `ApplyDenseTable`/`ApplySparseTable` (§6); this layer's job is to
//! materialize local storage for that id and reject inconsistent
//! re-registration.

use std::collections::HashMap;

use parking_lot::RwLock;

use ps_data::{DeviceContext, ElementType, InitializerSpec, ModelMetaData, OptimizerSpec, Shape, TableMetaData, Value};
use ps_errors::{PsError, PsResult};
use ps_optim::Optimizer;

use crate::dense::DenseTable;
use crate::sparse::SparseTable;
use crate::table::Table;

/// One PS node's local state for a single model: its cached metadata, the
/// optimizer kernel constructed from it, and whatever tables of this model
/// this PS hosts.
pub struct ModelShard {
    meta: RwLock<ModelMetaData>,
    optimizer: Optimizer,
    tables: RwLock<HashMap<u64, Table>>,
    device: DeviceContext,
}

impl ModelShard {
    /// Construct a new, empty model shard from the model's metadata (as
    /// broadcast by the scheduler on registration). Fails if the optimizer
    /// kind in `meta.optimizer` isn't recognized (§4.2 point 3).
    pub fn new(meta: ModelMetaData, device: DeviceContext) -> PsResult<Self> {
        let optimizer = Optimizer::from_spec(&meta.optimizer)?;
        Ok(ModelShard {
            meta: RwLock::new(meta),
            optimizer,
            tables: RwLock::new(HashMap::new()),
            device,
        })
    }

    /// This model's id.
    pub fn model_id(&self) -> u64 {
        self.meta.read().id
    }

    /// This model's optimizer spec (re-derivable, but convenient for
    /// diagnostics/tests).
    pub fn optimizer_spec(&self) -> OptimizerSpec {
        self.meta.read().optimizer.clone()
    }

    /// Register a dense table on this shard: `RegisterDenseTable` (§4.1).
    /// Idempotent on exact re-registration of the same name/shape/type
    /// (the scheduler may retry a registration broadcast); rejects a name
    /// collision with different parameters.
    pub fn register_dense_table(
        &self,
        table_id: u64,
        name: &str,
        shape: Shape,
        element_type: ElementType,
        initial: Value,
    ) -> PsResult<u64> {
        let mut tables = self.tables.write();
        if let Some(existing) = tables.get(&table_id) {
            return self.check_duplicate(existing, name, element_type, Some(&shape), None);
        }
        let meta = TableMetaData::dense(table_id, name, shape, element_type);
        let table = DenseTable::new(meta.clone(), initial)?;
        tables.insert(table_id, Table::Dense(table));
        self.meta.write().tables.insert(table_id, meta);
        Ok(table_id)
    }

    /// Register a sparse table on this shard: `RegisterSparseTable` (§4.1).
    pub fn register_sparse_table(
        &self,
        table_id: u64,
        name: &str,
        dimension: usize,
        element_type: ElementType,
        initializer: InitializerSpec,
    ) -> PsResult<u64> {
        let mut tables = self.tables.write();
        if let Some(existing) = tables.get(&table_id) {
            return self.check_duplicate(existing, name, element_type, None, Some(dimension));
        }
        let meta = TableMetaData::sparse(table_id, name, dimension, element_type, initializer);
        let table = SparseTable::new(meta.clone())?;
        tables.insert(table_id, Table::Sparse(table));
        self.meta.write().tables.insert(table_id, meta);
        Ok(table_id)
    }

    fn check_duplicate(
        &self,
        existing: &Table,
        name: &str,
        element_type: ElementType,
        shape: Option<&Shape>,
        dimension: Option<usize>,
    ) -> PsResult<u64> {
        let meta = existing.meta();
        let matches = meta.name == name
            && meta.element_type == element_type
            && shape.map(|s| meta.dense_shape() == Some(s)).unwrap_or(true)
            && dimension.map(|d| meta.sparse_dimension() == Some(d)).unwrap_or(true);
        if matches {
            Ok(meta.id)
        } else {
            Err(PsError::DuplicateName(name.to_string()))
        }
    }

    /// Run `f` against the table for `table_id`, if present.
    pub fn with_table<R>(&self, table_id: u64, f: impl FnOnce(&Table) -> R) -> Option<R> {
        self.tables.read().get(&table_id).map(f)
    }

    /// `PullDense`/`CombinePullDenseTable`: deep copies of each requested
    /// dense table's value, in the same order as `table_ids`.
    pub fn pull_dense(&self, table_ids: &[u64]) -> PsResult<Vec<Value>> {
        metrics::counter!("ps_pull_dense_total").increment(table_ids.len() as u64);
        table_ids
            .iter()
            .map(|&id| {
                self.with_table(id, |t| {
                    t.as_dense()
                        .map(DenseTable::pull)
                        .ok_or_else(|| PsError::internal(format!("table {id} is not dense")))
                })
                .ok_or(PsError::UnknownTable(id))?
            })
            .collect()
    }

    /// `PushDenseTable`: apply `grad` to `table_id`'s value via this
    /// shard's optimizer.
    pub fn push_dense(&self, table_id: u64, grad: &ps_data::Tensor, lr: f64) -> PsResult<()> {
        metrics::counter!("ps_push_dense_total").increment(1);
        self.with_table(table_id, |t| {
            let dense = t
                .as_dense()
                .ok_or_else(|| PsError::internal(format!("table {table_id} is not dense")))?;
            dense.push(&self.optimizer, grad, lr, &self.device)
        })
        .ok_or(PsError::UnknownTable(table_id))?
    }

    /// `CombinePullSparseTable`: deep copies of `table_id`'s values for each
    /// key in `keys`, in order, lazily materializing absent keys.
    pub fn pull_sparse(&self, table_id: u64, keys: &[u64]) -> PsResult<Vec<Value>> {
        metrics::counter!("ps_pull_sparse_total").increment(keys.len() as u64);
        self.with_table(table_id, |t| {
            let sparse = t
                .as_sparse()
                .ok_or_else(|| PsError::internal(format!("table {table_id} is not sparse")))?;
            keys.iter().map(|&k| sparse.pull(k, &self.device)).collect()
        })
        .ok_or(PsError::UnknownTable(table_id))?
    }

    /// `CombinePushSparseTable` for one table's sub-batch: push each
    /// `(key, grad)` pair, recording how many succeeded/failed rather than
    /// aborting the sub-batch on the first error (§7's aggregate-status
    /// handling for combined requests).
    pub fn push_sparse_batch(
        &self,
        table_id: u64,
        keys: &[u64],
        grads: &[ps_data::Tensor],
        lr: f64,
    ) -> PsResult<(usize, usize, Option<String>)> {
        self.with_table(table_id, |t| {
            let sparse = t
                .as_sparse()
                .ok_or_else(|| PsError::internal(format!("table {table_id} is not sparse")))?;
            let mut succeeded = 0usize;
            let mut failed = 0usize;
            let mut first_error = None;
            for (&key, grad) in keys.iter().zip(grads.iter()) {
                match sparse.push(key, &self.optimizer, grad, lr, &self.device) {
                    Ok(()) => succeeded += 1,
                    Err(e) => {
                        failed += 1;
                        if first_error.is_none() {
                            first_error = Some(e.to_string());
                        }
                    }
                }
            }
            metrics::counter!("ps_push_sparse_total").increment(succeeded as u64);
            metrics::counter!("ps_push_sparse_failed_total").increment(failed as u64);
            Ok((succeeded, failed, first_error))
        })
        .ok_or(PsError::UnknownTable(table_id))?
    }

    /// `TryCombineFetchDenseTable`: a table's name and current value, or
    /// `None` if `table_id` isn't registered on this shard (or isn't
    /// dense).
    pub fn try_fetch_dense(&self, table_id: u64) -> Option<(String, Value)> {
        self.with_table(table_id, |t| t.as_dense().map(|d| (d.meta().name.clone(), d.fetch())))
            .flatten()
    }

    /// Every currently materialized key of a sparse table, for the
    /// scheduler's shard-transfer planning — does not materialize absent
    /// keys.
    pub fn sparse_keys(&self, table_id: u64) -> PsResult<Vec<u64>> {
        self.with_table(table_id, |t| {
            t.as_sparse()
                .map(SparseTable::materialized_keys)
                .ok_or_else(|| PsError::internal(format!("table {table_id} is not sparse")))
        })
        .ok_or(PsError::UnknownTable(table_id))?
    }

    /// Remove exactly `keys` from a sparse table and return their values —
    /// the source side of a targeted (not whole-table) shard transfer.
    pub fn drain_sparse_keys(&self, table_id: u64, keys: &[u64]) -> PsResult<Vec<(u64, Value)>> {
        self.with_table(table_id, |t| {
            t.as_sparse()
                .map(|s| s.remove_many(keys))
                .ok_or_else(|| PsError::internal(format!("table {table_id} is not sparse")))
        })
        .ok_or(PsError::UnknownTable(table_id))?
    }

    /// `TryFetchSparseValues`.
    pub fn try_fetch_sparse(&self, table_id: u64, keys: &[u64]) -> Option<(Vec<u64>, Vec<Value>)> {
        self.with_table(table_id, |t| t.as_sparse().map(|s| s.try_fetch(keys)))
            .flatten()
    }

    /// `TryFetchSparseMetaData`.
    pub fn try_fetch_sparse_meta(&self, table_id: u64) -> Option<TableMetaData> {
        self.with_table(table_id, |t| t.as_sparse().map(|s| s.meta().clone()))
            .flatten()
    }

    /// A snapshot of this shard's metadata, for save or diagnostics.
    pub fn meta_snapshot(&self) -> ModelMetaData {
        self.meta.read().clone()
    }

    /// Iterate every `(table_id, &Table)` this shard hosts, running `f` on
    /// each while holding the tables read lock — used by save/shard
    /// transfer which need to walk every table.
    pub fn for_each_table<R>(&self, mut f: impl FnMut(u64, &Table) -> R) -> Vec<R> {
        self.tables.read().iter().map(|(&id, t)| f(id, t)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ps_data::{ElementType, Shape, Tensor};

    fn shard() -> ModelShard {
        ModelShard::new(ModelMetaData::new(0, "rec", OptimizerSpec::sgd()), DeviceContext::cpu()).unwrap()
    }

    #[test]
    fn register_dense_then_pull_push_round_trips() {
        let shard = shard();
        let initial = Value::new(Tensor::from_f64_slice(Shape::vector(2), ElementType::F32, &[1.0, 1.0]).unwrap());
        shard
            .register_dense_table(0, "w", Shape::vector(2), ElementType::F32, initial)
            .unwrap();
        let grad = Tensor::from_f64_slice(Shape::vector(2), ElementType::F32, &[1.0, 1.0]).unwrap();
        shard.push_dense(0, &grad, 0.1).unwrap();
        let pulled = shard.pull_dense(&[0]).unwrap();
        assert_eq!(pulled.len(), 1);
        for x in pulled[0].tensor().as_f64_vec().unwrap() {
            assert!((x - 0.9).abs() < 1e-6);
        }
    }

    #[test]
    fn duplicate_registration_with_same_params_is_idempotent() {
        let shard = shard();
        let v1 = Value::new(Tensor::zeros(Shape::vector(2), ElementType::F32, &DeviceContext::cpu()));
        let v2 = Value::new(Tensor::zeros(Shape::vector(2), ElementType::F32, &DeviceContext::cpu()));
        let id1 = shard
            .register_dense_table(0, "w", Shape::vector(2), ElementType::F32, v1)
            .unwrap();
        let id2 = shard
            .register_dense_table(0, "w", Shape::vector(2), ElementType::F32, v2)
            .unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn duplicate_registration_with_different_shape_is_rejected() {
        let shard = shard();
        let v1 = Value::new(Tensor::zeros(Shape::vector(2), ElementType::F32, &DeviceContext::cpu()));
        shard
            .register_dense_table(0, "w", Shape::vector(2), ElementType::F32, v1)
            .unwrap();
        let v2 = Value::new(Tensor::zeros(Shape::vector(3), ElementType::F32, &DeviceContext::cpu()));
        assert!(shard
            .register_dense_table(0, "w", Shape::vector(3), ElementType::F32, v2)
            .is_err());
    }

    #[test]
    fn unknown_table_operations_are_rejected() {
        let shard = shard();
        assert!(shard.pull_dense(&[42]).is_err());
        assert!(shard.pull_sparse(42, &[1]).is_err());
    }

    #[test]
    fn combined_push_records_partial_failure_without_aborting_batch() {
        let shard = shard();
        shard
            .register_sparse_table(0, "emb", 2, ElementType::F32, InitializerSpec::zeros())
            .unwrap();
        let good = Tensor::from_f64_slice(Shape::vector(2), ElementType::F32, &[1.0, 1.0]).unwrap();
        let bad = Tensor::from_f64_slice(Shape::vector(3), ElementType::F32, &[1.0, 1.0, 1.0]).unwrap();
        let (succeeded, failed, first_error) = shard
            .push_sparse_batch(0, &[1, 2], &[good, bad], 0.1)
            .unwrap();
        assert_eq!(succeeded, 1);
        assert_eq!(failed, 1);
        assert!(first_error.is_some());
        // the good key's update still applied despite the bad one failing.
        assert!(shard.try_fetch_sparse(0, &[1]).unwrap().0.contains(&1));
    }
}
