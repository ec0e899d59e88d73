//! [`SparseTable`]: a concurrent `u64 -> Value` map, lazily initialized on
//! first reference (§3, §4.1). Backed by [`crate::stripe_map::StripedMap`]
//! for the fine-grained concurrency the design note requires.

use ps_data::{DeviceContext, TableMetaData, Value};
use ps_errors::{PsError, PsResult};
use ps_optim::Optimizer;

use crate::stripe_map::StripedMap;

/// A sparse table: a key-indexed map of fixed-dimension rows, each
/// materialized the first time its key is referenced by a pull or push.
pub struct SparseTable {
    meta: TableMetaData,
    map: StripedMap<Value>,
}

impl SparseTable {
    /// Construct an empty sparse table from its metadata.
    pub fn new(meta: TableMetaData) -> PsResult<Self> {
        if meta.sparse_dimension().is_none() {
            return Err(PsError::internal("SparseTable::new called with non-sparse metadata"));
        }
        Ok(SparseTable {
            meta,
            map: StripedMap::new(),
        })
    }

    /// This table's metadata.
    pub fn meta(&self) -> &TableMetaData {
        &self.meta
    }

    /// The number of materialized keys (not the theoretical 2^64 keyspace).
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether any key has been materialized.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn dimension(&self) -> usize {
        self.meta.sparse_dimension().expect("checked at construction")
    }

    fn initializer(&self) -> &ps_data::InitializerSpec {
        match &self.meta.kind {
            ps_data::TableKind::Sparse { initializer, .. } => initializer,
            ps_data::TableKind::Dense { .. } => unreachable!("checked at construction"),
        }
    }

    /// Pull semantics (sparse): for each key, materialize it if absent
    /// (deterministically, seeded from the key — §8 property 5) and return
    /// a deep copy (§4.1 pull semantics).
    pub fn pull(&self, key: u64, device: &DeviceContext) -> PsResult<Value> {
        let dim = self.dimension();
        let etype = self.meta.element_type;
        let init = self.initializer();
        let tensor = init.apply(dim, etype, key, device)?;
        Ok(self
            .map
            .upsert_with(key, || Value::new(tensor), |v| v.clone_deep()))
    }

    /// Push semantics (sparse): materialize the key if absent, verify the
    /// gradient row's size, then run `optimizer` on the (now-present)
    /// entry.
    pub fn push(
        &self,
        key: u64,
        optimizer: &Optimizer,
        grad_row: &ps_data::Tensor,
        lr: f64,
        device: &DeviceContext,
    ) -> PsResult<()> {
        let dim = self.dimension();
        if grad_row.size() != dim {
            return Err(PsError::ShapeMismatch {
                expected: vec![dim],
                actual: grad_row.shape().dims().to_vec(),
            });
        }
        let etype = self.meta.element_type;
        let init = self.initializer();
        let tensor = init.apply(dim, etype, key, device)?;
        self.map.upsert_with(
            key,
            || Value::new(tensor),
            |v| optimizer.update(v, grad_row, lr, device),
        )
    }

    /// `TryFetchSparse`: of the requested `keys`, those that are already
    /// materialized, paired with a deep copy of their value. Unlike `pull`,
    /// this never materializes an absent key (§4.1).
    pub fn try_fetch(&self, keys: &[u64]) -> (Vec<u64>, Vec<Value>) {
        let mut found_keys = Vec::new();
        let mut values = Vec::new();
        for &key in keys {
            if let Some(v) = self.map.with_entry(key, |v| v.map(Value::clone_deep)) {
                found_keys.push(key);
                values.push(v);
            }
        }
        (found_keys, values)
    }

    /// A snapshot of every materialized `(key, Value)` pair — used by save
    /// and by shard transfer.
    pub fn snapshot(&self) -> Vec<(u64, Value)> {
        self.map.snapshot(|k, v| (k, v.clone_deep()))
    }

    /// Every currently materialized key, with no values attached — used by
    /// the scheduler to compute which keys a membership change reassigns,
    /// without paying for a full value snapshot.
    pub fn materialized_keys(&self) -> Vec<u64> {
        self.map.snapshot(|k, _| k)
    }

    /// Remove a key, returning its value if present — used by shard
    /// transfer to drain reassigned keys from the source.
    pub fn remove(&self, key: u64) -> Option<Value> {
        self.map.remove(key)
    }

    /// Remove exactly `keys` (skipping any already absent), returning the
    /// removed `(key, Value)` pairs — used by shard transfer to drain only
    /// the keys the new router reassigns, leaving keys that still belong
    /// to this shard untouched.
    pub fn remove_many(&self, keys: &[u64]) -> Vec<(u64, Value)> {
        keys.iter().filter_map(|&k| self.map.remove(k).map(|v| (k, v))).collect()
    }

    /// Insert a key's value unconditionally, overwriting any existing
    /// entry — used by shard-transfer destinations and load.
    pub fn restore(&self, key: u64, value: Value) {
        self.map.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ps_data::{ElementType, InitializerSpec, Shape, Tensor};
    use std::sync::Arc;
    use std::thread;

    fn dev() -> DeviceContext {
        DeviceContext::cpu()
    }

    fn table() -> SparseTable {
        let meta = TableMetaData::sparse(0, "emb", 2, ElementType::F32, InitializerSpec::zeros());
        SparseTable::new(meta).unwrap()
    }

    #[test]
    fn first_pull_materializes_from_initializer() {
        let t = table();
        let v = t.pull(7, &dev()).unwrap();
        assert_eq!(v.tensor().as_f64_vec().unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn lazy_init_matches_direct_initializer_call() {
        let t = table();
        let meta = TableMetaData::sparse(0, "emb", 2, ElementType::F32, InitializerSpec::uniform(-1.0, 1.0));
        let t2 = SparseTable::new(meta).unwrap();
        let pulled = t2.pull(99, &dev()).unwrap();
        let direct = InitializerSpec::uniform(-1.0, 1.0)
            .apply(2, ElementType::F32, 99, &dev())
            .unwrap();
        assert_eq!(pulled.tensor().as_f64_vec().unwrap(), direct.as_f64_vec().unwrap());
        let _ = t; // keep the zero-init table alive/used above
    }

    #[test]
    fn push_matches_s2_adagrad_scenario() {
        let t = table();
        let opt = Optimizer::Adagrad {
            eps: 1e-8,
            weight_decay: 0.0,
        };
        let grad = Tensor::from_f64_slice(Shape::vector(2), ElementType::F32, &[2.0, 2.0]).unwrap();
        t.push(7, &opt, &grad, 1.0, &dev()).unwrap();
        t.push(7, &opt, &grad, 1.0, &dev()).unwrap();
        let v = t.pull(7, &dev()).unwrap();
        for x in v.tensor().as_f64_vec().unwrap() {
            assert!((x - (-1.707)).abs() < 1e-3, "got {x}");
        }
    }

    #[test]
    fn try_fetch_never_materializes_absent_keys() {
        let t = table();
        let (keys, values) = t.try_fetch(&[1, 2, 3]);
        assert!(keys.is_empty());
        assert!(values.is_empty());
        assert!(!t.map.contains(1));
    }

    #[test]
    fn concurrent_pulls_of_same_absent_key_return_identical_clones() {
        let t = Arc::new(table());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let t = Arc::clone(&t);
                thread::spawn(move || t.pull(55, &dev()).unwrap().tensor().as_f64_vec().unwrap())
            })
            .collect();
        let first = handles.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>();
        for v in &first {
            assert_eq!(v, &first[0]);
        }
    }

    #[test]
    fn push_rejects_wrong_dimension_gradient() {
        let t = table();
        let opt = Optimizer::Sgd;
        let grad = Tensor::from_f64_slice(Shape::vector(3), ElementType::F32, &[1.0; 3]).unwrap();
        assert!(t.push(1, &opt, &grad, 0.1, &dev()).is_err());
    }
}
