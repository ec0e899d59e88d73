//! The scheduler's model/table registry (§4.5): `name -> model_id`,
//! `model_id -> ModelMetaData`, with monotonic id assignment. "First worker
//! requesting a model name wins"; table registration is the same idea,
//! scoped per model.

use std::collections::HashMap;

use parking_lot::RwLock;

use ps_data::{ElementType, InitializerSpec, ModelMetaData, OptimizerSpec, Shape, TableMetaData};
use ps_errors::{PsError, PsResult};

/// The scheduler's authoritative model registry.
#[derive(Default)]
pub struct ModelRegistry {
    by_name: RwLock<HashMap<String, u64>>,
    by_id: RwLock<HashMap<u64, ModelMetaData>>,
    next_model_id: RwLock<u64>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `ApplyModelId {name} -> {model_id}` (§4.5, §6): the first caller for
    /// a name creates the model (with `optimizer`) and wins the id
    /// assignment; later callers for the same name get the existing id
    /// back regardless of the optimizer they pass (the model's optimizer
    /// is fixed at creation).
    pub fn apply_model_id(&self, name: &str, optimizer: OptimizerSpec) -> u64 {
        if let Some(&id) = self.by_name.read().get(name) {
            return id;
        }
        let mut by_name = self.by_name.write();
        // re-check under the write lock: another caller may have created
        // the model between our read-lock miss and taking the write lock.
        if let Some(&id) = by_name.get(name) {
            return id;
        }
        let mut next = self.next_model_id.write();
        let id = *next;
        *next += 1;
        by_name.insert(name.to_string(), id);
        self.by_id.write().insert(id, ModelMetaData::new(id, name, optimizer));
        id
    }

    /// This model's metadata, if registered.
    pub fn model(&self, model_id: u64) -> Option<ModelMetaData> {
        self.by_id.read().get(&model_id).cloned()
    }

    /// Every currently registered model's metadata, for broadcast to newly
    /// joined PS nodes.
    pub fn all_models(&self) -> Vec<ModelMetaData> {
        self.by_id.read().values().cloned().collect()
    }

    /// `ApplyDenseTable {model_id, name, shape, etype} -> {table_id}`
    /// (§4.5, §6): analogous first-caller-wins semantics, scoped to the
    /// model's own table namespace.
    pub fn apply_dense_table(
        &self,
        model_id: u64,
        name: &str,
        shape: Shape,
        element_type: ElementType,
    ) -> PsResult<u64> {
        self.apply_table(model_id, name, |id| TableMetaData::dense(id, name, shape.clone(), element_type))
    }

    /// `ApplySparseTable {model_id, name, dimension, etype, init_type,
    /// init_conf} -> {table_id}` (§4.5, §6).
    pub fn apply_sparse_table(
        &self,
        model_id: u64,
        name: &str,
        dimension: usize,
        element_type: ElementType,
        initializer: InitializerSpec,
    ) -> PsResult<u64> {
        self.apply_table(model_id, name, |id| {
            TableMetaData::sparse(id, name, dimension, element_type, initializer.clone())
        })
    }

    fn apply_table(&self, model_id: u64, name: &str, build: impl Fn(u64) -> TableMetaData) -> PsResult<u64> {
        let mut by_id = self.by_id.write();
        let model = by_id.get_mut(&model_id).ok_or(PsError::UnknownModel(model_id))?;
        if let Some(existing) = model.table_by_name(name) {
            return Ok(existing.id);
        }
        let table_id = model.next_table_id();
        model.tables.insert(table_id, build(table_id));
        Ok(table_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_caller_wins_model_id_assignment() {
        let reg = ModelRegistry::new();
        let a = reg.apply_model_id("rec", OptimizerSpec::sgd());
        let b = reg.apply_model_id("rec", OptimizerSpec::sgd());
        assert_eq!(a, b);
        let other = reg.apply_model_id("ctr", OptimizerSpec::sgd());
        assert_ne!(a, other);
    }

    #[test]
    fn table_ids_are_unique_within_a_model() {
        let reg = ModelRegistry::new();
        let model_id = reg.apply_model_id("rec", OptimizerSpec::sgd());
        let t0 = reg
            .apply_dense_table(model_id, "bias", Shape::vector(4), ElementType::F32)
            .unwrap();
        let t1 = reg
            .apply_sparse_table(model_id, "emb", 8, ElementType::F32, InitializerSpec::zeros())
            .unwrap();
        assert_ne!(t0, t1);
        // re-applying the same name returns the existing id.
        let t0_again = reg
            .apply_dense_table(model_id, "bias", Shape::vector(4), ElementType::F32)
            .unwrap();
        assert_eq!(t0, t0_again);
    }

    #[test]
    fn table_registration_against_unknown_model_is_rejected() {
        let reg = ModelRegistry::new();
        assert!(matches!(
            reg.apply_dense_table(42, "w", Shape::vector(4), ElementType::F32),
            Err(PsError::UnknownModel(42))
        ));
    }
}
