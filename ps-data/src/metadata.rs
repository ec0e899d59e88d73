//! Table and model metadata: the registry-level description of what a
//! table/model is, as opposed to the live data it holds.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::element_type::ElementType;
use crate::init::InitializerSpec;
use crate::shape::Shape;

/// Whether a table is dense (one value for the whole table, living on one
/// PS) or sparse (a key-indexed map of rows).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TableKind {
    /// A dense table: a single tensor of `shape`.
    Dense {
        /// The table's (fixed) tensor shape.
        shape: Shape,
    },
    /// A sparse table: rows of `dimension` elements, indexed by key.
    Sparse {
        /// The length of each row.
        dimension: usize,
        /// How a row is materialized the first time its key is referenced.
        initializer: InitializerSpec,
    },
}

/// The registry-level description of a table: its id, name, element type,
/// and dense/sparse layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetaData {
    /// The table's id, unique within its model.
    pub id: u64,
    /// The table's name, unique within its model.
    pub name: String,
    /// The element type every value in this table must share.
    pub element_type: ElementType,
    /// Dense or sparse layout.
    pub kind: TableKind,
}

impl TableMetaData {
    /// A new dense table's metadata.
    pub fn dense(id: u64, name: impl Into<String>, shape: Shape, element_type: ElementType) -> Self {
        TableMetaData {
            id,
            name: name.into(),
            element_type,
            kind: TableKind::Dense { shape },
        }
    }

    /// A new sparse table's metadata.
    pub fn sparse(
        id: u64,
        name: impl Into<String>,
        dimension: usize,
        element_type: ElementType,
        initializer: InitializerSpec,
    ) -> Self {
        TableMetaData {
            id,
            name: name.into(),
            element_type,
            kind: TableKind::Sparse {
                dimension,
                initializer,
            },
        }
    }

    /// Whether this table is dense.
    pub fn is_dense(&self) -> bool {
        matches!(self.kind, TableKind::Dense { .. })
    }

    /// The dense shape, if this is a dense table.
    pub fn dense_shape(&self) -> Option<&Shape> {
        match &self.kind {
            TableKind::Dense { shape } => Some(shape),
            TableKind::Sparse { .. } => None,
        }
    }

    /// The sparse row dimension, if this is a sparse table.
    pub fn sparse_dimension(&self) -> Option<usize> {
        match &self.kind {
            TableKind::Sparse { dimension, .. } => Some(*dimension),
            TableKind::Dense { .. } => None,
        }
    }
}

/// A named optimizer kind plus its hyperparameter config map, carried at
/// model-registration time and read once by the optimizer kernel
/// constructed for each table (§4.2 point 3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSpec {
    /// `"sgd"`, `"adagrad"`, `"rmsprop"`, or `"adam"`.
    pub kind: String,
    /// Hyperparameters keyed by name (`"beta1"`, `"beta2"`, `"eps"`,
    /// `"weight_decay"`, `"centred"`, `"amsgrad"` — booleans are encoded
    /// as `0.0`/`1.0`).
    pub config: HashMap<String, f64>,
}

impl OptimizerSpec {
    /// Plain SGD, with no hyperparameters.
    pub fn sgd() -> Self {
        OptimizerSpec {
            kind: "sgd".to_string(),
            config: HashMap::new(),
        }
    }

    /// This spec's named config value, or `default` if absent.
    pub fn config_or(&self, key: &str, default: f64) -> f64 {
        self.config.get(key).copied().unwrap_or(default)
    }

    /// This spec's named boolean config flag (nonzero is true), or
    /// `default` if absent.
    pub fn flag_or(&self, key: &str, default: bool) -> bool {
        self.config
            .get(key)
            .map(|&v| v != 0.0)
            .unwrap_or(default)
    }
}

/// The registry-level description of a model: its id, name, optimizer, and
/// tables. Model ids are unique and monotonically assigned by the
/// scheduler; table ids are unique within a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetaData {
    /// The model's id, unique and monotonically assigned.
    pub id: u64,
    /// The model's name, unique across the cluster.
    pub name: String,
    /// The optimizer every table in this model is updated with.
    pub optimizer: OptimizerSpec,
    /// This model's tables, keyed by table id.
    pub tables: HashMap<u64, TableMetaData>,
}

impl ModelMetaData {
    /// A new, empty model (no tables registered yet).
    pub fn new(id: u64, name: impl Into<String>, optimizer: OptimizerSpec) -> Self {
        ModelMetaData {
            id,
            name: name.into(),
            optimizer,
            tables: HashMap::new(),
        }
    }

    /// Look up a table's metadata by name, if registered.
    pub fn table_by_name(&self, name: &str) -> Option<&TableMetaData> {
        self.tables.values().find(|t| t.name == name)
    }

    /// The next table id to assign, one past the highest currently
    /// registered (0 if this model has no tables yet).
    pub fn next_table_id(&self) -> u64 {
        self.tables.keys().max().map_or(0, |&id| id + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_table_reports_its_shape() {
        let t = TableMetaData::dense(0, "w", Shape::new(vec![4, 4]), ElementType::F32);
        assert!(t.is_dense());
        assert_eq!(t.dense_shape().unwrap().dims(), &[4, 4]);
        assert_eq!(t.sparse_dimension(), None);
    }

    #[test]
    fn sparse_table_reports_its_dimension() {
        let t = TableMetaData::sparse(0, "emb", 8, ElementType::F32, InitializerSpec::zeros());
        assert!(!t.is_dense());
        assert_eq!(t.sparse_dimension(), Some(8));
    }

    #[test]
    fn model_registers_tables_and_assigns_monotonic_ids() {
        let mut model = ModelMetaData::new(0, "rec", OptimizerSpec::sgd());
        assert_eq!(model.next_table_id(), 0);
        let t0 = TableMetaData::dense(0, "bias", Shape::vector(4), ElementType::F32);
        model.tables.insert(0, t0);
        assert_eq!(model.next_table_id(), 1);
        assert!(model.table_by_name("bias").is_some());
        assert!(model.table_by_name("missing").is_none());
    }

    #[test]
    fn optimizer_spec_flag_defaults() {
        let spec = OptimizerSpec::sgd();
        assert!(!spec.flag_or("amsgrad", false));
        assert_eq!(spec.config_or("lr", 0.1), 0.1);
    }
}
