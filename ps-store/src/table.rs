//! [`Table`]: a dense or sparse table, as held in a [`crate::model::ModelStore`]'s
//! `tables: table_id -> Table` map (§4.1).

use ps_data::TableMetaData;

use crate::dense::DenseTable;
use crate::sparse::SparseTable;

/// Either kind of table a model can register. Dispatch between the two
/// variants happens at the handful of call sites that need to know which
/// kind they have (push/pull); metadata access is uniform.
pub enum Table {
    /// A dense (single-value) table.
    Dense(DenseTable),
    /// A sparse (key-indexed) table.
    Sparse(SparseTable),
}

impl Table {
    /// This table's metadata, regardless of kind.
    pub fn meta(&self) -> &TableMetaData {
        match self {
            Table::Dense(t) => t.meta(),
            Table::Sparse(t) => t.meta(),
        }
    }

    /// The dense table, if this is one.
    pub fn as_dense(&self) -> Option<&DenseTable> {
        match self {
            Table::Dense(t) => Some(t),
            Table::Sparse(_) => None,
        }
    }

    /// The sparse table, if this is one.
    pub fn as_sparse(&self) -> Option<&SparseTable> {
        match self {
            Table::Sparse(t) => Some(t),
            Table::Dense(_) => None,
        }
    }
}
