//! Checkpoint file layout (§6, "Persisted state layout"): one directory per
//! shard, holding a `model-meta` file plus one file per dense table and one
//! per sparse table, each beginning with a magic + version header. Tables
//! serialize via [`ps_proto::messages::WireValue`] — the same wire-safe
//! representation used on the network — rather than teaching this crate a
//! second encoding for `Value`.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use ps_data::{ElementType, InitializerSpec, ModelMetaData, Shape, Value};
use ps_errors::{PsError, PsResult};
use ps_proto::messages::WireValue;

const MAGIC: [u8; 4] = *b"PSCK";
const FORMAT_VERSION: u32 = 1;

fn io(e: impl std::fmt::Display) -> PsError {
    PsError::IoError(e.to_string())
}

fn write_framed<T: Serialize>(path: &Path, value: &T) -> PsResult<()> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bincode::serialize_into(&mut buf, value).map_err(io)?;
    fs::write(path, buf).map_err(io)
}

fn read_framed<T: for<'de> Deserialize<'de>>(path: &Path) -> PsResult<T> {
    let bytes = fs::read(path).map_err(io)?;
    if bytes.len() < 8 || bytes[0..4] != MAGIC {
        return Err(PsError::IoError(format!("{}: bad checkpoint file header", path.display())));
    }
    let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(PsError::IoError(format!(
            "{}: unsupported checkpoint format version {version}",
            path.display()
        )));
    }
    bincode::deserialize(&bytes[8..]).map_err(io)
}

fn model_meta_path(dir: &Path) -> std::path::PathBuf {
    dir.join("model-meta")
}

fn dense_table_path(dir: &Path, model_id: u64, table_id: u64) -> std::path::PathBuf {
    dir.join(format!("dense-{model_id}-{table_id}"))
}

fn sparse_table_path(dir: &Path, model_id: u64, table_id: u64) -> std::path::PathBuf {
    dir.join(format!("sparse-{model_id}-{table_id}"))
}

/// Write every hosted model's metadata to `dir/model-meta`, creating `dir`
/// if absent.
pub fn write_model_metas(dir: &Path, metas: &[ModelMetaData]) -> PsResult<()> {
    fs::create_dir_all(dir).map_err(io)?;
    write_framed(&model_meta_path(dir), &metas.to_vec())
}

/// Read back every model's metadata from `dir/model-meta`.
pub fn read_model_metas(dir: &Path) -> PsResult<Vec<ModelMetaData>> {
    read_framed(&model_meta_path(dir))
}

/// Write one dense table's value to `dir/dense-{model_id}-{table_id}`.
pub fn write_dense_table(dir: &Path, model_id: u64, table_id: u64, value: &Value) -> PsResult<()> {
    fs::create_dir_all(dir).map_err(io)?;
    write_framed(&dense_table_path(dir, model_id, table_id), &WireValue::from_value(value))
}

/// Read back one dense table's value.
pub fn read_dense_table(dir: &Path, model_id: u64, table_id: u64) -> PsResult<Value> {
    let wire: WireValue = read_framed(&dense_table_path(dir, model_id, table_id))?;
    wire.to_value()
}

/// Write one sparse table's materialized entries to
/// `dir/sparse-{model_id}-{table_id}`.
pub fn write_sparse_table(dir: &Path, model_id: u64, table_id: u64, entries: &[(u64, Value)]) -> PsResult<()> {
    fs::create_dir_all(dir).map_err(io)?;
    let wire: Vec<(u64, WireValue)> = entries.iter().map(|(k, v)| (*k, WireValue::from_value(v))).collect();
    write_framed(&sparse_table_path(dir, model_id, table_id), &wire)
}

/// Read back one sparse table's materialized entries.
pub fn read_sparse_table(dir: &Path, model_id: u64, table_id: u64) -> PsResult<Vec<(u64, Value)>> {
    let wire: Vec<(u64, WireValue)> = read_framed(&sparse_table_path(dir, model_id, table_id))?;
    wire.into_iter().map(|(k, v)| Ok((k, v.to_value()?))).collect()
}

/// Whether sparse table metadata names an initializer (used to distinguish
/// dense/sparse on load, mirroring [`ps_data::TableKind`]).
pub fn sparse_dimension_and_initializer(meta: &ps_data::TableMetaData) -> Option<(usize, ElementType, InitializerSpec)> {
    match &meta.kind {
        ps_data::TableKind::Sparse { dimension, initializer } => Some((*dimension, meta.element_type, initializer.clone())),
        ps_data::TableKind::Dense { .. } => None,
    }
}

/// The dense shape, if `meta` describes a dense table.
pub fn dense_shape_and_type(meta: &ps_data::TableMetaData) -> Option<(Shape, ElementType)> {
    meta.dense_shape().map(|s| (s.clone(), meta.element_type))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ps_data::{DeviceContext, ElementType, OptimizerSpec, Shape, Tensor};

    #[test]
    fn model_meta_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let metas = vec![ModelMetaData::new(0, "m", OptimizerSpec::sgd())];
        write_model_metas(dir.path(), &metas).unwrap();
        let back = read_model_metas(dir.path()).unwrap();
        assert_eq!(back, metas);
    }

    #[test]
    fn dense_table_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let value = Value::new(Tensor::from_f64_slice(Shape::vector(4), ElementType::F32, &[0.9; 4]).unwrap());
        write_dense_table(dir.path(), 0, 0, &value).unwrap();
        let back = read_dense_table(dir.path(), 0, 0).unwrap();
        assert_eq!(back.tensor().as_f64_vec().unwrap(), value.tensor().as_f64_vec().unwrap());
    }

    #[test]
    fn sparse_table_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let v1 = Value::new(Tensor::zeros(Shape::vector(2), ElementType::F32, &DeviceContext::cpu()));
        let v2 = Value::new(Tensor::from_f64_slice(Shape::vector(2), ElementType::F32, &[1.0, 2.0]).unwrap());
        let entries = vec![(1u64, v1), (2u64, v2)];
        write_sparse_table(dir.path(), 0, 0, &entries).unwrap();
        let back = read_sparse_table(dir.path(), 0, 0).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[1].1.tensor().as_f64_vec().unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn corrupt_header_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path()).unwrap();
        let path = model_meta_path(dir.path());
        fs::write(&path, b"not a checkpoint").unwrap();
        assert!(read_model_metas(dir.path()).is_err());
    }
}
