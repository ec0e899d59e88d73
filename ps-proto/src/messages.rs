//! Request/response payloads for the parameter server RPC surface (§6).
//!
//! Every data-plane message carries a `router_version` the receiving PS
//! checks before doing anything else (`PsError::StaleRouterVersion` if
//! it's behind). Tensors are carried as [`WireTensor`] — `(shape.dims,
//! element_type, raw row-major bytes)`, exactly as the wire format names
//! it, rather than the in-memory `Tensor` (which holds an `Arc<RwLock<_>>`
//! that has no business going over the wire).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use ps_data::{ElementType, InitializerSpec, OptimizerSpec, Shape, Tensor, Value};
use ps_errors::{PsError, PsResult};

/// The wire representation of a [`Tensor`]: shape, element type, and raw
/// row-major element bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTensor {
    /// The tensor's shape.
    pub dims: Vec<usize>,
    /// The tensor's element type.
    pub element_type: ElementType,
    /// Raw little-endian element bytes in row-major order.
    pub bytes: Vec<u8>,
}

impl From<&Tensor> for WireTensor {
    fn from(t: &Tensor) -> Self {
        WireTensor {
            dims: t.shape().dims().to_vec(),
            element_type: t.element_type(),
            bytes: t.raw_bytes(),
        }
    }
}

impl TryFrom<&WireTensor> for Tensor {
    type Error = PsError;

    fn try_from(w: &WireTensor) -> PsResult<Self> {
        Tensor::from_raw_bytes(Shape::new(w.dims.clone()), w.element_type, &w.bytes)
    }
}

/// The wire representation of a [`Value`]: a parameter tensor plus its
/// allocated auxiliary state, keyed by [`ps_data::StateTag`] (serialized
/// as `u32` per the wire format's enum-tag rule).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireValue {
    /// The parameter tensor.
    pub tensor: WireTensor,
    /// Allocated auxiliary state tensors, keyed by tag.
    pub states: Vec<(ps_data::StateTag, WireTensor)>,
    /// Allocated scalar state (e.g. Adam's step counter), keyed by tag
    /// (see [`Value::scalar`]).
    pub scalars: Vec<(ps_data::StateTag, i64)>,
}

impl WireValue {
    /// Encode a [`Value`] for the wire.
    pub fn from_value(v: &Value) -> Self {
        WireValue {
            tensor: WireTensor::from(v.tensor()),
            states: ps_data::StateTag::ALL
                .iter()
                .filter_map(|&tag| v.state(tag).map(|t| (tag, WireTensor::from(t))))
                .collect(),
            scalars: ps_data::StateTag::ALL
                .iter()
                .filter_map(|&tag| {
                    let s = v.scalar(tag);
                    (s != 0).then_some((tag, s))
                })
                .collect(),
        }
    }

    /// Decode a [`Value`] from the wire, allocating state tensors as named.
    pub fn to_value(&self) -> PsResult<Value> {
        let tensor = Tensor::try_from(&self.tensor)?;
        let mut value = Value::new(tensor);
        for (tag, wire_state) in &self.states {
            let state_tensor = Tensor::try_from(wire_state)?;
            *value.state_or_init(*tag, &ps_data::DeviceContext::cpu()) = state_tensor;
        }
        for (tag, scalar) in &self.scalars {
            value.set_scalar(*tag, *scalar);
        }
        Ok(value)
    }
}

/// `ApplyModelId {name} -> {model_id}`.
pub mod apply_model_id {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Request {
        pub name: String,
        /// The optimizer to create the model with, if this caller turns out
        /// to be the first to apply this name (§4.5: "the first caller...
        /// creates the model (with `optimizer`)"). Ignored by the scheduler
        /// when the name already exists.
        pub optimizer: OptimizerSpec,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Response {
        pub model_id: u64,
    }
}

/// `RegisterPs {address} -> {ps_id}`: a PS node's own registration call to
/// the scheduler on startup (§2, §4.5).
pub mod register_ps {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Request {
        pub address: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Response {
        pub ps_id: u64,
    }
}

/// `RegisterWorker {address} -> {worker_id}`: a worker's registration call
/// to the scheduler on startup (§2).
pub mod register_worker {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Request {
        pub address: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Response {
        pub worker_id: u64,
    }
}

/// `FetchRouter -> RouterSnapshot`: the call a worker (or a PS, on
/// restart) makes to obtain the scheduler's currently published router
/// (§4.4 point 1, §4.3).
pub mod fetch_router {
    use super::*;
    use crate::RouterSnapshot;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Request;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Response {
        pub snapshot: RouterSnapshot,
    }
}

/// `ApplyDenseTable {model_id, name, shape, etype} -> {table_id}`.
pub mod apply_dense_table {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Request {
        pub model_id: u64,
        pub name: String,
        pub dims: Vec<usize>,
        pub element_type: ElementType,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Response {
        pub table_id: u64,
    }
}

/// `ApplySparseTable {model_id, name, dimension, etype, init_type, init_conf} -> {table_id}`.
pub mod apply_sparse_table {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Request {
        pub model_id: u64,
        pub name: String,
        pub dimension: usize,
        pub element_type: ElementType,
        pub initializer: InitializerSpec,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Response {
        pub table_id: u64,
    }
}

/// `PullDenseTable` / `CombinePullDenseTable {model_id, table_ids[]} -> {tensors[]}`.
pub mod pull_dense {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Request {
        pub router_version: u64,
        pub model_id: u64,
        pub table_ids: Vec<u64>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Response {
        pub tensors: Vec<WireTensor>,
    }
}

/// `PushDenseTable {model_id, table_id, grad, lr} -> ()`.
pub mod push_dense {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Request {
        pub router_version: u64,
        pub model_id: u64,
        pub table_id: u64,
        pub grad: WireTensor,
        pub lr: f64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Response;
}

/// `CombinePullSparseTable {model_id, table_id, keys[]} -> {values[]}`.
pub mod pull_sparse {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Request {
        pub router_version: u64,
        pub model_id: u64,
        pub table_id: u64,
        pub keys: Vec<u64>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Response {
        pub values: Vec<WireValue>,
    }
}

/// `CombinePushSparseTable {version, map{table_id -> (keys, grads)}, lr} -> ()`.
///
/// One request can carry pushes for several tables in a single RPC; the PS
/// applies each table's sub-batch independently and does not roll back
/// earlier sub-batches if a later one fails (§7, combined-request handling).
pub mod push_sparse {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct TableBatch {
        pub table_id: u64,
        pub keys: Vec<u64>,
        pub grads: Vec<WireTensor>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Request {
        pub router_version: u64,
        pub model_id: u64,
        pub batches: Vec<TableBatch>,
        pub lr: f64,
    }

    /// Per-table-batch outcome: how many of that batch's keys applied
    /// cleanly, and the first error encountered (if any), per the
    /// aggregate-status handling §7 requires for combined requests.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct TableOutcome {
        pub table_id: u64,
        pub succeeded: usize,
        pub failed: usize,
        pub first_error: Option<String>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Response {
        pub outcomes: Vec<TableOutcome>,
    }
}

/// `TryCombineFetchDenseTable {table_id} -> Option<(name, Value)>`.
pub mod try_fetch_dense {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Request {
        pub model_id: u64,
        pub table_id: u64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Response {
        pub found: Option<(String, WireValue)>,
    }
}

/// `TryFetchSparseValues {model_id, table_id, keys[]} -> {existing keys[], values[]}`.
pub mod try_fetch_sparse {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Request {
        pub model_id: u64,
        pub table_id: u64,
        pub keys: Vec<u64>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Response {
        pub keys: Vec<u64>,
        pub values: Vec<WireValue>,
    }
}

/// `TryFetchSparseMetaData {model_id, table_id} -> Option<TableMetaData>`.
pub mod try_fetch_sparse_meta {
    use super::*;
    use ps_data::TableMetaData;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Request {
        pub model_id: u64,
        pub table_id: u64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Response {
        pub meta: Option<TableMetaData>,
    }
}

/// `RegisterModel {meta} -> ()` (scheduler -> PS): push a newly created
/// model's metadata to a shard, before any of its tables are registered.
/// Idempotent on repeated delivery of the same `(id, name)`.
pub mod register_model {
    use super::*;
    use ps_data::ModelMetaData;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Request {
        pub meta: ModelMetaData,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Response;
}

/// `RegisterDenseTable {model_id, name, shape, etype, initial} -> {table_id}`
/// (scheduler -> PS): the scheduler has already assigned `table_id` via
/// `ApplyDenseTable`; this is the propagation step that actually
/// materializes storage on the owning shard. Idempotent on repeated
/// delivery of the same (name, shape, etype).
pub mod register_dense_table {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Request {
        pub model_id: u64,
        pub table_id: u64,
        pub name: String,
        pub dims: Vec<usize>,
        pub element_type: ElementType,
        pub initial: WireValue,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Response {
        pub table_id: u64,
    }
}

/// `RegisterSparseTable {model_id, name, dimension, etype, init spec} -> {table_id}`
/// (scheduler -> PS), the sparse counterpart of `register_dense_table`.
pub mod register_sparse_table {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Request {
        pub model_id: u64,
        pub table_id: u64,
        pub name: String,
        pub dimension: usize,
        pub element_type: ElementType,
        pub initializer: InitializerSpec,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Response {
        pub table_id: u64,
    }
}

/// `TransferDenseTable {model_id, table_id, value} -> ()` (source PS ->
/// destination PS, scheduler-orchestrated §4.6): ships a whole dense
/// table's value to its new owner.
pub mod transfer_dense {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Request {
        pub model_id: u64,
        pub table_id: u64,
        pub name: String,
        pub dims: Vec<usize>,
        pub element_type: ElementType,
        pub value: WireValue,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Response;
}

/// `TakeDenseTable {model_id, table_id} -> {name, dims, etype, value}`
/// (scheduler -> source PS, §4.6): fetch a dense table's current value
/// ahead of shipping it to its new owner via `transfer_dense`.
pub mod take_dense_table {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Request {
        pub model_id: u64,
        pub table_id: u64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Response {
        pub name: String,
        pub dims: Vec<usize>,
        pub element_type: ElementType,
        pub value: WireValue,
    }
}

/// `TransferSparseEntries {model_id, table_id, name, dimension, etype,
/// initializer, entries[]} -> ()` (source PS -> destination PS, §4.6):
/// ships a batch of reassigned `(key, Value)` rows, carrying enough of the
/// table's metadata for the destination to materialize it the first time
/// it receives any entry for a table it didn't previously host. A table
/// transfer is one or more of these calls followed by the scheduler's
/// router_version publish.
pub mod transfer_sparse {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Request {
        pub model_id: u64,
        pub table_id: u64,
        pub name: String,
        pub dimension: usize,
        pub element_type: ElementType,
        pub initializer: InitializerSpec,
        pub entries: Vec<(u64, WireValue)>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Response;
}

/// `SparseKeys {model_id, table_id} -> {keys[]}` (scheduler -> PS, §4.6):
/// every materialized key of a sparse table this shard hosts, used to
/// compute which keys a new router reassigns away from this node.
pub mod sparse_keys {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Request {
        pub model_id: u64,
        pub table_id: u64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Response {
        pub keys: Vec<u64>,
    }
}

/// `DrainSparseKeys {model_id, table_id, keys[]} -> {entries[]}` (scheduler
/// -> source PS, §4.6): remove exactly the given keys from a sparse table,
/// returning their values for the scheduler to forward to the destination.
pub mod drain_sparse_keys {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Request {
        pub model_id: u64,
        pub table_id: u64,
        pub keys: Vec<u64>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Response {
        pub entries: Vec<(u64, WireValue)>,
    }
}

/// `AdoptRouterVersion {version} -> ()` (scheduler -> PS, §2, §4.3): a
/// newly published router_version this node must enforce from now on.
pub mod adopt_router_version {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Request {
        pub version: u64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Response;
}

/// `SetStatus {status} -> ()` (scheduler -> PS): set this node's status
/// bitmask wholesale, driving the `Transfer`/`Save`/`Load` state machine.
/// `status` is the raw bitmask byte rather than `ps_store::PsStatus`
/// itself — `ps-store` already depends on this crate (for `WireValue` in
/// its persistence format), so the dependency can't run the other way;
/// `ps-server` converts to/from `ps_store::PsStatus::from_bits_truncate`
/// at the one seam that needs both crates.
pub mod set_status {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Request {
        pub status_bits: u8,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Response;
}

/// `NotifySaveModel` / `NotifyLoadModel {directory} -> ()` (scheduler -> PS).
pub mod notify_persist {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Request {
        pub directory: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Response;
}

/// `TrySaveModel` / `TryLoadModel {directory} -> {success}` (worker -> scheduler).
pub mod try_persist {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Request {
        pub model_id: u64,
        pub directory: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Response {
        pub success: bool,
    }
}

/// `IsAllPsWorking -> {yes}`.
pub mod is_all_ps_working {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Request;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Response {
        pub yes: bool,
    }
}

/// The optimizer a model is registered with, as carried by scheduler
/// broadcasts when it creates a `ModelMetaData` — re-exported here so
/// proto call sites don't need to depend on `ps-data` for this one type.
pub type ModelOptimizer = OptimizerSpec;

/// A router snapshot as broadcast by the scheduler: the membership list a
/// PS or worker needs to reconstruct the consistent-hash ring locally.
/// `ps-router` owns ring construction; this is just its wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterSnapshot {
    pub version: u64,
    pub ps_ids: Vec<u64>,
    pub ps_addresses: HashMap<u64, String>,
}
