//! [`PsNode`]: a whole PS process's state — every model it hosts, its
//! current `router_version`, and its status bitmask (§2, §4.5, §4.6).
//!
//! Request-handling methods here are the seam `ps-server`'s request
//! dispatcher calls into; this crate stays transport-free.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};

use ps_data::{DeviceContext, ElementType, InitializerSpec, ModelMetaData, OptimizerSpec, Shape, TableMetaData, Tensor, Value};
use ps_errors::{PsError, PsResult};

use crate::model::ModelShard;
use crate::table::Table;

bitflags! {
    /// A PS node's status bitmask (§2's `Node.status`). More than one flag
    /// can be set at once (e.g. `WORK | TRANSFER` while rebalancing keeps
    /// serving normal traffic on tables not currently transferring).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PsStatus: u8 {
        /// Starting up, not yet registered with the scheduler.
        const INIT     = 0b0000_0001;
        /// Normal operation: serving pushes and pulls.
        const WORK     = 0b0000_0010;
        /// Proxying requests for a key range mid-transfer (reserved for a
        /// future read-through-old-owner mode; unused by the transfer
        /// implementation here, which cuts over atomically at publish).
        const PROXY    = 0b0000_0100;
        /// Streaming reassigned keys to or from another PS (§4.6).
        const TRANSFER = 0b0000_1000;
        /// Persisting shard state to the checkpoint directory (§4.5).
        const SAVE     = 0b0001_0000;
        /// Restoring shard state from the checkpoint directory (§4.5).
        const LOAD     = 0b0010_0000;
    }
}

impl Default for PsStatus {
    fn default() -> Self {
        PsStatus::INIT
    }
}

/// A whole PS process: every model it currently hosts, its router version,
/// and its status.
pub struct PsNode {
    id: u64,
    models: RwLock<HashMap<u64, ModelShard>>,
    router_version: AtomicU64,
    status: Mutex<PsStatus>,
    device: DeviceContext,
}

impl PsNode {
    /// A freshly started PS node, in `Init` status with no models and
    /// router_version 0 (it has not yet received a router from the
    /// scheduler).
    pub fn new(id: u64) -> Self {
        PsNode {
            id,
            models: RwLock::new(HashMap::new()),
            router_version: AtomicU64::new(0),
            status: Mutex::new(PsStatus::INIT),
            device: DeviceContext::cpu(),
        }
    }

    /// This node's id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The router_version this node currently enforces against incoming
    /// data-plane requests.
    pub fn router_version(&self) -> u64 {
        self.router_version.load(Ordering::SeqCst)
    }

    /// Adopt a newly published router_version. Per §3's monotone-version
    /// invariant, a version lower than the current one is rejected rather
    /// than silently ignored — the scheduler is the only legitimate source
    /// of version changes and should never send a stale one.
    pub fn adopt_router_version(&self, version: u64) -> PsResult<()> {
        let current = self.router_version.load(Ordering::SeqCst);
        ps_errors::invariant!(
            version > current,
            "router_version must strictly increase: current={current}, got={version}"
        );
        self.router_version.store(version, Ordering::SeqCst);
        Ok(())
    }

    /// This node's current status bitmask.
    pub fn status(&self) -> PsStatus {
        *self.status.lock()
    }

    /// Set the status bitmask wholesale (used by the scheduler-driven
    /// save/load/transfer state machine).
    pub fn set_status(&self, status: PsStatus) {
        *self.status.lock() = status;
    }

    /// Check a data-plane request's `router_version` against this node's
    /// current one, per §2/§7: a request tagged with an older version is
    /// rejected with `StaleRouterVersion` so the worker refetches and
    /// retries.
    fn check_router_version(&self, request_version: u64) -> PsResult<()> {
        let current = self.router_version.load(Ordering::SeqCst);
        if request_version < current {
            return Err(PsError::StaleRouterVersion {
                request: request_version,
                current,
            });
        }
        Ok(())
    }

    /// Reject pushes while `Save` or `Load` is in progress (§4.5: "PS nodes
    /// reject pushes (pulls still served)"). Transfer does not by itself
    /// block pushes here: ownership cutover is atomic at router publish, so
    /// a push tagged with the old version still lands correctly on this PS
    /// if it's still the owner, and a stale-version push is already
    /// rejected by [`Self::check_router_version`].
    fn check_pushes_allowed(&self) -> PsResult<()> {
        let status = self.status();
        if status.intersects(PsStatus::SAVE | PsStatus::LOAD) {
            return Err(PsError::ClusterBusy(format!("{status:?}")));
        }
        Ok(())
    }

    fn with_model<R>(&self, model_id: u64, f: impl FnOnce(&ModelShard) -> R) -> PsResult<R> {
        self.models
            .read()
            .get(&model_id)
            .map(f)
            .ok_or(PsError::UnknownModel(model_id))
    }

    /// Register a model shard locally — called once per (scheduler
    /// broadcast of) model creation, before any table registration for it.
    /// Idempotent: re-registering the same model id with matching metadata
    /// is a no-op.
    pub fn register_model(&self, meta: ModelMetaData) -> PsResult<()> {
        let mut models = self.models.write();
        if let Some(existing) = models.get(&meta.id) {
            if existing.meta_snapshot().name == meta.name {
                return Ok(());
            }
            return Err(PsError::DuplicateName(meta.name));
        }
        let shard = ModelShard::new(meta, self.device)?;
        models.insert(shard.model_id(), shard);
        Ok(())
    }

    /// `RegisterDenseTable` (§4.1), after `check_router_version` is not
    /// applicable — registration is scheduler-driven, not worker-tagged.
    pub fn register_dense_table(
        &self,
        model_id: u64,
        table_id: u64,
        name: &str,
        shape: Shape,
        element_type: ElementType,
        initial: Value,
    ) -> PsResult<u64> {
        self.with_model(model_id, |m| {
            m.register_dense_table(table_id, name, shape, element_type, initial)
        })?
    }

    /// `RegisterSparseTable` (§4.1).
    pub fn register_sparse_table(
        &self,
        model_id: u64,
        table_id: u64,
        name: &str,
        dimension: usize,
        element_type: ElementType,
        initializer: InitializerSpec,
    ) -> PsResult<u64> {
        self.with_model(model_id, |m| {
            m.register_sparse_table(table_id, name, dimension, element_type, initializer)
        })?
    }

    /// `PullDense` / `CombinePullDenseTable`.
    pub fn pull_dense(&self, router_version: u64, model_id: u64, table_ids: &[u64]) -> PsResult<Vec<Value>> {
        self.check_router_version(router_version)?;
        self.with_model(model_id, |m| m.pull_dense(table_ids))?
    }

    /// `PushDenseTable`.
    pub fn push_dense(
        &self,
        router_version: u64,
        model_id: u64,
        table_id: u64,
        grad: &Tensor,
        lr: f64,
    ) -> PsResult<()> {
        self.check_router_version(router_version)?;
        self.check_pushes_allowed()?;
        self.with_model(model_id, |m| m.push_dense(table_id, grad, lr))?
    }

    /// `CombinePullSparseTable`.
    pub fn pull_sparse(&self, router_version: u64, model_id: u64, table_id: u64, keys: &[u64]) -> PsResult<Vec<Value>> {
        self.check_router_version(router_version)?;
        self.with_model(model_id, |m| m.pull_sparse(table_id, keys))?
    }

    /// `CombinePushSparseTable`: push sub-batches for one or more tables of
    /// one model in a single call, recording each table's aggregate
    /// outcome independently (§4.1, §7).
    pub fn push_sparse_combined(
        &self,
        router_version: u64,
        model_id: u64,
        batches: &[(u64, Vec<u64>, Vec<Tensor>)],
        lr: f64,
    ) -> PsResult<Vec<(u64, usize, usize, Option<String>)>> {
        self.check_router_version(router_version)?;
        self.check_pushes_allowed()?;
        self.with_model(model_id, |m| {
            batches
                .iter()
                .map(|(table_id, keys, grads)| {
                    let (succeeded, failed, first_error) = m.push_sparse_batch(*table_id, keys, grads, lr)?;
                    Ok((*table_id, succeeded, failed, first_error))
                })
                .collect::<PsResult<Vec<_>>>()
        })?
    }

    /// `TryCombineFetchDenseTable`.
    pub fn try_fetch_dense(&self, model_id: u64, table_id: u64) -> PsResult<Option<(String, Value)>> {
        self.with_model(model_id, |m| m.try_fetch_dense(table_id))
    }

    /// `TryFetchSparseValues`.
    pub fn try_fetch_sparse(&self, model_id: u64, table_id: u64, keys: &[u64]) -> PsResult<Option<(Vec<u64>, Vec<Value>)>> {
        self.with_model(model_id, |m| m.try_fetch_sparse(table_id, keys))
    }

    /// `TryFetchSparseMetaData`.
    pub fn try_fetch_sparse_meta(&self, model_id: u64, table_id: u64) -> PsResult<Option<TableMetaData>> {
        self.with_model(model_id, |m| m.try_fetch_sparse_meta(table_id))
    }

    /// The optimizer spec in effect for `model_id`, if the model is hosted
    /// here — used by shard transfer to apply the same optimizer kernel at
    /// the destination (the spec is identical across every shard of a
    /// model, only the physical table rows differ).
    pub fn model_optimizer(&self, model_id: u64) -> PsResult<OptimizerSpec> {
        self.with_model(model_id, ModelShard::optimizer_spec)
    }

    /// Every materialized key of a sparse table this shard hosts — used by
    /// the scheduler to compute which keys a new router reassigns away
    /// from this node, without paying for a full value snapshot.
    pub fn sparse_keys(&self, model_id: u64, table_id: u64) -> PsResult<Vec<u64>> {
        self.with_model(model_id, |m| m.sparse_keys(table_id))?
    }

    /// §4.6, targeted source side: remove exactly the given `keys` from a
    /// sparse table (those the new router reassigns elsewhere), returning
    /// their values for streaming to the destination. Keys that still
    /// belong to this shard are left untouched, unlike
    /// [`Self::drain_sparse_table`] which empties the whole table.
    pub fn drain_sparse_keys(&self, model_id: u64, table_id: u64, keys: &[u64]) -> PsResult<Vec<(u64, Value)>> {
        let drained = self.with_model(model_id, |m| m.drain_sparse_keys(table_id, keys))??;
        metrics::gauge!("ps_shard_transfer_keys_in_flight").increment(drained.len() as f64);
        Ok(drained)
    }

    /// §4.6 step 2/3, source side: drain every materialized entry out of a
    /// sparse table this shard still owns, for streaming to the
    /// destination. Dense tables transfer wholesale via
    /// [`Self::take_dense_table`] instead (one shard owns the entire
    /// table, there's nothing to split).
    pub fn drain_sparse_table(&self, model_id: u64, table_id: u64) -> PsResult<Vec<(u64, Value)>> {
        self.with_model(model_id, |m| {
            m.with_table(table_id, |t| {
                let sparse = t
                    .as_sparse()
                    .ok_or_else(|| PsError::internal(format!("table {table_id} is not sparse")))?;
                let entries = sparse.snapshot();
                for (key, _) in &entries {
                    sparse.remove(*key);
                }
                Ok(entries)
            })
            .ok_or(PsError::UnknownTable(table_id))?
        })?
    }

    /// §4.6, destination side: insert transferred sparse entries into the
    /// local table (registering it first if this is the first entry this
    /// shard has ever owned for that table).
    pub fn receive_sparse_entries(
        &self,
        model_id: u64,
        table_id: u64,
        name: &str,
        dimension: usize,
        element_type: ElementType,
        initializer: InitializerSpec,
        entries: Vec<(u64, Value)>,
    ) -> PsResult<()> {
        let count = entries.len();
        self.with_model(model_id, |m| {
            m.register_sparse_table(table_id, name, dimension, element_type, initializer)?;
            m.with_table(table_id, |t| {
                let sparse = t
                    .as_sparse()
                    .ok_or_else(|| PsError::internal(format!("table {table_id} is not sparse")))?;
                for (key, value) in entries {
                    sparse.restore(key, value);
                }
                Ok(())
            })
            .ok_or(PsError::UnknownTable(table_id))?
        })??;
        metrics::gauge!("ps_shard_transfer_keys_in_flight").decrement(count as f64);
        Ok(())
    }

    /// §4.6, source side for a dense table whose ownership moved wholesale:
    /// fetch its current value for transfer. The table is left registered
    /// on the source (a later router publish simply routes future requests
    /// elsewhere; this matches the "no write is silently lost" guarantee —
    /// a late request against the old owner still hits valid, if stale,
    /// state until it's rejected by the new router_version).
    pub fn take_dense_table(&self, model_id: u64, table_id: u64) -> PsResult<(String, Shape, ElementType, Value)> {
        self.with_model(model_id, |m| {
            m.with_table(table_id, |t| {
                let dense = t
                    .as_dense()
                    .ok_or_else(|| PsError::internal(format!("table {table_id} is not dense")))?;
                let meta = dense.meta();
                let shape = meta
                    .dense_shape()
                    .ok_or_else(|| PsError::internal("dense table metadata lost its shape"))?
                    .clone();
                Ok((meta.name.clone(), shape, meta.element_type, dense.fetch()))
            })
            .ok_or(PsError::UnknownTable(table_id))?
        })?
    }

    /// §4.6, destination side for a dense table transfer.
    pub fn receive_dense_table(
        &self,
        model_id: u64,
        table_id: u64,
        name: &str,
        shape: Shape,
        element_type: ElementType,
        value: Value,
    ) -> PsResult<()> {
        self.with_model(model_id, |m| {
            m.register_dense_table(table_id, name, shape, element_type, value)
        })??;
        Ok(())
    }

    /// Every `(model_id, table_id, &Table)` this node currently hosts, for
    /// save.
    pub fn for_each_table<R>(&self, mut f: impl FnMut(u64, u64, &Table) -> R) -> Vec<R> {
        self.models
            .read()
            .iter()
            .flat_map(|(&model_id, shard)| shard.for_each_table(|table_id, t| f(model_id, table_id, t)))
            .collect()
    }

    /// Every model's metadata currently hosted here, for save.
    pub fn model_metas(&self) -> Vec<ModelMetaData> {
        self.models.read().values().map(ModelShard::meta_snapshot).collect()
    }

    /// `TrySaveModel` (§4.1, §4.5): persist this shard's model metadata and
    /// every table it hosts to `directory`. Callers are responsible for
    /// having already transitioned the node to [`PsStatus::SAVE`] (so
    /// pushes are rejected and in-flight ones have drained) before calling
    /// this — it does not itself touch `status`.
    pub fn save(&self, directory: &std::path::Path) -> PsResult<()> {
        crate::persist::write_model_metas(directory, &self.model_metas())?;
        for result in self.for_each_table(|model_id, table_id, table| -> PsResult<()> {
            match table {
                Table::Dense(dense) => crate::persist::write_dense_table(directory, model_id, table_id, &dense.fetch()),
                Table::Sparse(sparse) => crate::persist::write_sparse_table(directory, model_id, table_id, &sparse.snapshot()),
            }
        }) {
            result?;
        }
        Ok(())
    }

    /// `TryLoadModel` (§4.1, §4.5): restore this shard's models and tables
    /// from `directory`, overwriting anything currently held. Each model is
    /// re-registered (idempotently) before its tables are restored.
    pub fn load(&self, directory: &std::path::Path) -> PsResult<()> {
        let metas = crate::persist::read_model_metas(directory)?;
        for meta in &metas {
            self.register_model(meta.clone())?;
            for table in meta.tables.values() {
                if let Some((shape, element_type)) = crate::persist::dense_shape_and_type(table) {
                    let value = crate::persist::read_dense_table(directory, meta.id, table.id)?;
                    self.receive_dense_table(meta.id, table.id, &table.name, shape, element_type, value)?;
                } else if let Some((dimension, element_type, initializer)) =
                    crate::persist::sparse_dimension_and_initializer(table)
                {
                    let entries = crate::persist::read_sparse_table(directory, meta.id, table.id)?;
                    self.receive_sparse_entries(meta.id, table.id, &table.name, dimension, element_type, initializer, entries)?;
                }
            }
        }
        Ok(())
    }
}
