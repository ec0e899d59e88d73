//! [`PsRpc`]: the seam between the scheduler's orchestration logic and
//! whatever transport actually reaches a PS node. This crate never opens a
//! socket — `ps-server` implements [`PsRpc`] concretely over the
//! length-prefixed `bincode`/`tokio` transport (§6); tests here implement
//! it directly against an in-process [`ps_store::PsNode`] so the
//! orchestration logic (join, save, load, shard transfer) is exercised
//! without any networking.

use async_trait::async_trait;

use ps_data::{ElementType, InitializerSpec, ModelMetaData, Shape, Value};
use ps_errors::PsResult;
use ps_store::PsStatus;

/// Everything the scheduler needs to instruct a single PS node to do, as
/// an RPC-shaped async trait. One call = one request/response pair from
/// §6's RPC surface (the scheduler-to-PS half of it; worker-to-PS calls
/// are `ps-worker`'s concern).
#[async_trait]
pub trait PsRpc: Send + Sync {
    /// Push a newly created model's metadata to `ps_id` (idempotent).
    async fn register_model(&self, ps_id: u64, meta: ModelMetaData) -> PsResult<()>;

    /// `RegisterDenseTable` (scheduler -> PS).
    #[allow(clippy::too_many_arguments)]
    async fn register_dense_table(
        &self,
        ps_id: u64,
        model_id: u64,
        table_id: u64,
        name: String,
        shape: Shape,
        element_type: ElementType,
        initial: Value,
    ) -> PsResult<()>;

    /// `RegisterSparseTable` (scheduler -> PS).
    #[allow(clippy::too_many_arguments)]
    async fn register_sparse_table(
        &self,
        ps_id: u64,
        model_id: u64,
        table_id: u64,
        name: String,
        dimension: usize,
        element_type: ElementType,
        initializer: InitializerSpec,
    ) -> PsResult<()>;

    /// Adopt a newly published router_version on `ps_id` (§2, §4.3).
    async fn adopt_router_version(&self, ps_id: u64, version: u64) -> PsResult<()>;

    /// Set `ps_id`'s status bitmask (used to drive `Transfer`/`Save`/`Load`
    /// and back to `Work`).
    async fn set_status(&self, ps_id: u64, status: PsStatus) -> PsResult<()>;

    /// Every materialized key of a sparse table on `ps_id`, for shard
    /// transfer planning (§4.6).
    async fn sparse_keys(&self, ps_id: u64, model_id: u64, table_id: u64) -> PsResult<Vec<u64>>;

    /// Drain exactly `keys` from a sparse table on `ps_id` (the source side
    /// of a targeted shard transfer).
    async fn drain_sparse_keys(&self, ps_id: u64, model_id: u64, table_id: u64, keys: Vec<u64>) -> PsResult<Vec<(u64, Value)>>;

    /// Insert transferred sparse entries into `ps_id`'s local store (the
    /// destination side).
    #[allow(clippy::too_many_arguments)]
    async fn receive_sparse_entries(
        &self,
        ps_id: u64,
        model_id: u64,
        table_id: u64,
        name: String,
        dimension: usize,
        element_type: ElementType,
        initializer: InitializerSpec,
        entries: Vec<(u64, Value)>,
    ) -> PsResult<()>;

    /// Fetch a dense table's value from its current owner for a whole-table
    /// transfer (§4.6).
    async fn take_dense_table(&self, ps_id: u64, model_id: u64, table_id: u64) -> PsResult<(String, Shape, ElementType, Value)>;

    /// Install a transferred dense table on the destination.
    #[allow(clippy::too_many_arguments)]
    async fn receive_dense_table(
        &self,
        ps_id: u64,
        model_id: u64,
        table_id: u64,
        name: String,
        shape: Shape,
        element_type: ElementType,
        value: Value,
    ) -> PsResult<()>;

    /// `NotifySaveModel` / `NotifyLoadModel` (§4.5, §6): instruct `ps_id` to
    /// persist/restore its shard to/from `directory`.
    async fn notify_save(&self, ps_id: u64, directory: String) -> PsResult<()>;

    /// See [`Self::notify_save`].
    async fn notify_load(&self, ps_id: u64, directory: String) -> PsResult<()>;
}
