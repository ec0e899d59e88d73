//! [`NetworkPsRpc`]: [`ps_scheduler::PsRpc`] implemented over real TCP
//! sockets. The scheduler itself never learns a PS's address beyond what
//! it already tracks in its own node registry; this type resolves `ps_id`
//! to an address by reading that same registry back through a
//! [`Scheduler`] handle bound in after construction (the two types are
//! mutually referential — the scheduler is generic over this trait, this
//! trait needs the scheduler it serves — so the back-reference is a
//! [`Weak`] filled in once by [`Self::bind_scheduler`] right after both are
//! built).

use std::sync::{OnceLock, Weak};

use async_trait::async_trait;

use ps_data::{ElementType, InitializerSpec, ModelMetaData, Shape, Value};
use ps_errors::{PsError, PsResult};
use ps_proto::messages::{
    adopt_router_version, drain_sparse_keys, notify_persist, register_dense_table, register_model, register_sparse_table, set_status,
    sparse_keys, take_dense_table, transfer_dense, transfer_sparse, WireValue,
};
use ps_proto::{Request, Response};
use ps_scheduler::{PsRpc, Scheduler};
use ps_store::PsStatus;

use crate::connection::ConnectionPool;

/// The scheduler's outbound control-plane client, dialing one persistent
/// connection per PS.
pub struct NetworkPsRpc {
    pool: ConnectionPool,
    scheduler: OnceLock<Weak<Scheduler<NetworkPsRpc>>>,
}

impl Default for NetworkPsRpc {
    fn default() -> Self {
        NetworkPsRpc {
            pool: ConnectionPool::new(),
            scheduler: OnceLock::new(),
        }
    }
}

impl NetworkPsRpc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the scheduler this RPC client resolves addresses through. Must
    /// be called once, immediately after constructing the `Arc<Scheduler>`
    /// this `NetworkPsRpc` was handed to, and before the scheduler accepts
    /// any PS join (address resolution fails until this is set).
    pub fn bind_scheduler(&self, scheduler: &std::sync::Arc<Scheduler<NetworkPsRpc>>) {
        let _ = self.scheduler.set(std::sync::Arc::downgrade(scheduler));
    }

    fn address(&self, ps_id: u64) -> PsResult<String> {
        let scheduler = self
            .scheduler
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| PsError::internal("NetworkPsRpc used before a scheduler was bound"))?;
        scheduler
            .ps_addresses()
            .get(&ps_id)
            .cloned()
            .ok_or_else(|| PsError::NodeUnreachable(format!("no known address for ps {ps_id}")))
    }

    async fn call(&self, ps_id: u64, request: Request) -> PsResult<Response> {
        let address = self.address(ps_id)?;
        self.pool.call(&address, request).await
    }
}

/// Unwrap a `Response::Error` or a mismatched variant into a `PsError`.
fn unexpected(response: Response) -> PsError {
    match response {
        Response::Error(e) => e,
        other => PsError::internal(format!("unexpected response variant: {other:?}")),
    }
}

#[async_trait]
impl PsRpc for NetworkPsRpc {
    async fn register_model(&self, ps_id: u64, meta: ModelMetaData) -> PsResult<()> {
        match self.call(ps_id, Request::RegisterModel(register_model::Request { meta })).await? {
            Response::RegisterModel(_) => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn register_dense_table(
        &self,
        ps_id: u64,
        model_id: u64,
        table_id: u64,
        name: String,
        shape: Shape,
        element_type: ElementType,
        initial: Value,
    ) -> PsResult<()> {
        let request = register_dense_table::Request {
            model_id,
            table_id,
            name,
            dims: shape.dims().to_vec(),
            element_type,
            initial: WireValue::from_value(&initial),
        };
        match self.call(ps_id, Request::RegisterDenseTable(request)).await? {
            Response::RegisterDenseTable(_) => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn register_sparse_table(
        &self,
        ps_id: u64,
        model_id: u64,
        table_id: u64,
        name: String,
        dimension: usize,
        element_type: ElementType,
        initializer: InitializerSpec,
    ) -> PsResult<()> {
        let request = register_sparse_table::Request {
            model_id,
            table_id,
            name,
            dimension,
            element_type,
            initializer,
        };
        match self.call(ps_id, Request::RegisterSparseTable(request)).await? {
            Response::RegisterSparseTable(_) => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn adopt_router_version(&self, ps_id: u64, version: u64) -> PsResult<()> {
        match self.call(ps_id, Request::AdoptRouterVersion(adopt_router_version::Request { version })).await? {
            Response::AdoptRouterVersion(_) => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn set_status(&self, ps_id: u64, status: PsStatus) -> PsResult<()> {
        let request = set_status::Request { status_bits: status.bits() };
        match self.call(ps_id, Request::SetStatus(request)).await? {
            Response::SetStatus(_) => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn sparse_keys(&self, ps_id: u64, model_id: u64, table_id: u64) -> PsResult<Vec<u64>> {
        match self.call(ps_id, Request::SparseKeys(sparse_keys::Request { model_id, table_id })).await? {
            Response::SparseKeys(r) => Ok(r.keys),
            other => Err(unexpected(other)),
        }
    }

    async fn drain_sparse_keys(&self, ps_id: u64, model_id: u64, table_id: u64, keys: Vec<u64>) -> PsResult<Vec<(u64, Value)>> {
        let request = drain_sparse_keys::Request { model_id, table_id, keys };
        match self.call(ps_id, Request::DrainSparseKeys(request)).await? {
            Response::DrainSparseKeys(r) => r.entries.into_iter().map(|(k, v)| Ok((k, v.to_value()?))).collect(),
            other => Err(unexpected(other)),
        }
    }

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
    ) -> PsResult<()> {
        let entries = entries.into_iter().map(|(k, v)| (k, WireValue::from_value(&v))).collect();
        let request = transfer_sparse::Request {
            model_id,
            table_id,
            name,
            dimension,
            element_type,
            initializer,
            entries,
        };
        match self.call(ps_id, Request::TransferSparse(request)).await? {
            Response::TransferSparse(_) => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn take_dense_table(&self, ps_id: u64, model_id: u64, table_id: u64) -> PsResult<(String, Shape, ElementType, Value)> {
        let request = take_dense_table::Request { model_id, table_id };
        match self.call(ps_id, Request::TakeDenseTable(request)).await? {
            Response::TakeDenseTable(r) => Ok((r.name, Shape::new(r.dims), r.element_type, r.value.to_value()?)),
            other => Err(unexpected(other)),
        }
    }

    async fn receive_dense_table(
        &self,
        ps_id: u64,
        model_id: u64,
        table_id: u64,
        name: String,
        shape: Shape,
        element_type: ElementType,
        value: Value,
    ) -> PsResult<()> {
        let request = transfer_dense::Request {
            model_id,
            table_id,
            name,
            dims: shape.dims().to_vec(),
            element_type,
            value: WireValue::from_value(&value),
        };
        match self.call(ps_id, Request::TransferDense(request)).await? {
            Response::TransferDense(_) => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn notify_save(&self, ps_id: u64, directory: String) -> PsResult<()> {
        match self.call(ps_id, Request::NotifySaveModel(notify_persist::Request { directory })).await? {
            Response::NotifySaveModel(_) => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn notify_load(&self, ps_id: u64, directory: String) -> PsResult<()> {
        match self.call(ps_id, Request::NotifyLoadModel(notify_persist::Request { directory })).await? {
            Response::NotifyLoadModel(_) => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}
