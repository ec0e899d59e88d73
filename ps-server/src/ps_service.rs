//! [`PsService`]: the PS-side request dispatcher, translating every
//! [`Request`] a PS node can receive into a call against [`PsNode`] and the
//! matching [`Response`]. Shard-transfer streaming and checkpoint I/O
//! (§5, §9's "native threads" commitment) run on the node's
//! [`AsyncTaskQueue`] rather than the `tokio` runtime thread handling the
//! connection; everything else (the hot push/pull/try-fetch path) runs
//! directly, matching how `ps_store::PsNode`'s own methods are already
//! just in-memory locking, not I/O.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, instrument, warn};

use ps_errors::PsResult;
use ps_proto::messages::{
    drain_sparse_keys, notify_persist, pull_dense, pull_sparse, push_dense, push_sparse, register_dense_table, register_model,
    register_sparse_table, set_status, sparse_keys, take_dense_table, transfer_dense, transfer_sparse, try_fetch_dense,
    try_fetch_sparse, try_fetch_sparse_meta, WireTensor, WireValue,
};
use ps_proto::{adopt_router_version, Request, Response};
use ps_store::{AsyncTaskQueue, PsNode, PsStatus};

use crate::connection::{recv_request, send_response};

/// A PS node's request dispatcher plus the task queue its shard-transfer
/// and persistence handlers offload onto.
pub struct PsService {
    node: Arc<PsNode>,
    queue: Arc<AsyncTaskQueue>,
}

impl PsService {
    pub fn new(node: Arc<PsNode>, queue: Arc<AsyncTaskQueue>) -> Self {
        PsService { node, queue }
    }

    /// Run a closure that touches shard storage on the task queue's native
    /// threads rather than the calling `tokio` task, returning its result
    /// once the worker has finished.
    async fn offload<T: Send + 'static>(&self, f: impl FnOnce() -> T + Send + 'static) -> T {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.queue.enqueue(move || {
            let _ = tx.send(f());
        });
        rx.await.expect("task queue worker dropped its result sender")
    }

    /// Dispatch one request to completion, never panicking: every
    /// fallible path is turned into `Response::Error`.
    #[instrument(skip(self, request))]
    pub async fn handle(&self, request: Request) -> Response {
        match self.handle_inner(request).await {
            Ok(response) => response,
            Err(e) => Response::Error(e),
        }
    }

    async fn handle_inner(&self, request: Request) -> PsResult<Response> {
        match request {
            Request::RegisterModel(register_model::Request { meta }) => {
                self.node.register_model(meta)?;
                Ok(Response::RegisterModel(register_model::Response))
            }

            Request::RegisterDenseTable(req) => {
                let table_id = self.node.register_dense_table(
                    req.model_id,
                    req.table_id,
                    &req.name,
                    ps_data::Shape::new(req.dims),
                    req.element_type,
                    req.initial.to_value()?,
                )?;
                Ok(Response::RegisterDenseTable(register_dense_table::Response { table_id }))
            }

            Request::RegisterSparseTable(req) => {
                let table_id = self.node.register_sparse_table(
                    req.model_id,
                    req.table_id,
                    &req.name,
                    req.dimension,
                    req.element_type,
                    req.initializer,
                )?;
                Ok(Response::RegisterSparseTable(register_sparse_table::Response { table_id }))
            }

            Request::AdoptRouterVersion(adopt_router_version::Request { version }) => {
                self.node.adopt_router_version(version)?;
                Ok(Response::AdoptRouterVersion(adopt_router_version::Response))
            }

            Request::SetStatus(req) => {
                self.node.set_status(PsStatus::from_bits_truncate(req.status_bits));
                Ok(Response::SetStatus(set_status::Response))
            }

            Request::PullDense(req) => {
                let values = self.node.pull_dense(req.router_version, req.model_id, &req.table_ids)?;
                let tensors = values.iter().map(|v| WireTensor::from(v.tensor())).collect();
                Ok(Response::PullDense(pull_dense::Response { tensors }))
            }

            Request::PushDense(req) => {
                let grad = ps_data::Tensor::try_from(&req.grad)?;
                self.node.push_dense(req.router_version, req.model_id, req.table_id, &grad, req.lr)?;
                Ok(Response::PushDense(push_dense::Response))
            }

            Request::PullSparse(req) => {
                let values = self.node.pull_sparse(req.router_version, req.model_id, req.table_id, &req.keys)?;
                let values = values.iter().map(WireValue::from_value).collect();
                Ok(Response::PullSparse(pull_sparse::Response { values }))
            }

            Request::PushSparse(req) => {
                let mut batches = Vec::with_capacity(req.batches.len());
                for b in &req.batches {
                    let grads: PsResult<Vec<_>> = b.grads.iter().map(ps_data::Tensor::try_from).collect();
                    batches.push((b.table_id, b.keys.clone(), grads?));
                }
                let outcomes = self.node.push_sparse_combined(req.router_version, req.model_id, &batches, req.lr)?;
                let outcomes = outcomes
                    .into_iter()
                    .map(|(table_id, succeeded, failed, first_error)| push_sparse::TableOutcome {
                        table_id,
                        succeeded,
                        failed,
                        first_error,
                    })
                    .collect();
                Ok(Response::PushSparse(push_sparse::Response { outcomes }))
            }

            Request::TryFetchDense(req) => {
                let found = self
                    .node
                    .try_fetch_dense(req.model_id, req.table_id)?
                    .map(|(name, value)| (name, WireValue::from_value(&value)));
                Ok(Response::TryFetchDense(try_fetch_dense::Response { found }))
            }

            Request::TryFetchSparse(req) => match self.node.try_fetch_sparse(req.model_id, req.table_id, &req.keys)? {
                Some((keys, values)) => {
                    let values = values.iter().map(WireValue::from_value).collect();
                    Ok(Response::TryFetchSparse(try_fetch_sparse::Response { keys, values }))
                }
                None => Ok(Response::TryFetchSparse(try_fetch_sparse::Response {
                    keys: vec![],
                    values: vec![],
                })),
            },

            Request::TryFetchSparseMeta(req) => {
                let meta = self.node.try_fetch_sparse_meta(req.model_id, req.table_id)?;
                Ok(Response::TryFetchSparseMeta(try_fetch_sparse_meta::Response { meta }))
            }

            Request::SparseKeys(req) => {
                let node = self.node.clone();
                let keys = self.offload(move || node.sparse_keys(req.model_id, req.table_id)).await?;
                Ok(Response::SparseKeys(sparse_keys::Response { keys }))
            }

            Request::DrainSparseKeys(req) => {
                let node = self.node.clone();
                let drained = self.offload(move || node.drain_sparse_keys(req.model_id, req.table_id, &req.keys)).await?;
                let entries = drained.into_iter().map(|(k, v)| (k, WireValue::from_value(&v))).collect();
                Ok(Response::DrainSparseKeys(drain_sparse_keys::Response { entries }))
            }

            Request::TakeDenseTable(req) => {
                let node = self.node.clone();
                let (name, shape, element_type, value) = self.offload(move || node.take_dense_table(req.model_id, req.table_id)).await?;
                Ok(Response::TakeDenseTable(take_dense_table::Response {
                    name,
                    dims: shape.dims().to_vec(),
                    element_type,
                    value: WireValue::from_value(&value),
                }))
            }

            Request::TransferDense(req) => {
                let node = self.node.clone();
                let transfer_dense::Request {
                    model_id,
                    table_id,
                    name,
                    dims,
                    element_type,
                    value,
                } = req;
                let value = value.to_value()?;
                let shape = ps_data::Shape::new(dims);
                self.offload(move || node.receive_dense_table(model_id, table_id, &name, shape, element_type, value))
                    .await?;
                Ok(Response::TransferDense(transfer_dense::Response))
            }

            Request::TransferSparse(req) => {
                let node = self.node.clone();
                let transfer_sparse::Request {
                    model_id,
                    table_id,
                    name,
                    dimension,
                    element_type,
                    initializer,
                    entries,
                } = req;
                let entries: PsResult<Vec<_>> = entries.into_iter().map(|(k, v)| Ok((k, v.to_value()?))).collect();
                let entries = entries?;
                self.offload(move || node.receive_sparse_entries(model_id, table_id, &name, dimension, element_type, initializer, entries))
                    .await?;
                Ok(Response::TransferSparse(transfer_sparse::Response))
            }

            Request::NotifySaveModel(notify_persist::Request { directory }) => {
                let node = self.node.clone();
                self.offload(move || node.save(&PathBuf::from(directory))).await?;
                Ok(Response::NotifySaveModel(notify_persist::Response))
            }

            Request::NotifyLoadModel(notify_persist::Request { directory }) => {
                let node = self.node.clone();
                self.offload(move || node.load(&PathBuf::from(directory))).await?;
                Ok(Response::NotifyLoadModel(notify_persist::Response))
            }

            other => Err(ps_errors::PsError::internal(format!(
                "request not served by a PS node: {other:?}"
            ))),
        }
    }
}

/// Accept connections on `listen_addr` forever, dispatching every request
/// on each through `service`. One `tokio` task per connection; requests on
/// the same connection are served strictly in arrival order (no
/// pipelining), matching the one-request-at-a-time shape every other
/// transport in this workspace assumes.
pub async fn serve(listen_addr: &str, service: Arc<PsService>) -> PsResult<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!(listen_addr, "ps node listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true).ok();
        let service = service.clone();
        tokio::spawn(async move {
            let mut conn = tokio_util::codec::Framed::new(stream, ps_proto::framing::codec());
            loop {
                match recv_request(&mut conn).await {
                    Ok(None) => break,
                    Ok(Some(request)) => {
                        let response = service.handle(request).await;
                        if let Err(e) = send_response(&mut conn, &response).await {
                            warn!(%peer, %e, "failed to send response, closing connection");
                            break;
                        }
                    }
                    Err(e) => {
                        error!(%peer, %e, "failed to read request, closing connection");
                        break;
                    }
                }
            }
        });
    }
}
