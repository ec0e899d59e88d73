//! [`WorkerClient`]: the stateless dispatch core (§4.4). Every data-plane
//! call here follows the same shape — partition by destination PS using
//! the cached router, fan the sub-requests out in parallel tagged with
//! the current router_version, reassemble pull results in the caller's
//! original order, and on a stale-router rejection refetch once and
//! restart the whole call once (§7).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use exponential_backoff::Backoff;
use futures::future::try_join_all;
use tracing::{instrument, warn};

use ps_data::{Tensor, Value};
use ps_errors::{PsError, PsResult};
use ps_proto::{messages, Request, Response};
use ps_router::Router;

use crate::dct::{DctEmitter, DctOutput, PassthroughEmitter};
use crate::router_cache::RouterCache;
use crate::transport::Transport;

/// How many times a pull is retried on `NodeUnreachable` before the
/// error is surfaced, and the capped exponential backoff between
/// attempts (§7: "pulls are retried with exponential backoff (capped)").
const PULL_RETRIES: u32 = 5;
const PULL_BACKOFF_MIN: Duration = Duration::from_millis(20);
const PULL_BACKOFF_MAX: Duration = Duration::from_secs(2);

/// The stateless worker-side dispatch client. One instance is shared by
/// every caller in a worker process; it carries no per-call state besides
/// the cached router.
pub struct WorkerClient<T: Transport> {
    transport: Arc<T>,
    router: RouterCache<T>,
    dct: Arc<dyn DctEmitter>,
}

impl<T: Transport> WorkerClient<T> {
    /// Build a client and fetch the initial router (§4.4 point 1), with no
    /// gradient compression (gradients are transmitted as given).
    pub async fn bootstrap(transport: Arc<T>) -> PsResult<Self> {
        Self::bootstrap_with_emitter(transport, Arc::new(PassthroughEmitter)).await
    }

    /// As [`Self::bootstrap`], with an explicit DCT emitter (§4.4, §9 open
    /// question) applied to every push's gradient before it's sent.
    pub async fn bootstrap_with_emitter(transport: Arc<T>, dct: Arc<dyn DctEmitter>) -> PsResult<Self> {
        let router = RouterCache::bootstrap(transport.clone()).await?;
        Ok(WorkerClient { transport, router, dct })
    }

    /// The router version this client currently tags requests with.
    pub fn router_version(&self) -> u64 {
        self.router.current().version()
    }

    /// `PullDenseTable` / `CombinePullDenseTable`: fan out across every PS
    /// that owns one of `table_ids`, reassembling in the caller's order.
    #[instrument(skip(self))]
    pub async fn pull_dense(&self, model_id: u64, table_ids: &[u64]) -> PsResult<Vec<Tensor>> {
        let router = self.router.current();
        match self.pull_dense_once(&router, model_id, table_ids).await {
            Err(e) if e.is_stale_router() => {
                let router = self.router.refresh().await?;
                self.pull_dense_once(&router, model_id, table_ids).await
            }
            other => other,
        }
    }

    async fn pull_dense_once(&self, router: &Router, model_id: u64, table_ids: &[u64]) -> PsResult<Vec<Tensor>> {
        let by_owner = partition_by_owner(table_ids.iter().enumerate(), |&(_, &table_id)| router.route_dense(model_id, table_id))?;
        let version = router.version();
        let futs = by_owner.into_iter().map(|(ps_id, items)| {
            let table_ids: Vec<u64> = items.iter().map(|(_, &id)| id).collect();
            let indices: Vec<usize> = items.iter().map(|(i, _)| *i).collect();
            async move {
                let request = Request::PullDense(messages::pull_dense::Request {
                    router_version: version,
                    model_id,
                    table_ids,
                });
                let response = self.call_ps_with_pull_retry(ps_id, request).await?;
                let tensors = match response {
                    Response::PullDense(r) => r
                        .tensors
                        .iter()
                        .map(Tensor::try_from)
                        .collect::<PsResult<Vec<_>>>()?,
                    Response::Error(e) => return Err(e),
                    _ => return Err(PsError::internal("PullDense RPC returned an unrelated response variant")),
                };
                Ok((indices, tensors))
            }
        });
        reassemble(try_join_all(futs).await?, table_ids.len())
    }

    /// `PushDenseTable`: a dense table has exactly one owner; gradients are
    /// dropped (not retried further) after one retry on `NodeUnreachable`
    /// (§7).
    #[instrument(skip(self, grad))]
    pub async fn push_dense(&self, model_id: u64, table_id: u64, grad: &Tensor, lr: f64) -> PsResult<()> {
        let router = self.router.current();
        match self.push_dense_once(&router, model_id, table_id, grad, lr).await {
            Err(e) if e.is_stale_router() => {
                let router = self.router.refresh().await?;
                self.push_dense_once(&router, model_id, table_id, grad, lr).await
            }
            other => other,
        }
    }

    async fn push_dense_once(&self, router: &Router, model_id: u64, table_id: u64, grad: &Tensor, lr: f64) -> PsResult<()> {
        let ps_id = router.route_dense(model_id, table_id)?;
        let payload = match self.dct.emit(grad) {
            DctOutput::Transmit(t) => t,
            DctOutput::Residual => return Ok(()),
        };
        let request = Request::PushDense(messages::push_dense::Request {
            router_version: router.version(),
            model_id,
            table_id,
            grad: (&payload).into(),
            lr,
        });
        match self.call_ps_with_push_retry(ps_id, request).await? {
            Response::PushDense(_) => Ok(()),
            Response::Error(e) => Err(e),
            _ => Err(PsError::internal("PushDense RPC returned an unrelated response variant")),
        }
    }

    /// `CombinePullSparseTable`: fan out across every PS that owns one of
    /// `keys`, reassembling in the caller's order.
    #[instrument(skip(self, keys))]
    pub async fn pull_sparse(&self, model_id: u64, table_id: u64, keys: &[u64]) -> PsResult<Vec<Value>> {
        let router = self.router.current();
        match self.pull_sparse_once(&router, model_id, table_id, keys).await {
            Err(e) if e.is_stale_router() => {
                let router = self.router.refresh().await?;
                self.pull_sparse_once(&router, model_id, table_id, keys).await
            }
            other => other,
        }
    }

    async fn pull_sparse_once(&self, router: &Router, model_id: u64, table_id: u64, keys: &[u64]) -> PsResult<Vec<Value>> {
        let by_owner = partition_by_owner(keys.iter().enumerate(), |&(_, &key)| router.route_sparse(model_id, table_id, key))?;
        let version = router.version();
        let futs = by_owner.into_iter().map(|(ps_id, items)| {
            let keys: Vec<u64> = items.iter().map(|(_, &k)| k).collect();
            let indices: Vec<usize> = items.iter().map(|(i, _)| *i).collect();
            async move {
                let request = Request::PullSparse(messages::pull_sparse::Request {
                    router_version: version,
                    model_id,
                    table_id,
                    keys,
                });
                let response = self.call_ps_with_pull_retry(ps_id, request).await?;
                let values = match response {
                    Response::PullSparse(r) => r.values.iter().map(messages::WireValue::to_value).collect::<PsResult<Vec<_>>>()?,
                    Response::Error(e) => return Err(e),
                    _ => return Err(PsError::internal("PullSparse RPC returned an unrelated response variant")),
                };
                Ok((indices, values))
            }
        });
        reassemble(try_join_all(futs).await?, keys.len())
    }

    /// `CombinePushSparseTable` across one or more tables of one model in
    /// a single logical call (§5 S5): every (table_id, key, grad) triple is
    /// routed independently, grouped by destination PS, and sent as one
    /// `CombinePushSparseTable` RPC per destination regardless of how many
    /// (table, key) pairs land there.
    #[instrument(skip(self, batches))]
    pub async fn push_sparse_combined(&self, model_id: u64, batches: &[(u64, Vec<u64>, Vec<Tensor>)], lr: f64) -> PsResult<Vec<messages::push_sparse::TableOutcome>> {
        let router = self.router.current();
        match self.push_sparse_combined_once(&router, model_id, batches, lr).await {
            Err(e) if e.is_stale_router() => {
                let router = self.router.refresh().await?;
                self.push_sparse_combined_once(&router, model_id, batches, lr).await
            }
            other => other,
        }
    }

    async fn push_sparse_combined_once(
        &self,
        router: &Router,
        model_id: u64,
        batches: &[(u64, Vec<u64>, Vec<Tensor>)],
        lr: f64,
    ) -> PsResult<Vec<messages::push_sparse::TableOutcome>> {
        // group (table_id, key, grad) triples by destination PS, keeping
        // one key/grad sub-list per table within each destination.
        let mut by_owner: HashMap<u64, HashMap<u64, (Vec<u64>, Vec<Tensor>)>> = HashMap::new();
        for (table_id, keys, grads) in batches {
            ps_errors::invariant_eq!(keys.len(), grads.len());
            for (key, grad) in keys.iter().zip(grads.iter()) {
                let owner = router.route_sparse(model_id, *table_id, *key)?;
                let payload = match self.dct.emit(grad) {
                    DctOutput::Transmit(t) => t,
                    DctOutput::Residual => continue,
                };
                let entry = by_owner.entry(owner).or_default().entry(*table_id).or_insert_with(|| (Vec::new(), Vec::new()));
                entry.0.push(*key);
                entry.1.push(payload);
            }
        }
        let version = router.version();
        let futs = by_owner.into_iter().map(|(ps_id, tables)| async move {
            let batches = tables
                .into_iter()
                .map(|(table_id, (keys, grads))| messages::push_sparse::TableBatch {
                    table_id,
                    keys,
                    grads: grads.iter().map(Into::into).collect(),
                })
                .collect();
            let request = Request::PushSparse(messages::push_sparse::Request {
                router_version: version,
                model_id,
                batches,
                lr,
            });
            match self.call_ps_with_push_retry(ps_id, request).await? {
                Response::PushSparse(r) => Ok(r.outcomes),
                Response::Error(e) => Err(e),
                _ => Err(PsError::internal("PushSparse RPC returned an unrelated response variant")),
            }
        });
        Ok(try_join_all(futs).await?.into_iter().flatten().collect())
    }

    /// Pulls are retried with capped exponential backoff on
    /// `NodeUnreachable` (§7); any other error (including a stale-router
    /// rejection, handled one layer up) is surfaced immediately.
    async fn call_ps_with_pull_retry(&self, ps_id: u64, request: Request) -> PsResult<Response> {
        let backoff = Backoff::new(PULL_RETRIES, PULL_BACKOFF_MIN, PULL_BACKOFF_MAX);
        let mut attempts = (&backoff).into_iter();
        loop {
            match self.transport.call_ps(ps_id, request.clone()).await {
                Err(PsError::NodeUnreachable(msg)) => match attempts.next() {
                    Some(Some(delay)) => {
                        warn!(ps_id, %msg, ?delay, "pull unreachable, backing off and retrying");
                        tokio::time::sleep(delay).await;
                    }
                    _ => return Err(PsError::NodeUnreachable(msg)),
                },
                other => return other,
            }
        }
    }

    /// Pushes get exactly one retry on `NodeUnreachable`; after that the
    /// gradient is considered dropped (§7: "pushes are dropped after one
    /// retry") and the error is surfaced so the caller can count it, but
    /// dispatch itself does not retry again.
    async fn call_ps_with_push_retry(&self, ps_id: u64, request: Request) -> PsResult<Response> {
        match self.transport.call_ps(ps_id, request.clone()).await {
            Err(PsError::NodeUnreachable(msg)) => {
                warn!(ps_id, %msg, "push unreachable, retrying once before dropping");
                self.transport.call_ps(ps_id, request).await
            }
            other => other,
        }
    }
}

/// Group an iterator of items by the PS each resolves to, short-circuiting
/// on the first routing error (an empty router reports `ClusterBusy`).
fn partition_by_owner<I>(items: I, route: impl Fn(&I::Item) -> PsResult<u64>) -> PsResult<HashMap<u64, Vec<I::Item>>>
where
    I: Iterator,
{
    let mut by_owner: HashMap<u64, Vec<I::Item>> = HashMap::new();
    for item in items {
        let owner = route(&item)?;
        by_owner.entry(owner).or_default().push(item);
    }
    Ok(by_owner)
}

/// Reassemble per-owner `(original_index, value)` batches back into one
/// vector in the caller's original request order (§4.4 point 5).
fn reassemble<V>(parts: Vec<(Vec<usize>, Vec<V>)>, len: usize) -> PsResult<Vec<V>> {
    let mut out: Vec<Option<V>> = (0..len).map(|_| None).collect();
    for (indices, values) in parts {
        for (idx, value) in indices.into_iter().zip(values) {
            out[idx] = Some(value);
        }
    }
    out.into_iter()
        .enumerate()
        .map(|(i, v)| v.ok_or_else(|| PsError::internal(format!("dispatch lost result for request index {i}"))))
        .collect()
}
