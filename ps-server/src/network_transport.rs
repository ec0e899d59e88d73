//! [`NetworkTransport`]: [`ps_worker::Transport`] implemented over real TCP
//! sockets, shared by both worker-side dispatch (`ps_worker::WorkerClient`)
//! and PS/worker startup registration against the scheduler.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use ps_errors::{PsError, PsResult};
use ps_proto::messages::{fetch_router, register_ps, register_worker};
use ps_proto::{Request, Response, RouterSnapshot};
use ps_worker::Transport;

use crate::connection::ConnectionPool;

/// One process's outbound connection to the scheduler and every PS it has
/// heard of through a `RouterSnapshot`. A PS address unknown to the most
/// recently fetched router is simply unreachable — callers refresh via
/// [`Transport::fetch_router`] on a stale-router rejection, same as any
/// other [`ps_worker::Transport`] implementation would.
pub struct NetworkTransport {
    scheduler_addr: String,
    pool: ConnectionPool,
    ps_addresses: RwLock<std::collections::HashMap<u64, String>>,
}

impl NetworkTransport {
    pub fn new(scheduler_addr: impl Into<String>) -> Self {
        NetworkTransport {
            scheduler_addr: scheduler_addr.into(),
            pool: ConnectionPool::new(),
            ps_addresses: RwLock::new(std::collections::HashMap::new()),
        }
    }

    /// Register this process's own listen address with the scheduler as a
    /// PS node, returning the assigned shard id.
    pub async fn register_ps(&self, listen_addr: &str) -> PsResult<u64> {
        let request = Request::RegisterPs(register_ps::Request {
            address: listen_addr.to_string(),
        });
        match self.call_scheduler(request).await? {
            Response::RegisterPs(r) => Ok(r.ps_id),
            other => Err(unexpected(other)),
        }
    }

    /// Register this process's own listen address with the scheduler as a
    /// worker node, returning the assigned worker id.
    pub async fn register_worker(&self, listen_addr: &str) -> PsResult<u64> {
        let request = Request::RegisterWorker(register_worker::Request {
            address: listen_addr.to_string(),
        });
        match self.call_scheduler(request).await? {
            Response::RegisterWorker(r) => Ok(r.worker_id),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: Response) -> PsError {
    match response {
        Response::Error(e) => e,
        other => PsError::internal(format!("unexpected response variant: {other:?}")),
    }
}

#[async_trait]
impl Transport for NetworkTransport {
    async fn fetch_router(&self) -> PsResult<RouterSnapshot> {
        match self.call_scheduler(Request::FetchRouter(fetch_router::Request)).await? {
            Response::FetchRouter(r) => {
                *self.ps_addresses.write() = r.snapshot.ps_addresses.clone();
                Ok(r.snapshot)
            }
            other => Err(unexpected(other)),
        }
    }

    async fn call_ps(&self, ps_id: u64, request: Request) -> PsResult<Response> {
        let address = self
            .ps_addresses
            .read()
            .get(&ps_id)
            .cloned()
            .ok_or_else(|| PsError::NodeUnreachable(format!("no known address for ps {ps_id}; fetch_router first")))?;
        self.pool.call(&address, request).await
    }

    async fn call_scheduler(&self, request: Request) -> PsResult<Response> {
        self.pool.call(&self.scheduler_addr, request).await
    }
}

/// Construct a [`NetworkTransport`] and fetch the router once so
/// `call_ps` has addresses to resolve against, mirroring what
/// `ps_worker::WorkerClient::bootstrap` expects from its transport.
pub async fn connect(scheduler_addr: impl Into<String>) -> PsResult<Arc<NetworkTransport>> {
    let transport = Arc::new(NetworkTransport::new(scheduler_addr));
    transport.fetch_router().await?;
    Ok(transport)
}
