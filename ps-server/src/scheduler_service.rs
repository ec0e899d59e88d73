//! [`SchedulerService`]: the scheduler-side request dispatcher. Unlike
//! [`crate::ps_service::PsService`], nothing here ever runs on a task
//! queue — every scheduler method is either already `async` (and waits on
//! outbound RPCs to PS nodes, not local I/O) or a cheap registry lookup.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use ps_data::{DeviceContext, Shape, Tensor, Value};
use ps_errors::PsResult;
use ps_proto::messages::{
    apply_dense_table, apply_model_id, apply_sparse_table, fetch_router, is_all_ps_working, register_ps, register_worker, try_persist,
};
use ps_proto::{Request, Response, RouterSnapshot};
use ps_scheduler::Scheduler;

use crate::connection::{recv_request, send_response};
use crate::network_rpc::NetworkPsRpc;

pub struct SchedulerService {
    scheduler: Arc<Scheduler<NetworkPsRpc>>,
}

impl SchedulerService {
    pub fn new(scheduler: Arc<Scheduler<NetworkPsRpc>>) -> Self {
        SchedulerService { scheduler }
    }

    fn router_snapshot(&self) -> RouterSnapshot {
        let router = self.scheduler.router();
        RouterSnapshot {
            version: router.version(),
            ps_ids: router.ps_ids().to_vec(),
            ps_addresses: self.scheduler.ps_addresses(),
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        match self.handle_inner(request).await {
            Ok(response) => response,
            Err(e) => Response::Error(e),
        }
    }

    async fn handle_inner(&self, request: Request) -> PsResult<Response> {
        match request {
            Request::ApplyModelId(apply_model_id::Request { name, optimizer }) => {
                let model_id = self.scheduler.apply_model_id(&name, optimizer).await?;
                Ok(Response::ApplyModelId(apply_model_id::Response { model_id }))
            }

            Request::ApplyDenseTable(req) => {
                let shape = Shape::new(req.dims);
                let initial = Value::new(Tensor::zeros(shape.clone(), req.element_type, &DeviceContext::cpu()));
                let table_id = self
                    .scheduler
                    .apply_dense_table(req.model_id, &req.name, shape, req.element_type, initial)
                    .await?;
                Ok(Response::ApplyDenseTable(apply_dense_table::Response { table_id }))
            }

            Request::ApplySparseTable(req) => {
                let table_id = self
                    .scheduler
                    .apply_sparse_table(req.model_id, &req.name, req.dimension, req.element_type, req.initializer)?;
                Ok(Response::ApplySparseTable(apply_sparse_table::Response { table_id }))
            }

            Request::RegisterPs(register_ps::Request { address }) => {
                let ps_id = self.scheduler.register_ps(&address).await?;
                Ok(Response::RegisterPs(register_ps::Response { ps_id }))
            }

            Request::RegisterWorker(register_worker::Request { address }) => {
                let worker_id = self.scheduler.register_worker(&address);
                Ok(Response::RegisterWorker(register_worker::Response { worker_id }))
            }

            Request::FetchRouter(fetch_router::Request) => Ok(Response::FetchRouter(fetch_router::Response {
                snapshot: self.router_snapshot(),
            })),

            Request::IsAllPsWorking(is_all_ps_working::Request) => Ok(Response::IsAllPsWorking(is_all_ps_working::Response {
                yes: self.scheduler.is_all_ps_working(),
            })),

            Request::TrySaveModel(try_persist::Request { model_id: _, directory }) => {
                let success = self.scheduler.save_model(&directory).await.is_ok();
                Ok(Response::TrySaveModel(try_persist::Response { success }))
            }

            Request::TryLoadModel(try_persist::Request { model_id: _, directory }) => {
                let success = self.scheduler.load_model(&directory).await.is_ok();
                Ok(Response::TryLoadModel(try_persist::Response { success }))
            }

            other => Err(ps_errors::PsError::internal(format!(
                "request not served by the scheduler: {other:?}"
            ))),
        }
    }
}

/// Accept connections on `listen_addr` forever, dispatching every request
/// through `service`.
pub async fn serve(listen_addr: &str, service: Arc<SchedulerService>) -> PsResult<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!(listen_addr, "scheduler listening");
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
