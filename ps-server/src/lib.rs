//! Network glue for the parameter server workspace (§6): the concrete
//! length-prefixed `bincode`/`tokio` transport, the PS- and scheduler-side
//! RPC servers, and [`NetworkPsRpc`]/[`NetworkTransport`] — the two client
//! seams ([`ps_scheduler::PsRpc`], [`ps_worker::Transport`]) realized over
//! real sockets. Every other crate in the workspace is transport-free by
//! design; this is the one crate that opens a socket.
//!
//! No binary entry point lives here (§1's Non-goals exclude CLI/config
//! parsing) — a deployment wires a [`ps_config::NodeConfig`] to
//! [`run_ps`]/[`run_scheduler`]/[`connect_worker`] from its own `main`.

pub mod connection;
pub mod metrics;
pub mod network_rpc;
pub mod network_transport;
pub mod ps_service;
pub mod scheduler_service;

use std::sync::Arc;

use ps_config::{NodeConfig, NodeKind};
use ps_errors::{PsError, PsResult};
use ps_scheduler::Scheduler;
use ps_store::{AsyncTaskQueue, PsNode};
use ps_worker::WorkerClient;

pub use network_rpc::NetworkPsRpc;
pub use network_transport::NetworkTransport;
pub use ps_service::PsService;
pub use scheduler_service::SchedulerService;

/// How many native threads a PS node's [`AsyncTaskQueue`] runs shard
/// transfer and checkpoint I/O on. Small and fixed: this workload is
/// bursty (join/leave, save/load), not a steady-state hot path.
const TASK_QUEUE_THREADS: usize = 4;

/// Start a scheduler node from `config` and serve forever. `config.node_kind`
/// must be [`NodeKind::Scheduler`].
pub async fn run_scheduler(config: &NodeConfig) -> PsResult<()> {
    if config.node_kind != NodeKind::Scheduler {
        return Err(PsError::internal("run_scheduler called with a non-scheduler config"));
    }
    let rpc = Arc::new(NetworkPsRpc::new());
    let scheduler = Arc::new(Scheduler::new(rpc.clone()));
    rpc.bind_scheduler(&scheduler);
    let service = Arc::new(SchedulerService::new(scheduler));
    scheduler_service::serve(&config.listen_addr, service).await
}

/// Start a PS node from `config`, register it with the scheduler, and
/// serve forever. `config.node_kind` must be [`NodeKind::Ps`], and
/// `config.checkpoint_dir` must be set (enforced by
/// [`NodeConfig::validate`] at load time).
pub async fn run_ps(config: &NodeConfig) -> PsResult<()> {
    if config.node_kind != NodeKind::Ps {
        return Err(PsError::internal("run_ps called with a non-ps config"));
    }
    let transport = network_transport::connect(config.scheduler_addr.clone()).await?;
    let ps_id = transport.register_ps(&config.listen_addr).await?;
    let node = Arc::new(PsNode::new(ps_id));
    let queue = Arc::new(AsyncTaskQueue::new(TASK_QUEUE_THREADS));
    let service = Arc::new(PsService::new(node, queue));
    ps_service::serve(&config.listen_addr, service).await
}

/// Build a [`WorkerClient`] for `config`, registering this process as a
/// worker with the scheduler and bootstrapping its router cache.
/// `config.node_kind` must be [`NodeKind::Worker`].
pub async fn connect_worker(config: &NodeConfig) -> PsResult<WorkerClient<NetworkTransport>> {
    if config.node_kind != NodeKind::Worker {
        return Err(PsError::internal("connect_worker called with a non-worker config"));
    }
    let transport = network_transport::connect(config.scheduler_addr.clone()).await?;
    transport.register_worker(&config.listen_addr).await?;
    WorkerClient::bootstrap(transport).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio::time::sleep;

    use ps_data::{ElementType, OptimizerSpec, Shape, Tensor};
    use ps_proto::messages::{apply_dense_table, apply_model_id};
    use ps_proto::{Request, Response};
    use ps_worker::Transport;

    use super::*;

    /// Bind an ephemeral port, read back its address, then release it.
    /// Good enough for a test fixture; the window between releasing and
    /// the node under test re-binding is vanishingly small in practice.
    async fn free_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    }

    async fn apply_model_and_table(transport: &NetworkTransport) -> (u64, u64) {
        let model_id = match transport
            .call_scheduler(Request::ApplyModelId(apply_model_id::Request {
                name: "rec".to_string(),
                optimizer: OptimizerSpec::sgd(),
            }))
            .await
            .unwrap()
        {
            Response::ApplyModelId(r) => r.model_id,
            other => panic!("unexpected response: {other:?}"),
        };

        let table_id = match transport
            .call_scheduler(Request::ApplyDenseTable(apply_dense_table::Request {
                model_id,
                name: "weights".to_string(),
                dims: Shape::vector(4).dims().to_vec(),
                element_type: ElementType::F32,
            }))
            .await
            .unwrap()
        {
            Response::ApplyDenseTable(r) => r.table_id,
            other => panic!("unexpected response: {other:?}"),
        };

        (model_id, table_id)
    }

    #[tokio::test]
    async fn dense_push_pull_round_trips_over_real_sockets() {
        let scheduler_addr = free_addr().await;
        let scheduler_config = NodeConfig::scheduler(scheduler_addr.clone());
        tokio::spawn(async move {
            run_scheduler(&scheduler_config).await.unwrap();
        });
        sleep(Duration::from_millis(20)).await;

        let checkpoint_dir = tempfile::tempdir().unwrap();
        let ps_addr = free_addr().await;
        let ps_config = NodeConfig::ps(scheduler_addr.clone(), ps_addr.clone(), checkpoint_dir.path());
        tokio::spawn(async move {
            run_ps(&ps_config).await.unwrap();
        });
        sleep(Duration::from_millis(20)).await;

        let admin = network_transport::connect(scheduler_addr.clone()).await.unwrap();
        let (model_id, table_id) = apply_model_and_table(&admin).await;

        let worker_config = NodeConfig::worker(scheduler_addr, free_addr().await);
        let worker = connect_worker(&worker_config).await.unwrap();

        let grad = Tensor::from_f64_slice(Shape::vector(4), ElementType::F32, &[1.0, 1.0, 1.0, 1.0]).unwrap();
        worker.push_dense(model_id, table_id, &grad, 0.1).await.unwrap();

        let pulled = worker.pull_dense(model_id, &[table_id]).await.unwrap();
        assert_eq!(pulled.len(), 1);
        let values = pulled[0].as_f64_vec().unwrap();
        assert_eq!(values, vec![-0.1, -0.1, -0.1, -0.1]);

        let grad2 = Tensor::from_f64_slice(Shape::vector(4), ElementType::F32, &[2.0, 2.0, 2.0, 2.0]).unwrap();
        worker.push_dense(model_id, table_id, &grad2, 0.1).await.unwrap();
        let pulled2 = worker.pull_dense(model_id, &[table_id]).await.unwrap();
        assert_eq!(pulled2[0].as_f64_vec().unwrap(), vec![-0.3, -0.3, -0.3, -0.3]);
    }

    #[tokio::test]
    async fn is_all_ps_working_reflects_cluster_state() {
        let scheduler_addr = free_addr().await;
        let scheduler_config = NodeConfig::scheduler(scheduler_addr.clone());
        tokio::spawn(async move {
            run_scheduler(&scheduler_config).await.unwrap();
        });
        sleep(Duration::from_millis(20)).await;

        let admin = network_transport::connect(scheduler_addr.clone()).await.unwrap();
        match admin
            .call_scheduler(Request::IsAllPsWorking(ps_proto::messages::is_all_ps_working::Request))
            .await
            .unwrap()
        {
            Response::IsAllPsWorking(r) => assert!(r.yes, "an empty cluster vacuously has every PS working"),
            other => panic!("unexpected response: {other:?}"),
        }

        let checkpoint_dir = tempfile::tempdir().unwrap();
        let ps_addr = free_addr().await;
        let ps_config = NodeConfig::ps(scheduler_addr.clone(), ps_addr, checkpoint_dir.path());
        tokio::spawn(async move {
            run_ps(&ps_config).await.unwrap();
        });
        sleep(Duration::from_millis(20)).await;

        match admin
            .call_scheduler(Request::IsAllPsWorking(ps_proto::messages::is_all_ps_working::Request))
            .await
            .unwrap()
        {
            Response::IsAllPsWorking(r) => assert!(r.yes, "the freshly joined ps should have settled into Work"),
            other => panic!("unexpected response: {other:?}"),
        }
    }
}
