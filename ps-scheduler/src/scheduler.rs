//! [`Scheduler`]: the cluster control plane's top-level orchestrator
//! (§4.5). Combines the node registry, model/table registry, cluster
//! status, and the currently published [`Router`] behind a single type
//! whose methods implement each control-plane sequence end to end —
//! PS/worker join, model/table registration, shard-transfer-driven
//! rebalance, and save/load.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, instrument, warn};

use ps_data::{ElementType, InitializerSpec, ModelMetaData, OptimizerSpec, Shape};
use ps_errors::{PsError, PsResult};
use ps_router::Router;
use ps_store::PsStatus;

use crate::cluster::{ClusterState, ClusterStatus};
use crate::model_registry::ModelRegistry;
use crate::node_registry::NodeRegistry;
use crate::rpc::PsRpc;
use crate::transfer::rebalance_model;

/// The cluster control plane. Holds no table data of its own — every byte
/// of model state lives on a PS, reached through `rpc` — only the
/// registries and the router version the cluster currently agrees on.
pub struct Scheduler<R: PsRpc> {
    rpc: Arc<R>,
    nodes: NodeRegistry,
    models: ModelRegistry,
    cluster: ClusterState,
    router: RwLock<Arc<Router>>,
}

impl<R: PsRpc> Scheduler<R> {
    /// A fresh scheduler with an empty cluster (router version 0, no PS
    /// nodes on the ring).
    pub fn new(rpc: Arc<R>) -> Self {
        Scheduler {
            rpc,
            nodes: NodeRegistry::new(),
            models: ModelRegistry::new(),
            cluster: ClusterState::new(),
            router: RwLock::new(Arc::new(Router::new(0, vec![]))),
        }
    }

    /// The router version currently published to the cluster.
    pub fn router(&self) -> Arc<Router> {
        self.router.read().clone()
    }

    /// `IsAllPsWorking` (§4.5), surfaced for callers deciding whether to
    /// attempt a save/load.
    pub fn is_all_ps_working(&self) -> bool {
        self.nodes.all_ps_working()
    }

    /// Every registered PS's id -> address, for a `ps-server` handler
    /// assembling a `FetchRouter` response's [`ps_proto`]-shaped snapshot
    /// (this crate itself never depends on `ps-proto`, see `rpc.rs`).
    pub fn ps_addresses(&self) -> std::collections::HashMap<u64, String> {
        self.nodes.ps_addresses()
    }

    /// `ApplyModelId` (§4.5, §6): register (or look up) a model by name,
    /// then broadcast its metadata to every currently registered PS so a
    /// model created after some PS nodes have already joined is still
    /// visible everywhere.
    #[instrument(skip(self, optimizer))]
    pub async fn apply_model_id(&self, name: &str, optimizer: OptimizerSpec) -> PsResult<u64> {
        let model_id = self.models.apply_model_id(name, optimizer);
        let meta = self.models.model(model_id).expect("just registered");
        for &ps_id in &self.nodes.ps_ids() {
            self.rpc.register_model(ps_id, meta.clone()).await?;
        }
        Ok(model_id)
    }

    /// `ApplyDenseTable` (§4.5, §6): register the table, then push it to
    /// the table's single current owner under the published router.
    pub async fn apply_dense_table(
        &self,
        model_id: u64,
        name: &str,
        shape: Shape,
        element_type: ElementType,
        initial: ps_data::Value,
    ) -> PsResult<u64> {
        let table_id = self.models.apply_dense_table(model_id, name, shape.clone(), element_type)?;
        let owner = self.router().route_dense(model_id, table_id)?;
        self.rpc
            .register_dense_table(owner, model_id, table_id, name.to_string(), shape, element_type, initial)
            .await?;
        Ok(table_id)
    }

    /// `ApplySparseTable` (§4.5, §6): sparse tables are registered lazily
    /// per shard (each PS creates its local table the first time a key
    /// lands on it), so unlike dense registration this only needs to
    /// record the metadata centrally — no RPC fan-out is required until
    /// keys actually start arriving.
    pub fn apply_sparse_table(
        &self,
        model_id: u64,
        name: &str,
        dimension: usize,
        element_type: ElementType,
        initializer: InitializerSpec,
    ) -> PsResult<u64> {
        self.models.apply_sparse_table(model_id, name, dimension, element_type, initializer)
    }

    /// The full PS-join sequence (§4.5): assign an id, compute the router
    /// that would result from adding it, move every affected table's data
    /// under cluster-wide `Transfer` status, then publish the new router
    /// and bump every PS's adopted version. Returns the assigned PS id.
    #[instrument(skip(self))]
    pub async fn register_ps(&self, address: &str) -> PsResult<u64> {
        let new_id = self.nodes.register_ps(address);
        self.nodes.set_ps_status(new_id, PsStatus::INIT);

        let old_router = self.router();
        let mut new_members = old_router.ps_ids().to_vec();
        new_members.push(new_id);
        let new_router = Arc::new(old_router.next(new_members));

        // bring every model the new PS doesn't yet know about onto it
        // before any data is transferred there.
        for meta in self.models.all_models() {
            self.rpc.register_model(new_id, meta).await?;
        }

        self.cluster.begin(ClusterStatus::Transfer).map_err(|busy| {
            PsError::ClusterBusy(format!("cannot join PS while cluster is {busy:?}"))
        })?;
        let result = self.rebalance_for(&old_router, &new_router).await;
        self.cluster.finish();
        result?;

        self.publish_router(&new_router).await?;
        self.nodes.set_ps_status(new_id, PsStatus::WORK);
        info!(ps_id = new_id, version = new_router.version(), "ps joined, router published");
        Ok(new_id)
    }

    /// Register a worker node (§4.5); workers carry no shard state so
    /// joining one never triggers a rebalance.
    pub fn register_worker(&self, address: &str) -> u64 {
        self.nodes.register_worker(address)
    }

    async fn rebalance_for(&self, old_router: &Router, new_router: &Router) -> PsResult<()> {
        for model in self.models.all_models() {
            rebalance_model(self.rpc.as_ref(), old_router, new_router, &model).await?;
        }
        Ok(())
    }

    async fn publish_router(&self, new_router: &Arc<Router>) -> PsResult<()> {
        *self.router.write() = new_router.clone();
        for &ps_id in new_router.ps_ids() {
            self.rpc.adopt_router_version(ps_id, new_router.version()).await?;
        }
        Ok(())
    }

    /// `TrySaveModel` (§4.5): require every PS to be in `Work`, transition
    /// the cluster to `Save` (rejecting new pushes cluster-wide while
    /// in-flight ones drain), instruct each PS to persist to `directory`,
    /// then return to `Work`. Fails without persisting anything if any PS
    /// is not currently `Work`.
    #[instrument(skip(self))]
    pub async fn save_model(&self, directory: &str) -> PsResult<()> {
        if !self.is_all_ps_working() {
            return Err(PsError::ClusterBusy("not every PS is in Work status".to_string()));
        }
        self.cluster
            .begin(ClusterStatus::Save)
            .map_err(|busy| PsError::ClusterBusy(format!("cannot save while cluster is {busy:?}")))?;
        let result = self.run_save(directory).await;
        self.cluster.finish();
        result
    }

    async fn run_save(&self, directory: &str) -> PsResult<()> {
        for &ps_id in &self.nodes.ps_ids() {
            self.nodes.set_ps_status(ps_id, PsStatus::WORK | PsStatus::SAVE);
            self.rpc.set_status(ps_id, PsStatus::WORK | PsStatus::SAVE).await?;
            self.rpc.notify_save(ps_id, directory.to_string()).await?;
            self.nodes.set_ps_status(ps_id, PsStatus::WORK);
            self.rpc.set_status(ps_id, PsStatus::WORK).await?;
        }
        Ok(())
    }

    /// `TryLoadModel` (§4.5): symmetric to [`Self::save_model`].
    #[instrument(skip(self))]
    pub async fn load_model(&self, directory: &str) -> PsResult<()> {
        if !self.is_all_ps_working() {
            return Err(PsError::ClusterBusy("not every PS is in Work status".to_string()));
        }
        self.cluster
            .begin(ClusterStatus::Load)
            .map_err(|busy| PsError::ClusterBusy(format!("cannot load while cluster is {busy:?}")))?;
        let result = self.run_load(directory).await;
        self.cluster.finish();
        result
    }

    async fn run_load(&self, directory: &str) -> PsResult<()> {
        for &ps_id in &self.nodes.ps_ids() {
            self.nodes.set_ps_status(ps_id, PsStatus::WORK | PsStatus::LOAD);
            self.rpc.set_status(ps_id, PsStatus::WORK | PsStatus::LOAD).await?;
            if let Err(err) = self.rpc.notify_load(ps_id, directory.to_string()).await {
                warn!(ps_id, %err, "load failed on PS, cluster left in Work with partial state");
                self.nodes.set_ps_status(ps_id, PsStatus::WORK);
                self.rpc.set_status(ps_id, PsStatus::WORK).await.ok();
                return Err(err);
            }
            self.nodes.set_ps_status(ps_id, PsStatus::WORK);
            self.rpc.set_status(ps_id, PsStatus::WORK).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ps_data::{DeviceContext, Tensor, Value};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// A minimal fake that just records calls — enough to test the
    /// orchestration sequencing in [`Scheduler`] itself without pulling in
    /// a real [`ps_store::PsNode`] (that integration lives in
    /// `transfer.rs`'s tests, which exercise the data movement directly).
    #[derive(Default)]
    struct RecordingRpc {
        calls: Mutex<Vec<String>>,
        router_versions: Mutex<HashMap<u64, u64>>,
    }

    impl RecordingRpc {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PsRpc for RecordingRpc {
        async fn register_model(&self, ps_id: u64, _meta: ModelMetaData) -> PsResult<()> {
            self.calls.lock().unwrap().push(format!("register_model({ps_id})"));
            Ok(())
        }
        async fn register_dense_table(
            &self,
            ps_id: u64,
            _model_id: u64,
            _table_id: u64,
            _name: String,
            _shape: Shape,
            _element_type: ElementType,
            _initial: Value,
        ) -> PsResult<()> {
            self.calls.lock().unwrap().push(format!("register_dense_table({ps_id})"));
            Ok(())
        }
        async fn register_sparse_table(
            &self,
            ps_id: u64,
            _model_id: u64,
            _table_id: u64,
            _name: String,
            _dimension: usize,
            _element_type: ElementType,
            _initializer: InitializerSpec,
        ) -> PsResult<()> {
            self.calls.lock().unwrap().push(format!("register_sparse_table({ps_id})"));
            Ok(())
        }
        async fn adopt_router_version(&self, ps_id: u64, version: u64) -> PsResult<()> {
            self.router_versions.lock().unwrap().insert(ps_id, version);
            self.calls.lock().unwrap().push(format!("adopt_router_version({ps_id}, {version})"));
            Ok(())
        }
        async fn set_status(&self, ps_id: u64, status: PsStatus) -> PsResult<()> {
            self.calls.lock().unwrap().push(format!("set_status({ps_id}, {status:?})"));
            Ok(())
        }
        async fn sparse_keys(&self, _ps_id: u64, _model_id: u64, _table_id: u64) -> PsResult<Vec<u64>> {
            Ok(vec![])
        }
        async fn drain_sparse_keys(&self, _ps_id: u64, _model_id: u64, _table_id: u64, _keys: Vec<u64>) -> PsResult<Vec<(u64, Value)>> {
            Ok(vec![])
        }
        async fn receive_sparse_entries(
            &self,
            _ps_id: u64,
            _model_id: u64,
            _table_id: u64,
            _name: String,
            _dimension: usize,
            _element_type: ElementType,
            _initializer: InitializerSpec,
            _entries: Vec<(u64, Value)>,
        ) -> PsResult<()> {
            Ok(())
        }
        async fn take_dense_table(&self, _ps_id: u64, _model_id: u64, _table_id: u64) -> PsResult<(String, Shape, ElementType, Value)> {
            Err(PsError::UnknownTable(0))
        }
        async fn receive_dense_table(
            &self,
            _ps_id: u64,
            _model_id: u64,
            _table_id: u64,
            _name: String,
            _shape: Shape,
            _element_type: ElementType,
            _value: Value,
        ) -> PsResult<()> {
            Ok(())
        }
        async fn notify_save(&self, ps_id: u64, _directory: String) -> PsResult<()> {
            self.calls.lock().unwrap().push(format!("notify_save({ps_id})"));
            Ok(())
        }
        async fn notify_load(&self, ps_id: u64, _directory: String) -> PsResult<()> {
            self.calls.lock().unwrap().push(format!("notify_load({ps_id})"));
            Ok(())
        }
    }

    fn scheduler() -> Scheduler<RecordingRpc> {
        Scheduler::new(Arc::new(RecordingRpc::default()))
    }

    #[tokio::test]
    async fn first_ps_join_publishes_a_single_member_router() {
        let s = scheduler();
        let id = s.register_ps("10.0.0.1:9000").await.unwrap();
        assert_eq!(id, 0);
        assert_eq!(s.router().ps_ids(), &[0]);
        assert_eq!(s.router().version(), 1);
    }

    #[tokio::test]
    async fn second_ps_join_bumps_router_version_and_keeps_first_member() {
        let s = scheduler();
        s.register_ps("a").await.unwrap();
        s.register_ps("b").await.unwrap();
        assert_eq!(s.router().ps_ids(), &[0, 1]);
        assert_eq!(s.router().version(), 2);
    }

    #[tokio::test]
    async fn save_requires_every_ps_working_first() {
        let s = scheduler();
        s.register_ps("a").await.unwrap();
        // register_ps leaves every joined PS in Work, so a save should
        // succeed immediately after join.
        s.save_model("/tmp/ckpt").await.unwrap();
    }

    #[tokio::test]
    async fn save_and_load_cannot_run_concurrently_with_each_other() {
        let s = scheduler();
        s.register_ps("a").await.unwrap();
        s.cluster.begin(ClusterStatus::Save).unwrap();
        assert!(matches!(s.save_model("/tmp/ckpt").await, Err(PsError::ClusterBusy(_))));
        s.cluster.finish();
    }

    #[tokio::test]
    async fn apply_model_id_is_idempotent_and_broadcasts_to_existing_ps() {
        let s = scheduler();
        s.register_ps("a").await.unwrap();
        let id1 = s.apply_model_id("rec", OptimizerSpec::sgd()).await.unwrap();
        let id2 = s.apply_model_id("rec", OptimizerSpec::sgd()).await.unwrap();
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn apply_dense_table_registers_on_the_routed_owner() {
        let s = scheduler();
        s.register_ps("a").await.unwrap();
        let model_id = s.apply_model_id("rec", OptimizerSpec::sgd()).await.unwrap();
        let initial = Value::new(Tensor::zeros(Shape::vector(4), ElementType::F32, &DeviceContext::cpu()));
        let table_id = s
            .apply_dense_table(model_id, "bias", Shape::vector(4), ElementType::F32, initial)
            .await
            .unwrap();
        assert!(s.rpc.calls().iter().any(|c| c.contains("register_dense_table")));
        let _ = table_id;
    }
}
