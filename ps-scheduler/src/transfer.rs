//! Shard transfer (§4.6): scheduler-driven streaming of reassigned
//! (model_id, table_id, key-or-whole-dense-table) ownership between PS
//! nodes when the router changes membership.
//!
//! Planning and execution are both expressed purely in terms of
//! [`crate::rpc::PsRpc`] and two [`ps_router::Router`]s (before/after), so
//! this module has no idea whether the PS nodes it's talking to are local
//! fakes (as in this crate's tests) or remote over the network
//! (`ps-server`'s concern).

use ps_data::ModelMetaData;
use ps_errors::PsResult;
use ps_router::Router;
use ps_store::PsStatus;

use crate::rpc::PsRpc;

/// Move every (model_id, table_id) whose ownership changes between
/// `old_router` and `new_router` for a single model, per §4.6's four-step
/// sequence: source enters `Transfer`, source streams to destination,
/// destination inserts, and (by the caller, once every model's transfer
/// for this membership change completes) the scheduler publishes the new
/// router version.
///
/// Dense tables move wholesale (one shard owns the whole table); sparse
/// tables move per materialized key, queried from each of `old_router`'s
/// current owners rather than assumed — the scheduler has no storage of
/// its own to consult.
pub async fn rebalance_model(rpc: &dyn PsRpc, old_router: &Router, new_router: &Router, model: &ModelMetaData) -> PsResult<()> {
    for table in model.tables.values() {
        if let Some(shape) = table.dense_shape() {
            let old_owner = old_router.route_dense(model.id, table.id)?;
            let new_owner = new_router.route_dense(model.id, table.id)?;
            if old_owner == new_owner {
                continue;
            }
            rpc.set_status(old_owner, PsStatus::WORK | PsStatus::TRANSFER).await?;
            let (name, shape, element_type, value) = rpc.take_dense_table(old_owner, model.id, table.id).await?;
            debug_assert_eq!(shape.dims(), table.dense_shape().unwrap().dims());
            rpc.receive_dense_table(new_owner, model.id, table.id, name, shape, element_type, value)
                .await?;
            rpc.set_status(old_owner, PsStatus::WORK).await?;
        } else if let Some(dimension) = table.sparse_dimension() {
            let initializer = match &table.kind {
                ps_data::TableKind::Sparse { initializer, .. } => initializer.clone(),
                ps_data::TableKind::Dense { .. } => unreachable!(),
            };
            for &owner in old_router.ps_ids() {
                rpc.set_status(owner, PsStatus::WORK | PsStatus::TRANSFER).await?;
                let keys = rpc.sparse_keys(owner, model.id, table.id).await?;
                let moving: Vec<u64> = keys
                    .into_iter()
                    .filter(|&k| new_router.route_sparse(model.id, table.id, k).map(|n| n != owner).unwrap_or(false))
                    .collect();
                if !moving.is_empty() {
                    let entries = rpc.drain_sparse_keys(owner, model.id, table.id, moving).await?;
                    // group by destination so each destination gets one
                    // call per owner rather than one call per key.
                    let mut by_dest: std::collections::HashMap<u64, Vec<(u64, ps_data::Value)>> = std::collections::HashMap::new();
                    for (key, value) in entries {
                        let dest = new_router.route_sparse(model.id, table.id, key)?;
                        by_dest.entry(dest).or_default().push((key, value));
                    }
                    for (dest, entries) in by_dest {
                        rpc.receive_sparse_entries(
                            dest,
                            model.id,
                            table.id,
                            table.name.clone(),
                            dimension,
                            table.element_type,
                            initializer.clone(),
                            entries,
                        )
                        .await?;
                    }
                }
                rpc.set_status(owner, PsStatus::WORK).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::PsRpc;
    use async_trait::async_trait;
    use parking_lot::RwLock;
    use ps_data::{ElementType, InitializerSpec, OptimizerSpec, Shape};
    use ps_store::PsNode;
    use std::collections::HashMap;

    /// An in-process [`PsRpc`] backed directly by [`PsNode`]s, used to
    /// exercise the transfer-planning logic without any networking —
    /// `ps-server` is where a real implementation dials out over the
    /// wire instead.
    struct LocalCluster {
        nodes: RwLock<HashMap<u64, PsNode>>,
    }

    impl LocalCluster {
        fn new(ps_ids: &[u64]) -> Self {
            let mut nodes = HashMap::new();
            for &id in ps_ids {
                nodes.insert(id, PsNode::new(id));
            }
            LocalCluster {
                nodes: RwLock::new(nodes),
            }
        }

        fn with<R>(&self, id: u64, f: impl FnOnce(&PsNode) -> R) -> R {
            let nodes = self.nodes.read();
            f(nodes.get(&id).expect("unknown ps id in test cluster"))
        }
    }

    #[async_trait]
    impl PsRpc for LocalCluster {
        async fn register_model(&self, ps_id: u64, meta: ModelMetaData) -> PsResult<()> {
            self.with(ps_id, |n| n.register_model(meta))
        }

        async fn register_dense_table(
            &self,
            ps_id: u64,
            model_id: u64,
            table_id: u64,
            name: String,
            shape: Shape,
            element_type: ElementType,
            initial: ps_data::Value,
        ) -> PsResult<()> {
            self.with(ps_id, |n| n.register_dense_table(model_id, table_id, &name, shape, element_type, initial))?;
            Ok(())
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
            self.with(ps_id, |n| n.register_sparse_table(model_id, table_id, &name, dimension, element_type, initializer))?;
            Ok(())
        }

        async fn adopt_router_version(&self, ps_id: u64, version: u64) -> PsResult<()> {
            self.with(ps_id, |n| n.adopt_router_version(version))
        }

        async fn set_status(&self, ps_id: u64, status: PsStatus) -> PsResult<()> {
            self.with(ps_id, |n| n.set_status(status));
            Ok(())
        }

        async fn sparse_keys(&self, ps_id: u64, model_id: u64, table_id: u64) -> PsResult<Vec<u64>> {
            self.with(ps_id, |n| n.sparse_keys(model_id, table_id))
        }

        async fn drain_sparse_keys(&self, ps_id: u64, model_id: u64, table_id: u64, keys: Vec<u64>) -> PsResult<Vec<(u64, ps_data::Value)>> {
            self.with(ps_id, |n| n.drain_sparse_keys(model_id, table_id, &keys))
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
            entries: Vec<(u64, ps_data::Value)>,
        ) -> PsResult<()> {
            self.with(ps_id, |n| {
                n.receive_sparse_entries(model_id, table_id, &name, dimension, element_type, initializer, entries)
            })
        }

        async fn take_dense_table(&self, ps_id: u64, model_id: u64, table_id: u64) -> PsResult<(String, Shape, ElementType, ps_data::Value)> {
            self.with(ps_id, |n| n.take_dense_table(model_id, table_id))
        }

        async fn receive_dense_table(
            &self,
            ps_id: u64,
            model_id: u64,
            table_id: u64,
            name: String,
            shape: Shape,
            element_type: ElementType,
            value: ps_data::Value,
        ) -> PsResult<()> {
            self.with(ps_id, |n| n.receive_dense_table(model_id, table_id, &name, shape, element_type, value))
        }

        async fn notify_save(&self, _ps_id: u64, _directory: String) -> PsResult<()> {
            Ok(())
        }

        async fn notify_load(&self, _ps_id: u64, _directory: String) -> PsResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn sparse_rebalance_preserves_values_and_routes_by_new_router() {
        let cluster = LocalCluster::new(&[0, 1]);
        let mut model = ModelMetaData::new(0, "rec", OptimizerSpec::sgd());
        cluster.with(0, |n| n.register_model(model.clone())).unwrap();
        cluster.with(1, |n| n.register_model(model.clone())).unwrap();

        let old_router = Router::new(0, vec![0, 1]);
        for key in 0..200u64 {
            let owner = old_router.route_sparse(0, 0, key).unwrap();
            cluster.with(owner, |n| {
                n.register_sparse_table(0, 0, "emb", 2, ElementType::F32, InitializerSpec::zeros())
                    .ok();
                n.pull_sparse(0, 0, 0, &[key]).unwrap()
            });
        }
        model.tables.insert(0, ps_data::TableMetaData::sparse(0, "emb", 2, ElementType::F32, InitializerSpec::zeros()));

        let new_router = Router::new(1, vec![0, 1, 2]);
        // a third PS must exist in the cluster for the destination calls to land.
        let cluster = {
            let mut nodes = cluster.nodes.into_inner();
            nodes.insert(2, PsNode::new(2));
            nodes.get(&2).unwrap().register_model(model.clone()).unwrap();
            LocalCluster { nodes: RwLock::new(nodes) }
        };

        rebalance_model(&cluster, &old_router, &new_router, &model).await.unwrap();

        for key in 0..200u64 {
            let new_owner = new_router.route_sparse(0, 0, key).unwrap();
            let found = cluster.with(new_owner, |n| n.try_fetch_sparse(0, 0, &[key]).unwrap());
            assert!(found.is_some(), "key {key} missing from its new owner {new_owner}");
            let (found_keys, _) = found.unwrap();
            assert_eq!(found_keys, vec![key]);
        }
    }

    #[tokio::test]
    async fn dense_table_moves_wholesale_on_ownership_change() {
        let ids = [0u64, 1];
        let cluster = LocalCluster::new(&ids);
        let model = ModelMetaData::new(0, "rec", OptimizerSpec::sgd());
        for &id in &ids {
            cluster.with(id, |n| n.register_model(model.clone())).unwrap();
        }
        let old_router = Router::new(0, vec![0]);
        let owner = old_router.route_dense(0, 0).unwrap();
        let initial = ps_data::Value::new(ps_data::Tensor::from_f64_slice(Shape::vector(2), ElementType::F32, &[3.0, 4.0]).unwrap());
        cluster.with(owner, |n| n.register_dense_table(0, 0, "w", Shape::vector(2), ElementType::F32, initial)).unwrap();

        let mut model = model;
        model.tables.insert(0, ps_data::TableMetaData::dense(0, "w", Shape::vector(2), ElementType::F32));
        let new_router = Router::new(1, vec![0, 1]);

        rebalance_model(&cluster, &old_router, &new_router, &model).await.unwrap();

        let new_owner = new_router.route_dense(0, 0).unwrap();
        if new_owner != owner {
            let found = cluster.with(new_owner, |n| n.try_fetch_dense(0, 0).unwrap());
            assert!(found.is_some());
            assert_eq!(found.unwrap().1.tensor().as_f64_vec().unwrap(), vec![3.0, 4.0]);
        }
    }
}
