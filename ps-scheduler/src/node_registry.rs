//! The scheduler's registry of live nodes (§4.5): every PS and worker that
//! has registered, plus the PS status bitmask each PS last reported so the
//! scheduler can require "all PS in Work" before a save (§4.5) without
//! itself owning PS storage.

use std::collections::HashMap;

use parking_lot::RwLock;
use ps_store::PsStatus;

/// A registered node's address, as the scheduler needs it to dial out for
/// control-plane RPCs (registration broadcasts, save/load/transfer
/// instructions).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddr {
    pub id: u64,
    pub address: String,
}

/// Live PS and worker registries. Each is a simple id -> address map; a PS
/// additionally has a last-known status the scheduler mirrors from
/// `NotifySaveModel`/`NotifyLoadModel` acknowledgements and explicit status
/// pushes during shard transfer.
#[derive(Default)]
pub struct NodeRegistry {
    ps_nodes: RwLock<HashMap<u64, NodeAddr>>,
    ps_status: RwLock<HashMap<u64, PsStatus>>,
    worker_nodes: RwLock<HashMap<u64, NodeAddr>>,
    next_ps_id: RwLock<u64>,
    next_worker_id: RwLock<u64>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new PS node, assigning it the next monotonic id, per
    /// §4.5's PS-join sequence ("new PS registers -> scheduler assigns
    /// id"). Returns the assigned id.
    pub fn register_ps(&self, address: impl Into<String>) -> u64 {
        let mut next = self.next_ps_id.write();
        let id = *next;
        *next += 1;
        let address = address.into();
        self.ps_nodes.write().insert(id, NodeAddr { id, address });
        self.ps_status.write().insert(id, PsStatus::INIT);
        id
    }

    /// Register a new worker node, assigning it the next monotonic id.
    /// Workers carry no status — they're stateless with respect to
    /// parameters (§2).
    pub fn register_worker(&self, address: impl Into<String>) -> u64 {
        let mut next = self.next_worker_id.write();
        let id = *next;
        *next += 1;
        let address = address.into();
        self.worker_nodes.write().insert(id, NodeAddr { id, address });
        id
    }

    /// Every currently registered PS id, in ascending order — the basis
    /// for building a [`ps_router::Router`].
    pub fn ps_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.ps_nodes.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// A PS id's address, if registered.
    pub fn ps_address(&self, id: u64) -> Option<String> {
        self.ps_nodes.read().get(&id).map(|n| n.address.clone())
    }

    /// Every registered PS's id -> address, for broadcasting a
    /// [`ps_proto::RouterSnapshot`].
    pub fn ps_addresses(&self) -> HashMap<u64, String> {
        self.ps_nodes.read().iter().map(|(&id, n)| (id, n.address.clone())).collect()
    }

    /// Record a PS's last-known status, as reported by the PS itself (or
    /// set directly by the scheduler while orchestrating save/load/transfer
    /// — see [`Self::set_ps_status`]).
    pub fn set_ps_status(&self, id: u64, status: PsStatus) {
        self.ps_status.write().insert(id, status);
    }

    /// A PS's last-known status.
    pub fn ps_status(&self, id: u64) -> Option<PsStatus> {
        self.ps_status.read().get(&id).copied()
    }

    /// `IsAllPsWorking` (§4.5): whether every registered PS currently
    /// reports `Work` status. An empty cluster trivially reports `true`.
    pub fn all_ps_working(&self) -> bool {
        self.ps_status.read().values().all(|&s| s == PsStatus::WORK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ps_registration_assigns_monotonic_ids() {
        let reg = NodeRegistry::new();
        let a = reg.register_ps("10.0.0.1:9000");
        let b = reg.register_ps("10.0.0.2:9000");
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(reg.ps_ids(), vec![0, 1]);
    }

    #[test]
    fn empty_cluster_is_trivially_all_working() {
        let reg = NodeRegistry::new();
        assert!(reg.all_ps_working());
    }

    #[test]
    fn all_ps_working_requires_every_node_in_work_status() {
        let reg = NodeRegistry::new();
        let a = reg.register_ps("a");
        let b = reg.register_ps("b");
        assert!(!reg.all_ps_working());
        reg.set_ps_status(a, PsStatus::WORK);
        assert!(!reg.all_ps_working());
        reg.set_ps_status(b, PsStatus::WORK);
        assert!(reg.all_ps_working());
    }

    #[test]
    fn worker_registration_is_independent_of_ps_ids() {
        let reg = NodeRegistry::new();
        reg.register_ps("ps-0");
        let w = reg.register_worker("worker-0");
        assert_eq!(w, 0);
    }
}
