//! Cluster control plane (§4.5, §4.6): the scheduler node's view of the
//! cluster — which PS and worker nodes exist, which models/tables are
//! registered, the currently published [`ps_router::Router`], and the
//! orchestration sequences that change any of those (PS join, save, load).
//!
//! This crate never opens a socket. [`rpc::PsRpc`] is the seam: `ps-server`
//! implements it over the real transport, and this crate's own tests
//! implement it directly against an in-process `ps_store::PsNode` (a
//! `dev-dependency`) so the orchestration logic is testable without any
//! networking.

pub mod cluster;
pub mod model_registry;
pub mod node_registry;
pub mod rpc;
pub mod scheduler;
pub mod transfer;

pub use cluster::{ClusterState, ClusterStatus};
pub use model_registry::ModelRegistry;
pub use node_registry::{NodeAddr, NodeRegistry};
pub use rpc::PsRpc;
pub use scheduler::Scheduler;
