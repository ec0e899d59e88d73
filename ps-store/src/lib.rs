//! The per-PS sharded table store: dense and sparse tables, the
//! lock-striped concurrent map sparse tables are built on, checkpoint I/O,
//! and the native-thread task queue used for off-RPC-path work (§4.1, §5,
//! §4.6, §4.5).
//!
//! [`PsNode`] is the crate's entry point: one instance per PS process,
//! holding every model it hosts. Transport (`ps-server`) and the control
//! plane (`ps-scheduler`) are built on top of the operations exposed here;
//! this crate has no knowledge of sockets or RPC framing.

pub mod dense;
pub mod model;
pub mod node;
pub mod persist;
pub mod sparse;
pub mod stripe_map;
pub mod table;
pub mod task_queue;

pub use dense::DenseTable;
pub use model::ModelShard;
pub use node::{PsNode, PsStatus};
pub use sparse::SparseTable;
pub use stripe_map::StripedMap;
pub use table::Table;
pub use task_queue::AsyncTaskQueue;
