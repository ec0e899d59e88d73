//! Worker-side dispatch (§4.4): the router cache, request partitioning,
//! parallel per-PS RPC fan-out, stale-router refetch-and-retry, and the
//! DCT gradient-compression plug-point. A worker process is stateless
//! with respect to parameters — everything here is a pure client over
//! [`transport::Transport`], the seam `ps-server` implements concretely.

pub mod dct;
pub mod dispatch;
pub mod router_cache;
pub mod transport;

pub use dct::{DctEmitter, DctOutput, PassthroughEmitter};
pub use dispatch::WorkerClient;
pub use router_cache::RouterCache;
pub use transport::Transport;
