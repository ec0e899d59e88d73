//! [`Transport`]: the seam between dispatch logic and whatever actually
//! carries a [`ps_proto::Request`] to a PS or the scheduler. This crate
//! never opens a socket — `ps-server` implements [`Transport`] over the
//! real length-prefixed `bincode`/`tokio` connection; tests implement it
//! directly against in-process fakes.

use async_trait::async_trait;

use ps_errors::PsResult;
use ps_proto::{Request, Response, RouterSnapshot};

/// Everything worker dispatch needs from the network: one call per RPC to
/// a named PS, one call per RPC to the scheduler, and a way to fetch the
/// current router snapshot (used both at startup and on refresh after a
/// stale-router rejection).
#[async_trait]
pub trait Transport: Send + Sync {
    /// `FetchRouter` against the scheduler: the current router version,
    /// membership, and addresses.
    async fn fetch_router(&self) -> PsResult<RouterSnapshot>;

    /// Issue one request against the PS node `ps_id` currently addresses,
    /// per the most recently fetched [`RouterSnapshot`].
    async fn call_ps(&self, ps_id: u64, request: Request) -> PsResult<Response>;

    /// Issue one request against the scheduler (`ApplyModelId`,
    /// `ApplyDenseTable`, `ApplySparseTable`, `IsAllPsWorking`,
    /// `TrySaveModel`/`TryLoadModel`).
    async fn call_scheduler(&self, request: Request) -> PsResult<Response>;
}
