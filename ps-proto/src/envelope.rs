//! The top-level [`Request`]/[`Response`] envelopes multiplexed over one
//! connection per (worker, PS) or (worker, scheduler) pair, mirroring how
//! the teacher workspace's table client multiplexes several RPC kinds
//! over a single `tokio-tower` connection rather than opening one socket
//! per call.

use serde::{Deserialize, Serialize};

use crate::messages::*;

/// Every request kind a PS or scheduler node can receive, tagged by
/// variant (the wire format's "enumerations serialize as u8" rule, as
/// `bincode` encodes a unit-like enum discriminant).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    ApplyModelId(apply_model_id::Request),
    ApplyDenseTable(apply_dense_table::Request),
    ApplySparseTable(apply_sparse_table::Request),
    RegisterPs(register_ps::Request),
    RegisterWorker(register_worker::Request),
    FetchRouter(fetch_router::Request),
    RegisterModel(register_model::Request),
    RegisterDenseTable(register_dense_table::Request),
    RegisterSparseTable(register_sparse_table::Request),
    TransferDense(transfer_dense::Request),
    TakeDenseTable(take_dense_table::Request),
    TransferSparse(transfer_sparse::Request),
    SparseKeys(sparse_keys::Request),
    DrainSparseKeys(drain_sparse_keys::Request),
    AdoptRouterVersion(adopt_router_version::Request),
    SetStatus(set_status::Request),
    PullDense(pull_dense::Request),
    PushDense(push_dense::Request),
    PullSparse(pull_sparse::Request),
    PushSparse(push_sparse::Request),
    TryFetchDense(try_fetch_dense::Request),
    TryFetchSparse(try_fetch_sparse::Request),
    TryFetchSparseMeta(try_fetch_sparse_meta::Request),
    NotifySaveModel(notify_persist::Request),
    NotifyLoadModel(notify_persist::Request),
    TrySaveModel(try_persist::Request),
    TryLoadModel(try_persist::Request),
    IsAllPsWorking(is_all_ps_working::Request),
}

/// The response counterpart to [`Request`]. A handler that receives
/// `Request::PullDense` always answers with `Response::PullDense`; the
/// pairing is enforced at the call site (`ps-worker`/`ps-server`), not by
/// the type system, matching the teacher's own request/response enum
/// pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    ApplyModelId(apply_model_id::Response),
    ApplyDenseTable(apply_dense_table::Response),
    ApplySparseTable(apply_sparse_table::Response),
    RegisterPs(register_ps::Response),
    RegisterWorker(register_worker::Response),
    FetchRouter(fetch_router::Response),
    RegisterModel(register_model::Response),
    RegisterDenseTable(register_dense_table::Response),
    RegisterSparseTable(register_sparse_table::Response),
    TransferDense(transfer_dense::Response),
    TakeDenseTable(take_dense_table::Response),
    TransferSparse(transfer_sparse::Response),
    SparseKeys(sparse_keys::Response),
    DrainSparseKeys(drain_sparse_keys::Response),
    AdoptRouterVersion(adopt_router_version::Response),
    SetStatus(set_status::Response),
    PullDense(pull_dense::Response),
    PushDense(push_dense::Response),
    PullSparse(pull_sparse::Response),
    PushSparse(push_sparse::Response),
    TryFetchDense(try_fetch_dense::Response),
    TryFetchSparse(try_fetch_sparse::Response),
    TryFetchSparseMeta(try_fetch_sparse_meta::Response),
    NotifySaveModel(notify_persist::Response),
    NotifyLoadModel(notify_persist::Response),
    TrySaveModel(try_persist::Response),
    TryLoadModel(try_persist::Response),
    IsAllPsWorking(is_all_ps_working::Response),
    /// An error occurred servicing the request; carries the error so the
    /// caller can match on `PsError::is_stale_router()` / `is_fatal()`
    /// without a second round trip.
    Error(ps_errors::PsError),
}

impl Response {
    /// Whether this response carries an RPC-level error (as opposed to an
    /// `Ok` sub-response that may itself carry per-item failures).
    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error(_))
    }
}
