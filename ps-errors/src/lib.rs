//! Error types shared by every crate in the parameter server workspace.
//!
//! All fallible operations in the core — the table store, the router, the
//! worker dispatcher, and the scheduler control plane — return
//! [`PsResult<T>`], an alias for `Result<T, PsError>`. [`PsError`] enumerates
//! the error kinds in the error-handling design: shape/type mismatches are
//! surfaced verbatim to callers, `StaleRouterVersion` drives the worker's
//! one-shot router refetch-and-retry, and `InvariantViolation` is fatal on a
//! PS (see [`PsError::is_fatal`]).

use std::fmt;

use serde::{Deserialize, Serialize};

/// The crate-wide result alias.
pub type PsResult<T> = Result<T, PsError>;

/// Every error kind a parameter server node can produce, per the error
/// handling design.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum PsError {
    /// A gradient or pulled tensor's shape didn't match the table's.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// The shape the table/value expected.
        expected: Vec<usize>,
        /// The shape that was actually supplied.
        actual: Vec<usize>,
    },

    /// A gradient or pulled tensor's element type didn't match the table's.
    #[error("element type mismatch: expected {expected}, got {actual}")]
    ElementTypeMismatch {
        /// The expected element type, rendered via `Display`.
        expected: String,
        /// The actual element type, rendered via `Display`.
        actual: String,
    },

    /// A request named a table id this PS (or model) doesn't know about.
    #[error("unknown table {0}")]
    UnknownTable(u64),

    /// A request named a model id the scheduler doesn't know about.
    #[error("unknown model {0}")]
    UnknownModel(u64),

    /// Attempted to register a table/model name that already exists.
    #[error("duplicate name {0:?}")]
    DuplicateName(String),

    /// A data-plane RPC carried a `router_version` older than the PS's
    /// current version. The caller must refetch the router and retry
    /// exactly once; a second stale result is surfaced to the caller.
    #[error("stale router version: request carried {request}, current is {current}")]
    StaleRouterVersion {
        /// The version the request was tagged with.
        request: u64,
        /// The PS's (or router's) current version.
        current: u64,
    },

    /// A PS (or the scheduler) could not be reached.
    #[error("node unreachable: {0}")]
    NodeUnreachable(String),

    /// The cluster (or a specific PS) is mid save/load/transfer and cannot
    /// currently service the request.
    #[error("cluster busy: {0}")]
    ClusterBusy(String),

    /// A checkpoint read or write failed.
    #[error("io error: {0}")]
    IoError(String),

    /// An internal invariant was violated. Fatal on a PS: the node should
    /// abort rather than continue operating on corrupt state.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A catch-all for conditions that should be structurally impossible
    /// but that we still want propagated as an error rather than a panic at
    /// the call site (mirrors the teacher workspace's `internal!`-raised
    /// errors).
    #[error("internal error: {0}")]
    Internal(String),
}

impl PsError {
    /// Whether this error indicates the PS's local state may be corrupt and
    /// the node should abort rather than keep serving requests.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PsError::InvariantViolation(_))
    }

    /// Whether a worker should refetch the router and retry the request
    /// exactly once.
    pub fn is_stale_router(&self) -> bool {
        matches!(self, PsError::StaleRouterVersion { .. })
    }

    /// Construct an [`PsError::Internal`] from a `Display`-able value.
    pub fn internal(msg: impl fmt::Display) -> Self {
        PsError::Internal(msg.to_string())
    }
}

impl From<std::io::Error> for PsError {
    fn from(e: std::io::Error) -> Self {
        PsError::IoError(e.to_string())
    }
}

/// Construct a [`PsError::Internal`], `format!`-style. Mirrors the
/// `internal!` helper the rest of the ecosystem (and this workspace's own
/// call sites) use to raise a structured error instead of panicking.
#[macro_export]
macro_rules! internal {
    ($($tt:tt)*) => {
        return Err($crate::PsError::Internal(format!($($tt)*)))
    };
}

/// Assert an invariant, raising [`PsError::InvariantViolation`] (rather than
/// panicking) if it doesn't hold.
#[macro_export]
macro_rules! invariant {
    ($cond:expr) => {
        if !$cond {
            return Err($crate::PsError::InvariantViolation(format!(
                "invariant failed: {}",
                stringify!($cond)
            )));
        }
    };
    ($cond:expr, $($tt:tt)*) => {
        if !$cond {
            return Err($crate::PsError::InvariantViolation(format!($($tt)*)));
        }
    };
}

/// Assert two values are equal, raising [`PsError::InvariantViolation`]
/// (rather than panicking) if they aren't.
#[macro_export]
macro_rules! invariant_eq {
    ($left:expr, $right:expr) => {
        if $left != $right {
            return Err($crate::PsError::InvariantViolation(format!(
                "invariant failed: {} ({:?}) != {} ({:?})",
                stringify!($left),
                $left,
                stringify!($right),
                $right,
            )));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_router_is_retryable_not_fatal() {
        let e = PsError::StaleRouterVersion {
            request: 4,
            current: 5,
        };
        assert!(e.is_stale_router());
        assert!(!e.is_fatal());
    }

    #[test]
    fn invariant_violation_is_fatal() {
        let e = PsError::InvariantViolation("corrupt state".into());
        assert!(e.is_fatal());
        assert!(!e.is_stale_router());
    }

    fn check_invariant(x: i32) -> PsResult<()> {
        invariant!(x > 0, "x must be positive, got {x}");
        Ok(())
    }

    #[test]
    fn invariant_macro_raises_error_not_panic() {
        assert!(check_invariant(1).is_ok());
        assert!(matches!(
            check_invariant(-1),
            Err(PsError::InvariantViolation(_))
        ));
    }
}
