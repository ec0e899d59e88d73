//! The cluster-wide status the scheduler tracks and enforces during
//! save/load/transfer (§4.5): a single state machine layered on top of
//! each PS's own per-node status bitmask (`ps_store::PsStatus`).

use parking_lot::RwLock;

/// The cluster's current coordinated activity. Only one of these is active
/// at a time — unlike a PS's own status bitmask, which can combine `Work`
/// with `Transfer` for tables not currently moving, the *cluster* status
/// gates whether a new save/load/transfer may begin at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterStatus {
    /// Normal operation: pushes and pulls are served.
    Work,
    /// A save is in progress cluster-wide; PS nodes reject pushes.
    Save,
    /// A load is in progress cluster-wide; PS nodes reject pushes.
    Load,
    /// A membership-change-driven shard transfer is in progress.
    Transfer,
}

/// The scheduler's single cluster-status cell, guarded so every
/// orchestration method can check-and-transition atomically relative to
/// other callers.
pub struct ClusterState {
    status: RwLock<ClusterStatus>,
}

impl Default for ClusterState {
    fn default() -> Self {
        ClusterState {
            status: RwLock::new(ClusterStatus::Work),
        }
    }
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cluster's current status.
    pub fn status(&self) -> ClusterStatus {
        *self.status.read()
    }

    /// Transition to `to` only if the cluster is currently `Work` — every
    /// coordinated operation (save, load, transfer) starts from, and
    /// returns to, `Work`; none may overlap another (§4.5, §4.6).
    pub fn begin(&self, to: ClusterStatus) -> Result<(), ClusterStatus> {
        let mut status = self.status.write();
        if *status != ClusterStatus::Work {
            return Err(*status);
        }
        *status = to;
        Ok(())
    }

    /// Return the cluster to `Work` after a coordinated operation
    /// completes (successfully or not — the caller decides whether partial
    /// progress is acceptable, per §7's no-rollback policy).
    pub fn finish(&self) {
        *self.status.write() = ClusterStatus::Work;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_succeeds_only_from_work() {
        let c = ClusterState::new();
        assert_eq!(c.status(), ClusterStatus::Work);
        c.begin(ClusterStatus::Save).unwrap();
        assert_eq!(c.status(), ClusterStatus::Save);
        assert_eq!(c.begin(ClusterStatus::Load), Err(ClusterStatus::Save));
        c.finish();
        assert_eq!(c.status(), ClusterStatus::Work);
        c.begin(ClusterStatus::Load).unwrap();
    }
}
