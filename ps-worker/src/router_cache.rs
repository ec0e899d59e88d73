//! The worker's cached view of the cluster router (§4.4 point 1 and 4): a
//! worker reads this on every data-plane call and only goes back to the
//! scheduler when a PS rejects a request as carrying a stale version.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use ps_errors::PsResult;
use ps_router::Router;

use crate::transport::Transport;

/// A worker-local, refreshable handle on the current [`Router`]. Cheap to
/// clone (`Arc` inside), safe to share across concurrently dispatched
/// calls.
pub struct RouterCache<T: Transport> {
    transport: Arc<T>,
    router: RwLock<Arc<Router>>,
}

impl<T: Transport> RouterCache<T> {
    /// Fetch the router once at startup (§4.4 point 1: "initial value
    /// fetched at startup").
    pub async fn bootstrap(transport: Arc<T>) -> PsResult<Self> {
        let snapshot = transport.fetch_router().await?;
        let router = Arc::new(Router::new(snapshot.version, snapshot.ps_ids));
        Ok(RouterCache {
            transport,
            router: RwLock::new(router),
        })
    }

    /// The currently cached router, without touching the network.
    pub fn current(&self) -> Arc<Router> {
        self.router.read().clone()
    }

    /// Refetch from the scheduler and replace the cached router, per §4.4
    /// point 4 ("invalidates the cache"). A concurrent refresh from
    /// another in-flight call is harmless — both converge to whatever the
    /// scheduler's latest snapshot was at the time each refresh fired.
    pub async fn refresh(&self) -> PsResult<Arc<Router>> {
        let snapshot = self.transport.fetch_router().await?;
        let router = Arc::new(Router::new(snapshot.version, snapshot.ps_ids));
        debug!(version = router.version(), "router cache refreshed");
        *self.router.write() = router.clone();
        Ok(router)
    }
}
