//! Backend registry, selection strategies and the sticky-session layer.

pub mod algorithms;
mod pool;
mod server;
mod sticky;

pub use pool::{BackendStatus, PoolError, PoolStatus, ServerPool};
pub use server::{parse_backend_url, Backend, ConnectionGuard};
pub use sticky::StickySessionPool;

use crate::config::Strategy;
use std::sync::Arc;

/// Capability surface shared by the plain registry and the affinity layer.
///
/// The dispatcher, health checker and admin API only ever see this trait, so
/// either implementation can be swapped in. Selection methods return `None`
/// when no backend is alive; that is an expected outcome, not an error.
pub trait LoadBalancer: Send + Sync {
    /// Next alive backend in round-robin order.
    fn next_peer(&self) -> Option<Arc<Backend>>;

    /// Next alive backend in smooth weighted round-robin order.
    fn weighted_peer(&self) -> Option<Arc<Backend>>;

    /// Alive backend with the fewest active connections.
    fn least_conn_peer(&self) -> Option<Arc<Backend>>;

    /// Backend for a specific client. Without an affinity table this is
    /// plain round-robin.
    fn peer_for_client(&self, _client_key: &str) -> Option<Arc<Backend>> {
        self.next_peer()
    }

    /// Register a backend. Fails if its normalized URL is already present.
    fn add_backend(&self, backend: Backend) -> Result<Arc<Backend>, PoolError>;

    /// Unregister the backend matching `url` by normalized string equality.
    fn remove_backend(&self, url: &str) -> Result<Arc<Backend>, PoolError>;

    /// Set liveness of the backend matching `url`; returns the previous value.
    fn set_backend_status(&self, url: &str, alive: bool) -> Result<bool, PoolError>;

    /// Read-only snapshot of the registered backends, in order.
    fn backends(&self) -> Vec<Arc<Backend>>;

    /// Aggregate status computed from a single snapshot.
    fn status(&self) -> PoolStatus {
        PoolStatus::from_backends(&self.backends())
    }

    /// Select a backend with the given strategy.
    fn select(&self, strategy: Strategy) -> Option<Arc<Backend>> {
        match strategy {
            Strategy::RoundRobin => self.next_peer(),
            Strategy::LeastConn => self.least_conn_peer(),
            Strategy::Weighted => self.weighted_peer(),
        }
    }
}
