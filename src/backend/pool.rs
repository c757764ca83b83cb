//! The backend registry.
//!
//! Owns the ordered backend list and the selection state. Structural changes
//! (add/remove) take the writer lock; selections take the read lock only long
//! enough to pick a backend and never across a network call.

use crate::backend::algorithms::{least_conn, RoundRobin, SmoothWeighted, WeightMetrics};
use crate::backend::server::backend_key;
use crate::backend::{parse_backend_url, Backend, LoadBalancer};
use crate::config::BackendEntry;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Errors returned by registry lookups and mutations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid backend url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("backend not found: {0}")]
    NotFound(String),

    #[error("backend already registered: {0}")]
    Duplicate(String),
}

/// Aggregate view of the registry, as served by `GET /status`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolStatus {
    pub total_backends: usize,
    pub active_backends: usize,
    pub backends: Vec<BackendStatus>,
}

/// Status of one backend.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BackendStatus {
    pub url: String,
    pub alive: bool,
    pub current_connections: usize,
}

impl PoolStatus {
    /// Build a status report from one consistent snapshot.
    pub fn from_backends(backends: &[Arc<Backend>]) -> Self {
        let backends: Vec<BackendStatus> = backends
            .iter()
            .map(|b| BackendStatus {
                url: b.key().to_string(),
                alive: b.is_alive(),
                current_connections: b.active_connections(),
            })
            .collect();

        Self {
            total_backends: backends.len(),
            active_backends: backends.iter().filter(|b| b.alive).count(),
            backends,
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    backends: Vec<Arc<Backend>>,
    weights: WeightMetrics,
}

/// Lock-guarded, ordered collection of backends plus selection logic.
#[derive(Debug, Default)]
pub struct ServerPool {
    state: RwLock<PoolState>,
    round_robin: RoundRobin,
    weighted: SmoothWeighted,
}

impl ServerPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pool from configured backend entries, in order.
    pub fn from_entries(entries: &[BackendEntry]) -> Result<Self, PoolError> {
        let pool = Self::new();
        for entry in entries {
            pool.add_backend(Backend::parse(&entry.url, entry.effective_weight())?)?;
        }
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.state.read().backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a backend by URL, matching on the normalized string form.
    pub fn find(&self, url: &str) -> Option<Arc<Backend>> {
        let key = normalize_key(url).ok()?;
        self.find_key(&key)
    }

    pub(crate) fn find_key(&self, key: &str) -> Option<Arc<Backend>> {
        self.state
            .read()
            .backends
            .iter()
            .find(|b| b.key() == key)
            .cloned()
    }

    /// Current cached weight metrics.
    pub fn weight_metrics(&self) -> WeightMetrics {
        self.state.read().weights
    }

    /// Recompute cached metrics and restart the weighted cycle.
    ///
    /// Must be called with the writer lock held.
    fn membership_changed(&self, state: &mut PoolState) {
        state.weights = WeightMetrics::compute(state.backends.iter().map(|b| b.weight()));
        self.weighted.reset(state.backends.len());
    }
}

fn normalize_key(url: &str) -> Result<String, PoolError> {
    parse_backend_url(url).map(|u| backend_key(&u))
}

impl LoadBalancer for ServerPool {
    fn next_peer(&self) -> Option<Arc<Backend>> {
        let state = self.state.read();
        self.round_robin.select(&state.backends)
    }

    fn weighted_peer(&self) -> Option<Arc<Backend>> {
        let state = self.state.read();
        // Uniformity is judged over every registered backend, dead ones
        // included; equal alive weights rotate the same way under smooth WRR.
        if state.weights.is_uniform() {
            return self.round_robin.select(&state.backends);
        }
        self.weighted.select(&state.backends, state.weights)
    }

    fn least_conn_peer(&self) -> Option<Arc<Backend>> {
        let state = self.state.read();
        least_conn::select(&state.backends)
    }

    fn add_backend(&self, backend: Backend) -> Result<Arc<Backend>, PoolError> {
        let backend = Arc::new(backend);
        let mut state = self.state.write();

        if state.backends.iter().any(|b| b.key() == backend.key()) {
            return Err(PoolError::Duplicate(backend.key().to_string()));
        }

        state.backends.push(Arc::clone(&backend));
        self.membership_changed(&mut state);
        let total = state.backends.len();
        drop(state);

        info!(backend = %backend, weight = backend.weight(), total, "backend added");
        Ok(backend)
    }

    fn remove_backend(&self, url: &str) -> Result<Arc<Backend>, PoolError> {
        let key = normalize_key(url)?;
        let mut state = self.state.write();

        let idx = state
            .backends
            .iter()
            .position(|b| b.key() == key)
            .ok_or_else(|| PoolError::NotFound(key.clone()))?;

        // In-flight requests keep their own Arc and drain on their own
        let removed = state.backends.remove(idx);
        self.membership_changed(&mut state);
        let total = state.backends.len();
        drop(state);

        info!(
            backend = %removed,
            active_connections = removed.active_connections(),
            total,
            "backend removed"
        );
        Ok(removed)
    }

    fn set_backend_status(&self, url: &str, alive: bool) -> Result<bool, PoolError> {
        let key = normalize_key(url)?;
        let backend = self
            .find_key(&key)
            .ok_or_else(|| PoolError::NotFound(key.clone()))?;

        let previous = backend.set_alive(alive);
        if previous != alive {
            debug!(backend = %backend, alive, "backend status changed");
        }
        Ok(previous)
    }

    fn backends(&self) -> Vec<Arc<Backend>> {
        self.state.read().backends.clone()
    }
}
