//! Passive health tracking.
//!
//! Demotes backends on forwarding failures seen by the dispatcher, so the
//! next selection skips them before the health checker's next round. Only
//! the active checker brings a backend back.

use crate::backend::{Backend, LoadBalancer, PoolError};
use crate::metrics::MetricsCollector;
use std::fmt::Display;
use std::sync::Arc;
use tracing::{debug, warn};

/// Records forwarding failures against the shared registry.
#[derive(Clone)]
pub struct PassiveHealthTracker {
    balancer: Arc<dyn LoadBalancer>,
    metrics: MetricsCollector,
}

impl PassiveHealthTracker {
    pub fn new(balancer: Arc<dyn LoadBalancer>, metrics: MetricsCollector) -> Self {
        Self { balancer, metrics }
    }

    /// Mark `backend` dead after a connect failure, reset or timeout.
    ///
    /// Returns whether this call flipped it from alive to dead.
    pub fn record_failure(&self, backend: &Backend, error: &dyn Display) -> bool {
        match self.balancer.set_backend_status(backend.key(), false) {
            Ok(true) => {
                warn!(backend = %backend, error = %error, "backend marked dead after forwarding failure");
                self.metrics.record_health_transition(backend.key(), false);
                true
            }
            Ok(false) => false,
            Err(PoolError::NotFound(_)) => {
                debug!(backend = %backend, "forwarding failed for a backend already removed");
                false
            }
            Err(e) => {
                warn!(backend = %backend, error = %e, "failed to mark backend dead");
                false
            }
        }
    }
}
