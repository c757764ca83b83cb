//! Metrics collector using prometheus-client.
//!
//! Provides metrics for request counts, latency, rejected requests and
//! backend health.

use crate::backend::Backend;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::Duration;

/// Labels for request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub backend: String,
    pub method: String,
    pub status: String,
}

/// Labels for per-backend metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BackendLabels {
    pub backend: String,
}

/// Labels for health check metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HealthCheckLabels {
    pub backend: String,
    pub result: HealthCheckResult,
}

/// Result of a health check.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum HealthCheckResult {
    Success,
    Failure,
}

/// Labels for liveness transitions.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TransitionLabels {
    pub backend: String,
    pub to: BackendState,
}

/// Liveness state a backend moved to.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum BackendState {
    Up,
    Down,
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    /// Total proxied requests.
    requests_total: Family<RequestLabels, Counter>,
    /// Request duration histogram (in seconds).
    request_duration_seconds: Family<BackendLabels, Histogram>,
    /// Requests answered 503 because no backend was alive.
    unavailable_total: Counter,
    /// Backend liveness gauge (1 = alive, 0 = dead).
    backend_up: Family<BackendLabels, Gauge>,
    /// In-flight requests per backend, refreshed at scrape time.
    backend_connections: Family<BackendLabels, Gauge>,
    /// Health check results counter.
    health_checks_total: Family<HealthCheckLabels, Counter>,
    /// Liveness transitions counter.
    health_transitions_total: Family<TransitionLabels, Counter>,
    /// The prometheus registry.
    registry: Registry,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<RequestLabels, Counter>::default();
        let request_duration_seconds = Family::<BackendLabels, Histogram>::new_with_constructor(
            || {
                // Buckets: 1ms, 2.5ms, 6.25ms, ... ~60s
                Histogram::new(exponential_buckets(0.001, 2.5, 13))
            },
        );
        let unavailable_total = Counter::default();
        let backend_up = Family::<BackendLabels, Gauge>::default();
        let backend_connections = Family::<BackendLabels, Gauge>::default();
        let health_checks_total = Family::<HealthCheckLabels, Counter>::default();
        let health_transitions_total = Family::<TransitionLabels, Counter>::default();

        registry.register(
            "proxylb_requests",
            "Total number of proxied requests",
            requests_total.clone(),
        );
        registry.register(
            "proxylb_request_duration_seconds",
            "Time to upstream response headers in seconds",
            request_duration_seconds.clone(),
        );
        registry.register(
            "proxylb_unavailable",
            "Requests rejected because no backend was available",
            unavailable_total.clone(),
        );
        registry.register(
            "proxylb_backend_up",
            "Backend liveness (1=alive, 0=dead)",
            backend_up.clone(),
        );
        registry.register(
            "proxylb_backend_connections",
            "In-flight requests per backend",
            backend_connections.clone(),
        );
        registry.register(
            "proxylb_health_checks",
            "Total number of health probes performed",
            health_checks_total.clone(),
        );
        registry.register(
            "proxylb_health_transitions",
            "Backend liveness transitions",
            health_transitions_total.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                requests_total,
                request_duration_seconds,
                unavailable_total,
                backend_up,
                backend_connections,
                health_checks_total,
                health_transitions_total,
                registry,
            }),
        }
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Record a completed request.
    pub fn record_request(&self, backend: &str, method: &str, status: u16, duration: Duration) {
        let labels = RequestLabels {
            backend: backend.to_string(),
            method: method.to_string(),
            status: status.to_string(),
        };
        self.inner.requests_total.get_or_create(&labels).inc();

        self.inner
            .request_duration_seconds
            .get_or_create(&BackendLabels {
                backend: backend.to_string(),
            })
            .observe(duration.as_secs_f64());
    }

    /// Record a request rejected with 503.
    pub fn record_unavailable(&self) {
        self.inner.unavailable_total.inc();
    }

    /// Update backend liveness.
    pub fn set_backend_health(&self, backend: &str, alive: bool) {
        self.inner
            .backend_up
            .get_or_create(&BackendLabels {
                backend: backend.to_string(),
            })
            .set(if alive { 1 } else { 0 });
    }

    /// Refresh the per-backend gauges from a registry snapshot.
    pub fn observe_backends(&self, backends: &[Arc<Backend>]) {
        for backend in backends {
            let labels = BackendLabels {
                backend: backend.key().to_string(),
            };
            self.inner
                .backend_up
                .get_or_create(&labels)
                .set(if backend.is_alive() { 1 } else { 0 });
            self.inner
                .backend_connections
                .get_or_create(&labels)
                .set(backend.active_connections() as i64);
        }
    }

    /// Stop reporting a backend that left the registry.
    pub fn forget_backend(&self, backend: &str) {
        let labels = BackendLabels {
            backend: backend.to_string(),
        };
        self.inner.backend_up.remove(&labels);
        self.inner.backend_connections.remove(&labels);
    }

    /// Record a health check result.
    pub fn record_health_check(&self, backend: &str, success: bool) {
        let labels = HealthCheckLabels {
            backend: backend.to_string(),
            result: if success {
                HealthCheckResult::Success
            } else {
                HealthCheckResult::Failure
            },
        };
        self.inner.health_checks_total.get_or_create(&labels).inc();
    }

    /// Record a liveness transition and update the liveness gauge.
    pub fn record_health_transition(&self, backend: &str, alive: bool) {
        let labels = TransitionLabels {
            backend: backend.to_string(),
            to: if alive {
                BackendState::Up
            } else {
                BackendState::Down
            },
        };
        self.inner.health_transitions_total.get_or_create(&labels).inc();
        self.set_backend_health(backend, alive);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
