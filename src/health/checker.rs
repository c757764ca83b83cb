//! Active health checker.
//!
//! Periodically probes every registered backend and updates its liveness
//! through the balancer's status setter.

use crate::backend::{Backend, LoadBalancer, PoolError};
use crate::config::HealthCheckMethod;
use crate::health::probe::probe;
use crate::metrics::MetricsCollector;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Active health checker that probes backend servers.
pub struct HealthChecker {
    balancer: Arc<dyn LoadBalancer>,
    method: HealthCheckMethod,
    interval: Duration,
    /// Per-probe timeout, shorter than `interval`.
    timeout: Duration,
    metrics: MetricsCollector,
}

impl HealthChecker {
    pub fn new(
        balancer: Arc<dyn LoadBalancer>,
        method: HealthCheckMethod,
        interval: Duration,
        timeout: Duration,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            balancer,
            method,
            interval,
            timeout,
            metrics,
        }
    }

    /// Start the health checker background task.
    ///
    /// The first round fires immediately. Rounds never wait on each other:
    /// a slow probe applies its verdict whenever it completes.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            method = ?self.method,
            interval = %humantime::format_duration(self.interval),
            timeout = %humantime::format_duration(self.timeout),
            "health checker starting"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let spawned = self.spawn_probes().len();
                    debug!(backends = spawned, "health check round started");
                }

                _ = shutdown.recv() => {
                    info!("health checker shutting down");
                    break;
                }
            }
        }
    }

    /// Run one full round and wait for every probe to finish.
    pub async fn check_now(&self) {
        futures::future::join_all(self.spawn_probes()).await;
    }

    /// Fire one probe task per backend in the current snapshot.
    fn spawn_probes(&self) -> Vec<JoinHandle<()>> {
        self.balancer
            .backends()
            .into_iter()
            .map(|backend| {
                let balancer = Arc::clone(&self.balancer);
                let metrics = self.metrics.clone();
                let method = self.method;
                let limit = self.timeout;
                tokio::spawn(async move {
                    check_backend(balancer.as_ref(), &backend, method, limit, &metrics).await;
                })
            })
            .collect()
    }
}

async fn check_backend(
    balancer: &dyn LoadBalancer,
    backend: &Backend,
    method: HealthCheckMethod,
    limit: Duration,
    metrics: &MetricsCollector,
) {
    let verdict = probe(method, backend.url(), limit).await;
    let alive = verdict.is_ok();
    metrics.record_health_check(backend.key(), alive);

    match balancer.set_backend_status(backend.key(), alive) {
        Ok(previous) if previous != alive => {
            match &verdict {
                Ok(()) => info!(backend = %backend, "backend is up"),
                Err(e) => warn!(backend = %backend, error = %e, "backend is down"),
            }
            metrics.record_health_transition(backend.key(), alive);
        }
        Ok(_) => {
            metrics.set_backend_health(backend.key(), alive);
        }
        Err(PoolError::NotFound(_)) => {
            debug!(backend = %backend, "backend removed before its probe completed");
        }
        Err(e) => {
            warn!(backend = %backend, error = %e, "failed to record probe result");
        }
    }
}
