//! Shared application state.

use crate::backend::{Backend, LoadBalancer, PoolError, ServerPool, StickySessionPool};
use crate::config::Config;
use crate::metrics::MetricsCollector;
use crate::util::ShutdownSignal;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::{info, warn};

/// Backend changes made while applying a reloaded configuration.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReloadSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Settings that only take effect after a restart.
    pub restart_required: Vec<&'static str>,
}

/// Shared state accessible from all tasks.
#[derive(Clone)]
pub struct AppState {
    /// Current configuration (swapped atomically on hot reload).
    config: Arc<ArcSwap<Config>>,

    /// The selection surface every task talks to.
    balancer: Arc<dyn LoadBalancer>,

    /// Affinity layer, when sticky sessions are enabled.
    sticky: Option<Arc<StickySessionPool>>,

    metrics: MetricsCollector,

    shutdown: ShutdownSignal,
}

impl AppState {
    /// Build the registry (and affinity layer, if enabled) from `config`.
    pub fn new(config: Config) -> Result<Self, PoolError> {
        let pool = Arc::new(ServerPool::from_entries(&config.backends)?);
        let metrics = MetricsCollector::new();
        for backend in pool.backends() {
            metrics.set_backend_health(backend.key(), backend.is_alive());
        }

        let sticky = config
            .enable_sticky_sessions
            .then(|| Arc::new(StickySessionPool::new(Arc::clone(&pool), config.sticky_session_ttl)));

        let balancer: Arc<dyn LoadBalancer> = match &sticky {
            Some(sticky) => Arc::clone(sticky) as Arc<dyn LoadBalancer>,
            None => pool,
        };

        Ok(Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            balancer,
            sticky,
            metrics,
            shutdown: ShutdownSignal::new(),
        })
    }

    /// Get the current configuration.
    pub fn config(&self) -> arc_swap::Guard<Arc<Config>> {
        self.config.load()
    }

    pub fn balancer(&self) -> &Arc<dyn LoadBalancer> {
        &self.balancer
    }

    pub fn sticky(&self) -> Option<&Arc<StickySessionPool>> {
        self.sticky.as_ref()
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Get the shutdown signal.
    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Apply a reloaded configuration.
    ///
    /// The backend list is reconciled against the registry; everything else
    /// is swapped in but only read again at the next restart.
    pub fn apply_config(&self, new_config: Config) -> ReloadSummary {
        let current = self.config.load_full();
        let mut summary = ReloadSummary {
            restart_required: restart_required(&current, &new_config),
            ..Default::default()
        };

        let mut wanted: Vec<Backend> = Vec::new();
        for entry in &new_config.backends {
            match Backend::parse(&entry.url, entry.effective_weight()) {
                Ok(backend) => wanted.push(backend),
                Err(e) => warn!(error = %e, "skipping invalid backend in reloaded config"),
            }
        }

        // Unchanged backends stay registered, keeping their counters and liveness
        for existing in self.balancer.backends() {
            let unchanged = wanted
                .iter()
                .position(|b| b.key() == existing.key() && b.weight() == existing.weight());
            if let Some(idx) = unchanged {
                wanted.remove(idx);
                continue;
            }
            if self.balancer.remove_backend(existing.key()).is_ok() {
                self.metrics.forget_backend(existing.key());
                summary.removed.push(existing.key().to_string());
            }
        }

        for backend in wanted {
            match self.balancer.add_backend(backend) {
                Ok(added) => {
                    self.metrics.set_backend_health(added.key(), added.is_alive());
                    summary.added.push(added.key().to_string());
                }
                Err(e) => warn!(error = %e, "failed to add backend from reloaded config"),
            }
        }

        for setting in &summary.restart_required {
            warn!(setting, "changed setting takes effect after restart");
        }
        info!(
            added = summary.added.len(),
            removed = summary.removed.len(),
            total = self.balancer.backends().len(),
            "configuration reloaded"
        );

        self.config.store(Arc::new(new_config));
        summary
    }
}

fn restart_required(old: &Config, new: &Config) -> Vec<&'static str> {
    let mut changed = Vec::new();
    let mut check = |name: &'static str, differs: bool| {
        if differs {
            changed.push(name);
        }
    };

    check("port", old.port != new.port);
    check("admin_port", old.admin_port != new.admin_port);
    check("bind_address", old.bind_address != new.bind_address);
    check("strategy", old.strategy != new.strategy);
    check("health_check_method", old.health_check_method != new.health_check_method);
    check(
        "health_check_frequency",
        old.health_check_frequency != new.health_check_frequency,
    );
    check("health_check_timeout", old.probe_timeout() != new.probe_timeout());
    check("backend_timeout", old.backend_timeout != new.backend_timeout);
    check(
        "enable_sticky_sessions",
        old.enable_sticky_sessions != new.enable_sticky_sessions,
    );
    check("sticky_session_ttl", old.sticky_session_ttl != new.sticky_session_ttl);
    check("log_level", old.log_level != new.log_level);
    check("log_format", old.log_format != new.log_format);

    changed
}
