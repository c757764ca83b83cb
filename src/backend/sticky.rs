//! Sticky-session affinity layer.
//!
//! Wraps a [`ServerPool`] and pins each client to the backend that first
//! served it, for as long as the client keeps coming back within the TTL.
//! Bindings hold the backend's registry key rather than the backend itself,
//! so removing a backend from the pool never has to wait on this table.

use crate::backend::{Backend, LoadBalancer, PoolError, ServerPool};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct StickySession {
    backend_key: String,
    last_seen: Instant,
}

/// Registry wrapper with a client → backend affinity table.
#[derive(Debug)]
pub struct StickySessionPool {
    pool: Arc<ServerPool>,
    sessions: DashMap<String, StickySession>,
    ttl: Duration,
}

impl StickySessionPool {
    pub fn new(pool: Arc<ServerPool>, ttl: Duration) -> Self {
        Self {
            pool,
            sessions: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of bindings currently held (expired ones included until swept).
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Resolve the backend for `client_key`.
    ///
    /// A live, unexpired binding is reused and refreshed. Otherwise the
    /// wrapped pool picks a backend round-robin and the binding is replaced.
    pub fn backend_for_client(&self, client_key: &str) -> Option<Arc<Backend>> {
        let now = Instant::now();

        let bound = self
            .sessions
            .get(client_key)
            .filter(|s| now.duration_since(s.last_seen) <= self.ttl)
            .map(|s| s.backend_key.clone());

        if let Some(key) = bound {
            if let Some(backend) = self.pool.find_key(&key).filter(|b| b.is_alive()) {
                if let Some(mut session) = self.sessions.get_mut(client_key) {
                    session.last_seen = now;
                }
                return Some(backend);
            }
        }

        let backend = self.pool.next_peer()?;
        self.sessions.insert(
            client_key.to_string(),
            StickySession {
                backend_key: backend.key().to_string(),
                last_seen: now,
            },
        );
        debug!(client = client_key, backend = %backend, "sticky session bound");
        Some(backend)
    }

    /// Drop every binding idle for longer than the TTL.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| now.duration_since(s.last_seen) <= self.ttl);
        before.saturating_sub(self.sessions.len())
    }

    /// Drop every binding pointing at `backend_key`.
    fn forget_backend(&self, backend_key: &str) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.backend_key != backend_key);
        before.saturating_sub(self.sessions.len())
    }

    /// Sweep expired bindings every TTL until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(ttl = %humantime::format_duration(self.ttl), "sticky session sweeper starting");

        let mut ticker = interval_at(Instant::now() + self.ttl, self.ttl);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let expired = self.sweep_expired();
                    if expired > 0 {
                        debug!(expired, remaining = self.sessions.len(), "expired sticky sessions");
                    }
                }

                _ = shutdown.recv() => {
                    info!("sticky session sweeper shutting down");
                    break;
                }
            }
        }
    }
}

impl LoadBalancer for StickySessionPool {
    fn next_peer(&self) -> Option<Arc<Backend>> {
        self.pool.next_peer()
    }

    fn weighted_peer(&self) -> Option<Arc<Backend>> {
        self.pool.weighted_peer()
    }

    fn least_conn_peer(&self) -> Option<Arc<Backend>> {
        self.pool.least_conn_peer()
    }

    fn peer_for_client(&self, client_key: &str) -> Option<Arc<Backend>> {
        self.backend_for_client(client_key)
    }

    fn add_backend(&self, backend: Backend) -> Result<Arc<Backend>, PoolError> {
        self.pool.add_backend(backend)
    }

    fn remove_backend(&self, url: &str) -> Result<Arc<Backend>, PoolError> {
        let removed = self.pool.remove_backend(url)?;
        let dropped = self.forget_backend(removed.key());
        if dropped > 0 {
            debug!(backend = %removed, dropped, "dropped sticky sessions for removed backend");
        }
        Ok(removed)
    }

    fn set_backend_status(&self, url: &str, alive: bool) -> Result<bool, PoolError> {
        let previous = self.pool.set_backend_status(url, alive)?;
        if !alive {
            if let Some(backend) = self.pool.find(url) {
                let dropped = self.forget_backend(backend.key());
                if dropped > 0 {
                    debug!(backend = %backend, dropped, "dropped sticky sessions for dead backend");
                }
            }
        }
        Ok(previous)
    }

    fn backends(&self) -> Vec<Arc<Backend>> {
        self.pool.backends()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendEntry;

    fn sticky(ttl: Duration) -> StickySessionPool {
        let entries: Vec<BackendEntry> = (0..3)
            .map(|i| BackendEntry {
                url: format!("http://127.0.0.1:{}", 9001 + i),
                weight: 1,
            })
            .collect();
        let pool = Arc::new(ServerPool::from_entries(&entries).unwrap());
        StickySessionPool::new(pool, ttl)
    }

    #[tokio::test(start_paused = true)]
    async fn test_binding_reused_within_ttl() {
        let sp = sticky(Duration::from_secs(1));

        let first = sp.peer_for_client("10.0.0.1").unwrap();
        tokio::time::advance(Duration::from_millis(500)).await;
        let again = sp.peer_for_client("10.0.0.1").unwrap();

        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(sp.session_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_binding_expires_after_ttl() {
        let sp = sticky(Duration::from_secs(1));

        let first = sp.peer_for_client("10.0.0.1").unwrap();
        tokio::time::advance(Duration::from_millis(1200)).await;

        // Expired bindings are ignored even before the sweeper runs
        let next = sp.peer_for_client("10.0.0.1").unwrap();
        assert!(!Arc::ptr_eq(&first, &next));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_extends_binding() {
        let sp = sticky(Duration::from_secs(1));

        let first = sp.peer_for_client("c").unwrap();
        for _ in 0..5 {
            tokio::time::advance(Duration::from_millis(800)).await;
            let again = sp.peer_for_client("c").unwrap();
            assert!(Arc::ptr_eq(&first, &again));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_idle_bindings() {
        let sp = sticky(Duration::from_secs(1));

        sp.peer_for_client("idle");
        tokio::time::advance(Duration::from_millis(700)).await;
        sp.peer_for_client("active");
        tokio::time::advance(Duration::from_millis(500)).await;

        assert_eq!(sp.sweep_expired(), 1);
        assert_eq!(sp.session_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_runs_every_ttl() {
        let sp = Arc::new(sticky(Duration::from_secs(1)));
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(Arc::clone(&sp).run_sweeper(rx));

        sp.peer_for_client("c");
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(sp.session_count(), 0);

        tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn test_dead_backend_rebinds_client() {
        let sp = sticky(Duration::from_secs(60));

        let bound = sp.peer_for_client("c").unwrap();
        sp.set_backend_status(bound.key(), false).unwrap();
        assert_eq!(sp.session_count(), 0);

        let next = sp.peer_for_client("c").unwrap();
        assert!(!Arc::ptr_eq(&bound, &next));
        assert!(next.is_alive());
    }

    #[test]
    fn test_dead_backend_skipped_even_if_binding_survives() {
        let sp = sticky(Duration::from_secs(60));

        let bound = sp.peer_for_client("c").unwrap();
        // Flip liveness underneath the affinity layer
        bound.set_alive(false);

        let next = sp.peer_for_client("c").unwrap();
        assert!(!Arc::ptr_eq(&bound, &next));
    }

    #[test]
    fn test_removed_backend_drops_bindings() {
        let sp = sticky(Duration::from_secs(60));

        let bound = sp.peer_for_client("c").unwrap();
        sp.remove_backend(bound.key()).unwrap();
        assert_eq!(sp.session_count(), 0);
        assert_eq!(sp.backends().len(), 2);

        let next = sp.peer_for_client("c").unwrap();
        assert_ne!(next.key(), bound.key());
    }

    #[test]
    fn test_no_backend_available() {
        let sp = sticky(Duration::from_secs(60));
        for b in sp.backends() {
            sp.set_backend_status(b.key(), false).unwrap();
        }
        assert!(sp.peer_for_client("c").is_none());
        assert_eq!(sp.session_count(), 0);
    }

    #[test]
    fn test_mutations_delegate_to_pool() {
        let sp = sticky(Duration::from_secs(60));
        sp.add_backend(Backend::parse("http://127.0.0.1:9100", 1).unwrap())
            .unwrap();
        assert_eq!(sp.status().total_backends, 4);
        assert!(matches!(
            sp.remove_backend("http://127.0.0.1:1"),
            Err(PoolError::NotFound(_))
        ));
    }
}
