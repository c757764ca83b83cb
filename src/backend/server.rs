//! A single upstream backend server.

use crate::backend::PoolError;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::error;
use url::Url;

/// Parse and normalize a backend base URL.
///
/// Two spellings of the same endpoint normalize to the same URL: scheme and
/// host are lowercased, default ports dropped, query and fragment removed and
/// trailing slashes trimmed from the path. Only plain `http` is proxied.
pub fn parse_backend_url(raw: &str) -> Result<Url, PoolError> {
    let invalid = |reason: String| PoolError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };

    let mut url = Url::parse(raw.trim()).map_err(|e| invalid(e.to_string()))?;

    if url.scheme() != "http" {
        return Err(invalid(format!(
            "unsupported scheme '{}', only http is supported",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }

    normalize(&mut url);
    Ok(url)
}

/// Strip query and fragment and trim trailing slashes from the path.
fn normalize(url: &mut Url) {
    url.set_query(None);
    url.set_fragment(None);
    let path = url.path().trim_end_matches('/').to_string();
    url.set_path(&path);
}

/// Registry key for a normalized URL (no trailing root slash).
pub(crate) fn backend_key(url: &Url) -> String {
    url.as_str().trim_end_matches('/').to_string()
}

/// One upstream target with liveness and load counters.
#[derive(Debug)]
pub struct Backend {
    /// Normalized base URL.
    url: Url,
    /// Normalized string form used for every lookup.
    key: String,
    /// Liveness flag, optimistic at creation.
    alive: AtomicBool,
    /// Requests currently routed to this backend.
    active_connections: AtomicUsize,
    /// Static weight for weighted round-robin, at least 1.
    weight: u32,
}

impl Backend {
    /// Create a backend from a parsed URL, normalizing it first so the key
    /// matches later lookups by any equivalent spelling.
    pub fn new(mut url: Url, weight: u32) -> Self {
        normalize(&mut url);
        let key = backend_key(&url);
        Self {
            url,
            key,
            alive: AtomicBool::new(true),
            active_connections: AtomicUsize::new(0),
            weight: weight.max(1),
        }
    }

    /// Parse a raw URL and create a backend from it.
    pub fn parse(raw: &str, weight: u32) -> Result<Self, PoolError> {
        parse_backend_url(raw).map(|url| Self::new(url, weight))
    }

    /// Normalized base URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Normalized string form, e.g. `http://127.0.0.1:9001`.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Set liveness and return the previous value.
    pub fn set_alive(&self, alive: bool) -> bool {
        self.alive.swap(alive, Ordering::AcqRel)
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    /// Count a request against this backend until the guard is dropped.
    pub fn acquire(self: &Arc<Self>) -> ConnectionGuard {
        self.active_connections.fetch_add(1, Ordering::AcqRel);
        ConnectionGuard {
            backend: Arc::clone(self),
        }
    }

    fn release(&self) {
        let released = self
            .active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if released.is_err() {
            error!(backend = %self.key, "connection counter underflow");
            debug_assert!(false, "connection counter underflow on {}", self.key);
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Scoped hold on a backend's connection counter.
///
/// The counter is incremented by [`Backend::acquire`] and decremented exactly
/// once when the guard drops, whichever way the request ends.
#[derive(Debug)]
pub struct ConnectionGuard {
    backend: Arc<Backend>,
}

impl ConnectionGuard {
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.backend.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization_matches_equivalent_spellings() {
        let a = parse_backend_url("http://LocalHost:80/").unwrap();
        let b = parse_backend_url("http://localhost").unwrap();
        assert_eq!(backend_key(&a), backend_key(&b));
        assert_eq!(backend_key(&a), "http://localhost");

        let c = parse_backend_url("http://10.0.0.1:8080/api/?x=1#frag").unwrap();
        assert_eq!(backend_key(&c), "http://10.0.0.1:8080/api");
    }

    #[test]
    fn test_rejects_bad_urls() {
        assert!(parse_backend_url("not a url").is_err());
        assert!(parse_backend_url("https://example.com").is_err());
        assert!(parse_backend_url("ftp://example.com").is_err());
        assert!(parse_backend_url("").is_err());
    }

    #[test]
    fn test_new_normalizes_unparsed_url() {
        let url = Url::parse("http://H:80/x/?q=1#top").unwrap();
        let backend = Backend::new(url, 1);
        assert_eq!(backend.key(), "http://h/x");
        assert_eq!(backend.key(), backend_key(&parse_backend_url("http://h/x/").unwrap()));
    }

    #[test]
    fn test_backend_defaults() {
        let backend = Backend::parse("http://127.0.0.1:9001", 0).unwrap();
        assert!(backend.is_alive());
        assert_eq!(backend.weight(), 1);
        assert_eq!(backend.active_connections(), 0);
        assert_eq!(backend.to_string(), "http://127.0.0.1:9001");
    }

    #[test]
    fn test_set_alive_returns_previous() {
        let backend = Backend::parse("http://127.0.0.1:9001", 1).unwrap();
        assert!(backend.set_alive(false));
        assert!(!backend.set_alive(false));
        assert!(!backend.set_alive(true));
        assert!(backend.is_alive());
    }

    #[test]
    fn test_connection_guard_scoping() {
        let backend = Arc::new(Backend::parse("http://127.0.0.1:9001", 1).unwrap());

        let g1 = backend.acquire();
        let g2 = backend.acquire();
        assert_eq!(backend.active_connections(), 2);
        assert!(Arc::ptr_eq(g1.backend(), &backend));

        drop(g1);
        assert_eq!(backend.active_connections(), 1);
        drop(g2);
        assert_eq!(backend.active_connections(), 0);
    }
}
