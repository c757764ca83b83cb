//! Round-robin load balancing algorithm.

use crate::backend::Backend;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Round-robin load balancer.
///
/// Each call advances a shared rotation counter and scans forward from
/// `counter % len` for the first alive backend. Racing callers each get a
/// distinct start index.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    /// Create a new round-robin load balancer.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        if backends.is_empty() {
            return None;
        }

        let len = backends.len();
        let start = self.counter.fetch_add(1, Ordering::Relaxed) % len;

        (0..len)
            .map(|offset| &backends[(start + offset) % len])
            .find(|backend| backend.is_alive())
            .cloned()
    }
}
