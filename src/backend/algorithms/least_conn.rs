//! Least-connections load balancing algorithm.

use crate::backend::Backend;
use std::sync::Arc;

/// Pick the alive backend with the fewest active connections.
///
/// Ties go to the backend that comes first in list order.
pub fn select(backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
    let mut selected: Option<&Arc<Backend>> = None;

    for backend in backends.iter().filter(|b| b.is_alive()) {
        match selected {
            Some(current) if current.active_connections() <= backend.active_connections() => {}
            _ => selected = Some(backend),
        }
    }

    selected.cloned()
}
