//! Load balancing algorithms.
//!
//! Each algorithm works on the registry's ordered backend slice and only
//! ever returns alive backends.

pub mod least_conn;
mod round_robin;
mod weighted;

pub use round_robin::RoundRobin;
pub use weighted::{SmoothWeighted, WeightMetrics};

#[cfg(test)]
pub(crate) fn test_backends(weights: &[u32]) -> Vec<std::sync::Arc<crate::backend::Backend>> {
    weights
        .iter()
        .enumerate()
        .map(|(i, &w)| {
            let url = format!("http://127.0.0.1:{}", 8001 + i);
            std::sync::Arc::new(crate::backend::Backend::parse(&url, w).unwrap())
        })
        .collect()
}
