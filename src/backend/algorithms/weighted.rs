//! Smooth weighted round-robin load balancing algorithm.
//!
//! Every selection adds each alive backend's effective weight to its running
//! score, picks the highest score and subtracts the total effective weight
//! from the winner. Over any `sum(weights)` consecutive selections with an
//! unchanged, all-alive set, backend `i` is picked exactly `w_i` times, and
//! heavy backends are interleaved with light ones instead of bunched.

use crate::backend::Backend;
use parking_lot::Mutex;
use std::sync::Arc;

/// Weight figures cached by the registry, recomputed on membership changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightMetrics {
    /// Greatest common divisor of all weights.
    pub gcd: u32,
    /// Largest weight.
    pub max: u32,
}

impl WeightMetrics {
    pub fn compute<I: IntoIterator<Item = u32>>(weights: I) -> Self {
        let (gcd, max) = weights
            .into_iter()
            .fold((0, 0), |(g, m), w| (gcd(g, w), m.max(w)));
        Self {
            gcd: gcd.max(1),
            max: max.max(1),
        }
    }

    /// All weights are equal, so weighting degenerates to plain rotation.
    pub fn is_uniform(&self) -> bool {
        self.gcd == self.max
    }
}

impl Default for WeightMetrics {
    fn default() -> Self {
        Self { gcd: 1, max: 1 }
    }
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 { a } else { gcd(b, a % b) }
}

/// Running scores for smooth weighted round-robin, one per backend slot.
#[derive(Debug, Default)]
pub struct SmoothWeighted {
    current: Mutex<Vec<i64>>,
}

impl SmoothWeighted {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restart the cycle for a backend list of `len` slots.
    pub fn reset(&self, len: usize) {
        let mut current = self.current.lock();
        current.clear();
        current.resize(len, 0);
    }

    pub fn select(&self, backends: &[Arc<Backend>], metrics: WeightMetrics) -> Option<Arc<Backend>> {
        let mut current = self.current.lock();
        if current.len() != backends.len() {
            current.clear();
            current.resize(backends.len(), 0);
        }

        let divisor = i64::from(metrics.gcd.max(1));
        let mut total = 0i64;
        let mut best: Option<usize> = None;

        for (idx, backend) in backends.iter().enumerate() {
            if !backend.is_alive() {
                current[idx] = 0;
                continue;
            }

            let effective = (i64::from(backend.weight()) / divisor).max(1);
            current[idx] += effective;
            total += effective;

            match best {
                Some(b) if current[b] >= current[idx] => {}
                _ => best = Some(idx),
            }
        }

        let best = best?;
        current[best] -= total;
        Some(Arc::clone(&backends[best]))
    }
}
