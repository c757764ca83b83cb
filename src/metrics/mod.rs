//! Prometheus metrics collection.
//!
//! The registry is encoded and served by the admin server at `/metrics`.

mod collector;

pub use collector::MetricsCollector;
