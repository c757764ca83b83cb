//! Health checking for backend servers.

mod checker;
mod passive;
mod probe;

pub use checker::HealthChecker;
pub use passive::PassiveHealthTracker;
pub use probe::{probe, ProbeError, HEALTH_PATH};
