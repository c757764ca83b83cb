//! proxylb - an HTTP reverse-proxy load balancer
//!
//! This crate provides:
//! - A concurrent backend registry with round-robin, smooth weighted
//!   round-robin and least-connections selection
//! - Sticky sessions with idle expiry
//! - Active (TCP/HTTP) and passive health checking
//! - An admin API for runtime backend changes and status
//! - Hot configuration reload and Prometheus metrics

pub mod admin;
pub mod backend;
pub mod config;
pub mod frontend;
pub mod health;
pub mod metrics;
pub mod proxy;
pub mod state;
pub mod util;

pub use config::Config;
pub use state::AppState;
