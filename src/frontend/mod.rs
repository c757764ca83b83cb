//! Client-facing proxy listener.

mod listener;

pub use listener::FrontendListener;
