//! Request dispatch to upstream backends.

mod http_proxy;

pub use http_proxy::{error_response, Dispatcher, ProxyBody, ProxyError};
