//! HTTP request dispatcher.
//!
//! Picks a backend for each inbound request, forwards it with a bounded
//! timeout and relays the response. Forwarding failures demote the backend.

use crate::backend::{Backend, ConnectionGuard, LoadBalancer};
use crate::config::{Config, Strategy};
use crate::health::PassiveHealthTracker;
use crate::metrics::MetricsCollector;
use crate::util::generate_request_id;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn, Span};
use url::{Position, Url};

/// Body type used on both sides of the proxy.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REQUEST_ID: &str = "x-request-id";

/// Headers that describe a single hop and are never forwarded.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forwarding error.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    #[error("upstream did not respond within {0:?}")]
    Timeout(Duration),

    #[error("invalid upstream uri: {0}")]
    InvalidUri(#[from] hyper::http::uri::InvalidUri),
}

impl ProxyError {
    /// Whether the failure is the backend's fault and should demote it.
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, ProxyError::Upstream(_) | ProxyError::Timeout(_))
    }
}

/// Per-request entry point shared by every client connection.
pub struct Dispatcher {
    balancer: Arc<dyn LoadBalancer>,
    client: Client<HttpConnector, ProxyBody>,
    strategy: Strategy,
    sticky: bool,
    timeout: Duration,
    passive: PassiveHealthTracker,
    metrics: MetricsCollector,
}

impl Dispatcher {
    pub fn new(
        balancer: Arc<dyn LoadBalancer>,
        strategy: Strategy,
        sticky: bool,
        timeout: Duration,
        metrics: MetricsCollector,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(timeout));
        let client = Client::builder(TokioExecutor::new()).build(connector);

        let passive = PassiveHealthTracker::new(Arc::clone(&balancer), metrics.clone());

        Self {
            balancer,
            client,
            strategy,
            sticky,
            timeout,
            passive,
            metrics,
        }
    }

    pub fn from_config(config: &Config, balancer: Arc<dyn LoadBalancer>, metrics: MetricsCollector) -> Self {
        Self::new(
            balancer,
            config.strategy,
            config.enable_sticky_sessions,
            config.backend_timeout,
            metrics,
        )
    }

    fn pick(&self, client_key: &str) -> Option<Arc<Backend>> {
        if self.sticky {
            self.balancer.peer_for_client(client_key)
        } else {
            self.balancer.select(self.strategy)
        }
    }

    /// Proxy one request. Never fails: errors become 502/503 responses.
    #[instrument(skip_all, fields(
        method = %req.method(),
        path = %req.uri().path(),
        client = %client_addr,
        backend = tracing::field::Empty,
        request_id = tracing::field::Empty,
    ))]
    pub async fn handle(&self, mut req: Request<ProxyBody>, client_addr: SocketAddr) -> Response<ProxyBody> {
        let client_key = client_key(req.headers(), client_addr.ip());

        let Some(backend) = self.pick(&client_key) else {
            info!("no backend available");
            self.metrics.record_unavailable();
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "no backend available");
        };
        Span::current().record("backend", tracing::field::display(&backend));

        // Released when the relayed body completes or any earlier exit drops it
        let guard = backend.acquire();

        let request_id = ensure_request_id(req.headers_mut());
        Span::current().record("request_id", request_id.as_str());

        let method = req.method().clone();
        let start = Instant::now();

        match self.forward(req, &backend, client_addr.ip()).await {
            Ok(response) => {
                let status = response.status().as_u16();
                let elapsed = start.elapsed();
                self.metrics
                    .record_request(backend.key(), method.as_str(), status, elapsed);
                debug!(status, duration_ms = elapsed.as_millis() as u64, "proxied request completed");
                relay(response, guard, &request_id)
            }
            Err(e) => {
                self.metrics
                    .record_request(backend.key(), method.as_str(), 502, start.elapsed());
                warn!(error = %e, "forwarding failed");
                if e.is_backend_failure() {
                    self.passive.record_failure(&backend, &e);
                }
                error_response(StatusCode::BAD_GATEWAY, "backend unavailable")
            }
        }
    }

    async fn forward(
        &self,
        req: Request<ProxyBody>,
        backend: &Backend,
        client_ip: IpAddr,
    ) -> Result<Response<Incoming>, ProxyError> {
        let (mut parts, body) = req.into_parts();
        parts.uri = upstream_uri(backend.url(), &parts.uri)?;
        strip_hop_by_hop(&mut parts.headers);
        append_forwarded_for(&mut parts.headers, client_ip);

        let upstream = Request::from_parts(parts, body);
        match tokio::time::timeout(self.timeout, self.client.request(upstream)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ProxyError::Timeout(self.timeout)),
        }
    }
}

/// Sticky-session key: first `X-Forwarded-For` entry, else the peer IP.
fn client_key(headers: &HeaderMap, peer: IpAddr) -> String {
    headers
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| peer.to_string())
}

/// Backend base path joined with the inbound path, inbound query kept.
fn upstream_uri(base: &Url, inbound: &Uri) -> Result<Uri, ProxyError> {
    let base_path = base.path();
    let path = inbound.path();

    let joined = match (base_path.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base_path, &path[1..]),
        (false, false) => format!("{}/{}", base_path, path),
        _ => format!("{}{}", base_path, path),
    };

    let mut uri = format!(
        "{}://{}{}",
        base.scheme(),
        &base[Position::BeforeHost..Position::AfterPort],
        joined
    );
    if let Some(query) = inbound.query() {
        uri.push('?');
        uri.push_str(query);
    }

    Ok(uri.parse()?)
}

/// Remove hop-by-hop headers, including any listed in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, client_ip: IpAddr) {
    let prior: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();

    let value = if prior.is_empty() {
        client_ip.to_string()
    } else {
        format!("{}, {}", prior.join(", "), client_ip)
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// Keep the inbound request id or mint one; returns the id in use.
fn ensure_request_id(headers: &mut HeaderMap) -> String {
    if let Some(id) = headers.get(X_REQUEST_ID).and_then(|v| v.to_str().ok()) {
        return id.to_string();
    }

    let id = generate_request_id();
    if let Ok(value) = HeaderValue::from_str(&id) {
        headers.insert(X_REQUEST_ID, value);
    }
    id
}

/// Relay the upstream response; the body owns the connection guard.
fn relay(response: Response<Incoming>, guard: ConnectionGuard, request_id: &str) -> Response<ProxyBody> {
    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    if !parts.headers.contains_key(X_REQUEST_ID) {
        if let Ok(value) = HeaderValue::from_str(request_id) {
            parts.headers.insert(X_REQUEST_ID, value);
        }
    }

    let body = body
        .map_frame(move |frame| {
            let _held = &guard;
            frame
        })
        .boxed();

    Response::from_parts(parts, body)
}

/// Create a plain-text error response.
pub fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(format!("{}\n", message)))
        .map_err(|never| match never {})
        .boxed();

    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
