//! Admin request routing and handlers.

use crate::backend::{Backend, LoadBalancer, PoolError};
use crate::metrics::MetricsCollector;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Body;
use hyper::header::{HeaderValue, ALLOW, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use prometheus_client::encoding::text::encode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// What every admin handler needs.
#[derive(Clone)]
pub struct AdminContext {
    pub balancer: Arc<dyn LoadBalancer>,
    pub metrics: MetricsCollector,
}

/// Body of `POST /backends` and `DELETE /backends`.
#[derive(Debug, Deserialize)]
struct BackendRequest {
    url: String,
    #[serde(default)]
    weight: u32,
}

#[derive(Debug, Serialize)]
struct MutationResponse<'a> {
    message: &'a str,
    url: &'a str,
}

#[derive(Debug, Serialize)]
struct ErrorResponse<'a> {
    error: &'a str,
}

/// Route one admin request.
pub async fn route<B>(req: Request<B>, ctx: &AdminContext) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    debug!(%method, %path, "admin request");

    match (path.as_str(), &method) {
        ("/status", &Method::GET) => status(ctx),
        ("/status", _) => method_not_allowed("GET"),
        ("/backends", &Method::POST) => match read_backend_request(req).await {
            Ok(body) => add_backend(ctx, body),
            Err(resp) => resp,
        },
        ("/backends", &Method::DELETE) => match read_backend_request(req).await {
            Ok(body) => remove_backend(ctx, body),
            Err(resp) => resp,
        },
        ("/backends", _) => method_not_allowed("POST, DELETE"),
        ("/metrics", &Method::GET) => metrics(ctx),
        ("/metrics", _) => method_not_allowed("GET"),
        ("/health", &Method::GET) => text(StatusCode::OK, "ok\n"),
        ("/health", _) => method_not_allowed("GET"),
        _ => error_json(StatusCode::NOT_FOUND, "not found"),
    }
}

fn status(ctx: &AdminContext) -> Response<Full<Bytes>> {
    let status = ctx.balancer.status();
    debug!(
        active = status.active_backends,
        total = status.total_backends,
        "status requested"
    );
    json(StatusCode::OK, &status)
}

fn add_backend(ctx: &AdminContext, req: BackendRequest) -> Response<Full<Bytes>> {
    let result = Backend::parse(&req.url, req.weight).and_then(|b| ctx.balancer.add_backend(b));

    match result {
        Ok(backend) => {
            ctx.metrics.set_backend_health(backend.key(), backend.is_alive());
            json(
                StatusCode::CREATED,
                &MutationResponse {
                    message: "backend added",
                    url: backend.key(),
                },
            )
        }
        Err(e @ PoolError::Duplicate(_)) => error_json(StatusCode::CONFLICT, &e.to_string()),
        Err(e) => error_json(StatusCode::BAD_REQUEST, &e.to_string()),
    }
}

fn remove_backend(ctx: &AdminContext, req: BackendRequest) -> Response<Full<Bytes>> {
    match ctx.balancer.remove_backend(&req.url) {
        Ok(backend) => {
            ctx.metrics.forget_backend(backend.key());
            json(
                StatusCode::OK,
                &MutationResponse {
                    message: "backend removed",
                    url: backend.key(),
                },
            )
        }
        Err(e @ PoolError::NotFound(_)) => {
            info!(url = %req.url, "delete requested for unknown backend");
            error_json(StatusCode::NOT_FOUND, &e.to_string())
        }
        Err(e) => error_json(StatusCode::BAD_REQUEST, &e.to_string()),
    }
}

fn metrics(ctx: &AdminContext) -> Response<Full<Bytes>> {
    ctx.metrics.observe_backends(&ctx.balancer.backends());

    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, ctx.metrics.registry()) {
        error!(error = %e, "failed to encode metrics");
        return text(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics\n");
    }

    let mut resp = Response::new(Full::new(Bytes::from(buffer)));
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/openmetrics-text; version=1.0.0; charset=utf-8"),
    );
    resp
}

/// Read and decode a bounded JSON body, or produce the 400 to send back.
async fn read_backend_request<B>(req: Request<B>) -> Result<BackendRequest, Response<Full<Bytes>>>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let bytes = Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| {
            debug!(error = %e, "failed to read admin request body");
            error_json(StatusCode::BAD_REQUEST, "request body unreadable or too large")
        })?
        .to_bytes();

    serde_json::from_slice(&bytes)
        .map_err(|e| error_json(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e)))
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut resp = Response::new(Full::new(Bytes::from(body)));
            *resp.status_mut() = status;
            resp.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            resp
        }
        Err(e) => {
            error!(error = %e, "failed to serialize admin response");
            text(StatusCode::INTERNAL_SERVER_ERROR, "internal error\n")
        }
    }
}

fn error_json(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json(status, &ErrorResponse { error: message })
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    resp
}

fn method_not_allowed(allow: &'static str) -> Response<Full<Bytes>> {
    let mut resp = error_json(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    resp.headers_mut()
        .insert(ALLOW, HeaderValue::from_static(allow));
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{PoolStatus, ServerPool};
    use serde_json::Value;

    fn context() -> (Arc<ServerPool>, AdminContext) {
        let pool = Arc::new(ServerPool::new());
        let ctx = AdminContext {
            balancer: pool.clone(),
            metrics: MetricsCollector::new(),
        };
        (pool, ctx)
    }

    fn request(method: Method, path: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn body_json(resp: Response<Full<Bytes>>) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_add_backend() {
        let (pool, ctx) = context();
        let resp = route(
            request(Method::POST, "/backends", r#"{"url": "http://127.0.0.1:9001/"}"#),
            &ctx,
        )
        .await;

        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = body_json(resp).await;
        assert_eq!(body["url"], "http://127.0.0.1:9001");
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.backends()[0].weight(), 1);
    }

    #[tokio::test]
    async fn test_add_backend_with_weight() {
        let (pool, ctx) = context();
        let resp = route(
            request(Method::POST, "/backends", r#"{"url": "http://127.0.0.1:9001", "weight": 4}"#),
            &ctx,
        )
        .await;

        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(pool.backends()[0].weight(), 4);
    }

    #[tokio::test]
    async fn test_add_duplicate_conflicts() {
        let (pool, ctx) = context();
        let body = r#"{"url": "http://127.0.0.1:9001"}"#;
        route(request(Method::POST, "/backends", body), &ctx).await;
        let resp = route(request(Method::POST, "/backends", body), &ctx).await;

        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_add_rejects_bad_input() {
        let (pool, ctx) = context();

        let resp = route(request(Method::POST, "/backends", "{not json"), &ctx).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = route(request(Method::POST, "/backends", r#"{"url": "ftp://host"}"#), &ctx).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = route(request(Method::POST, "/backends", r#"{"url": "not a url"}"#), &ctx).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let (_pool, ctx) = context();
        let huge = format!(r#"{{"url": "http://127.0.0.1:9001", "pad": "{}"}}"#, "x".repeat(MAX_BODY_BYTES));
        let resp = route(request(Method::POST, "/backends", &huge), &ctx).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_backend() {
        let (pool, ctx) = context();
        pool.add_backend(Backend::parse("http://127.0.0.1:9001", 1).unwrap())
            .unwrap();

        let resp = route(
            request(Method::DELETE, "/backends", r#"{"url": "http://127.0.0.1:9001/"}"#),
            &ctx,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(pool.is_empty());

        let resp = route(
            request(Method::DELETE, "/backends", r#"{"url": "http://127.0.0.1:9001"}"#),
            &ctx,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status() {
        let (pool, ctx) = context();
        pool.add_backend(Backend::parse("http://127.0.0.1:9001", 1).unwrap())
            .unwrap();
        pool.add_backend(Backend::parse("http://127.0.0.1:9002", 1).unwrap())
            .unwrap();
        pool.set_backend_status("http://127.0.0.1:9002", false).unwrap();

        let resp = route(request(Method::GET, "/status", ""), &ctx).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(resp).await;
        assert_eq!(body["total_backends"], 2);
        assert_eq!(body["active_backends"], 1);
        assert_eq!(body["backends"][1]["alive"], false);
        assert_eq!(body["backends"][0]["current_connections"], 0);

        let expected: PoolStatus = pool.status();
        assert_eq!(body, serde_json::to_value(expected).unwrap());
    }

    #[tokio::test]
    async fn test_metrics_and_health() {
        let (pool, ctx) = context();
        pool.add_backend(Backend::parse("http://127.0.0.1:9001", 1).unwrap())
            .unwrap();

        let resp = route(request(Method::GET, "/metrics", ""), &ctx).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&bytes).contains("proxylb_backend_up"));

        let resp = route(request(Method::GET, "/health", ""), &ctx).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_routes_and_methods() {
        let (_pool, ctx) = context();

        let resp = route(request(Method::GET, "/nope", ""), &ctx).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = route(request(Method::PUT, "/backends", ""), &ctx).await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(resp.headers()[ALLOW], "POST, DELETE");

        let resp = route(request(Method::POST, "/status", ""), &ctx).await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
