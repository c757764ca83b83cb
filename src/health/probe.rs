//! Liveness probes against a single backend.

use crate::config::HealthCheckMethod;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::{Position, Url};

/// Path appended to the backend's base URL for HTTP probes.
pub const HEALTH_PATH: &str = "/health";

/// Why a probe declared a backend dead.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("backend url has no host")]
    NoHost,

    #[error("connection failed: {0}")]
    Connect(std::io::Error),

    #[error("write failed: {0}")]
    Write(std::io::Error),

    #[error("read failed: {0}")]
    Read(std::io::Error),

    #[error("empty response")]
    EmptyResponse,

    #[error("invalid HTTP response")]
    InvalidResponse,

    #[error("server error: status {0}")]
    ServerError(u16),

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
}

/// Probe `url` with `method`, bounded as a whole by `limit`.
pub async fn probe(method: HealthCheckMethod, url: &Url, limit: Duration) -> Result<(), ProbeError> {
    let check = async {
        match method {
            HealthCheckMethod::Tcp => tcp_probe(url).await,
            HealthCheckMethod::Http => http_probe(url).await,
        }
    };

    timeout(limit, check)
        .await
        .map_err(|_| ProbeError::Timeout(limit))?
}

async fn connect(url: &Url) -> Result<TcpStream, ProbeError> {
    let host = url.host_str().ok_or(ProbeError::NoHost)?;
    // IPv6 literals come back bracketed
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = url.port_or_known_default().unwrap_or(80);

    TcpStream::connect((host, port))
        .await
        .map_err(ProbeError::Connect)
}

/// Connect and close immediately.
async fn tcp_probe(url: &Url) -> Result<(), ProbeError> {
    let stream = connect(url).await?;
    drop(stream);
    Ok(())
}

/// `GET <base>/health`; any status below 500 counts as alive.
async fn http_probe(url: &Url) -> Result<(), ProbeError> {
    let mut stream = connect(url).await?;

    let path = format!("{}{}", url.path().trim_end_matches('/'), HEALTH_PATH);
    let host = &url[Position::BeforeHost..Position::AfterPort];
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: proxylb-health\r\nConnection: close\r\n\r\n",
        path, host
    );

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(ProbeError::Write)?;

    // Only the status line matters
    let mut buf = vec![0u8; 1024];
    let mut filled = 0;
    loop {
        let n = stream
            .read(&mut buf[filled..])
            .await
            .map_err(ProbeError::Read)?;
        if n == 0 {
            break;
        }
        filled += n;
        if filled == buf.len() || buf[..filled].windows(2).any(|w| w == b"\r\n") {
            break;
        }
    }

    if filled == 0 {
        return Err(ProbeError::EmptyResponse);
    }

    let response = String::from_utf8_lossy(&buf[..filled]);
    let status = parse_http_status(&response)?;

    if status < 500 {
        Ok(())
    } else {
        Err(ProbeError::ServerError(status))
    }
}

/// Parse the status code from a response's status line.
fn parse_http_status(response: &str) -> Result<u16, ProbeError> {
    // Format: "HTTP/1.1 200 OK\r\n..."
    let mut parts = response.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => {
            code.parse().map_err(|_| ProbeError::InvalidResponse)
        }
        _ => Err(ProbeError::InvalidResponse),
    }
}
