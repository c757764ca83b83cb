//! Frontend listener implementation.
//!
//! Accepts client connections and serves HTTP/1.1 on each, handing every
//! request to the dispatcher.

use crate::proxy::Dispatcher;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Client-facing listener that accepts and handles connections.
pub struct FrontendListener {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
}

impl FrontendListener {
    /// Bind the listener.
    pub async fn bind(addr: SocketAddr, dispatcher: Arc<Dispatcher>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(listen = %listener.local_addr()?, "proxy listener bound");

        Ok(Self {
            listener,
            dispatcher,
        })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the listener, accepting connections until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!("proxy listener starting");

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => self.handle_connection(stream, addr),
                        Err(e) => error!(error = %e, "failed to accept connection"),
                    }
                }

                _ = shutdown.recv() => {
                    info!("proxy listener shutting down");
                    break;
                }
            }
        }
    }

    /// Serve one client connection on its own task.
    fn handle_connection(&self, stream: TcpStream, client_addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY on client connection");
        }

        let dispatcher = Arc::clone(&self.dispatcher);

        tokio::spawn(async move {
            let start_time = Instant::now();
            let io = TokioIo::new(stream);

            let service = service_fn(move |req: Request<Incoming>| {
                let dispatcher = Arc::clone(&dispatcher);
                async move {
                    let req = req.map(|body| body.boxed());
                    Ok::<_, Infallible>(dispatcher.handle(req, client_addr).await)
                }
            });

            // Dropping the in-flight request future on disconnect cancels the upstream call
            let result = http1::Builder::new()
                .keep_alive(true)
                .serve_connection(io, service)
                .await;

            let duration_ms = start_time.elapsed().as_millis() as u64;
            match result {
                Ok(()) => debug!(client = %client_addr, duration_ms, "connection completed"),
                Err(e) => debug!(client = %client_addr, duration_ms, error = %e, "connection closed with error"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ServerPool;
    use crate::config::Strategy;
    use crate::metrics::MetricsCollector;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn dispatcher() -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            Arc::new(ServerPool::new()),
            Strategy::RoundRobin,
            false,
            Duration::from_secs(1),
            MetricsCollector::new(),
        ))
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let listener = FrontendListener::bind("127.0.0.1:0".parse().unwrap(), dispatcher())
            .await
            .unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_serves_503_without_backends() {
        let listener = FrontendListener::bind("127.0.0.1:0".parse().unwrap(), dispatcher())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(listener.run(rx));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: lb\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 503"));

        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
