//! Admin HTTP server.
//!
//! Serves the control plane (`/status`, `/backends`) alongside `/metrics`
//! and `/health` on the admin port.

use crate::admin::handlers::{route, AdminContext};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Control-plane HTTP server.
pub struct AdminServer {
    listener: TcpListener,
    ctx: Arc<AdminContext>,
}

impl AdminServer {
    pub async fn bind(addr: SocketAddr, ctx: AdminContext) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(listen = %listener.local_addr()?, "admin server bound");

        Ok(Self {
            listener,
            ctx: Arc::new(ctx),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the admin server until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!("admin server starting");

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let ctx = Arc::clone(&self.ctx);

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let ctx = Arc::clone(&ctx);
                                    async move { Ok::<_, Infallible>(route(req, &ctx).await) }
                                });

                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(error = %e, "admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept admin connection");
                        }
                    }
                }

                _ = shutdown.recv() => {
                    info!("admin server shutting down");
                    break;
                }
            }
        }
    }
}
