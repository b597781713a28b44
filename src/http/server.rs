//! HTTP server wrapper.

use std::future::Future;
use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{GuardError, Result};

/// An axum router bound to an address.
pub struct HttpServer {
    /// Name used in logs
    name: &'static str,
    /// Address to bind to
    addr: SocketAddr,
    /// Routes to serve
    router: Router,
}

impl HttpServer {
    /// Create a new server.
    pub fn new(name: &'static str, addr: SocketAddr, router: Router) -> Self {
        Self { name, addr, router }
    }

    /// The configured address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server stops accepting connections when `signal` resolves and
    /// returns once in-flight requests have finished.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(server = self.name, addr = %self.addr, error = %e, "Failed to bind");
            GuardError::Io(e)
        })?;

        info!(
            server = self.name,
            addr = %self.addr,
            "Starting HTTP server with graceful shutdown"
        );

        axum::serve(listener, self.router)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(server = self.name, error = %e, "HTTP server failed");
                GuardError::Serve(e.to_string())
            })
    }
}
