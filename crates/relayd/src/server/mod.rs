//! Unix socket server for the relay.
//!
//! The server:
//! - Listens on a Unix socket for client connections
//! - Runs the handshake and then a worker for each client in a tracked task
//! - On cancellation, stops accepting and runs the shutdown coordinator
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   RelayServer   │
//! │  UnixListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ handshake +     │────▶│  RegistryHandle │
//! │ Worker (per     │     └─────────────────┘
//! │ user)           │────▶ SessionLockTable ──▶ other users' sockets
//! └─────────────────┘────▶ AuditPipeline    ──▶ log file
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept errors are logged and the loop keeps going

mod connection;
mod context;
mod router;
mod shutdown;

pub use connection::{disconnect, handshake, ConnectionError, Worker};
pub use context::{DeliveryError, ServerContext};
pub use router::{route, Flow, Origin};
pub use shutdown::{coordinate_shutdown, ShutdownReport};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::audit::AuditPipeline;
use crate::config::ServerConfig;
use crate::registry::RegistryHandle;

/// Unix socket server for the relay.
pub struct RelayServer {
    ctx: Arc<ServerContext>,
    cancel_token: CancellationToken,
    connection_counter: AtomicU64,
}

impl RelayServer {
    /// Creates a server over an already running registry and audit pipeline.
    ///
    /// Cancelling `cancel_token` stops the accept loop and starts shutdown.
    pub fn new(
        config: ServerConfig,
        registry: RegistryHandle,
        audit: AuditPipeline,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            ctx: Arc::new(ServerContext::new(config, registry, audit)),
            cancel_token,
            connection_counter: AtomicU64::new(0),
        }
    }

    /// Returns the socket path.
    pub fn socket_path(&self) -> &Path {
        self.ctx.config().socket_path()
    }

    /// Shared state, for inspection.
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Binds the socket, accepts until cancelled, then shuts down.
    ///
    /// Fails only if the socket cannot be set up; no client is ever
    /// accepted in that case.
    pub async fn run(&self) -> Result<ShutdownReport, ServerError> {
        let listener = self.bind()?;

        info!(socket = %self.socket_path().display(), "Relay server listening");

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let n = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            self.handle_connection(stream, n);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        drop(listener);
        let report = coordinate_shutdown(&self.ctx).await;
        self.cleanup();
        Ok(report)
    }

    fn bind(&self) -> Result<UnixListener, ServerError> {
        let path = self.socket_path();
        let setup_error = |e: std::io::Error| ServerError::SocketSetup {
            path: path.to_path_buf(),
            error: e.to_string(),
        };

        // Remove a stale socket file left by an earlier run
        if path.exists() {
            std::fs::remove_file(path).map_err(setup_error)?;
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(setup_error)?;
            }
        }

        UnixListener::bind(path).map_err(setup_error)
    }

    fn handle_connection(&self, stream: UnixStream, connection: u64) {
        let (reader, writer) = stream.into_split();
        let ctx = Arc::clone(&self.ctx);
        self.ctx
            .tracker()
            .spawn(connection::serve(ctx, reader, writer, connection));
    }

    fn cleanup(&self) {
        let path = self.socket_path();
        if path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(socket = %path.display(), error = %e, "Failed to remove socket file");
            }
        }
        info!("Server cleanup complete");
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to setup socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },
}
