//! Unix socket control server.
//!
//! The server:
//! - Listens on a Unix socket for control clients
//! - Spawns a [`ConnectionHandler`] for each client
//! - Routes every request to the [`ManagerHandle`]
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  ControlServer  │
//! │  UnixListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionHandler│────▶│  ManagerHandle  │
//! │   (per client)  │     │                 │
//! └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept errors are logged and the server keeps listening

mod connection;

pub use connection::{ConnectionError, ConnectionHandler};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::manager::ManagerHandle;

/// Socket path used when neither config nor environment names one.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/tierd.sock";

/// Unix socket server exposing the control surface.
pub struct ControlServer {
    socket_path: PathBuf,
    manager: ManagerHandle,
    cancel_token: CancellationToken,
    connection_counter: AtomicU64,
    connections: TaskTracker,
}

impl ControlServer {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        manager: ManagerHandle,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            manager,
            cancel_token,
            connection_counter: AtomicU64::new(0),
            connections: TaskTracker::new(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Listens for connections until the cancellation token is triggered.
    ///
    /// Open connections are cancelled with the same token; this returns once
    /// they have all closed and the socket file is removed.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;

        info!(socket = %self.socket_path.display(), "Control server listening");

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let conn_num = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            self.handle_connection(stream, conn_num);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        self.connections.close();
        self.connections.wait().await;
        self.cleanup();
        Ok(())
    }

    /// Removes a stale socket, creates the parent directory and binds.
    fn bind(&self) -> Result<UnixListener, ServerError> {
        let setup_error = |e: std::io::Error| ServerError::SocketSetup {
            path: self.socket_path.clone(),
            error: e.to_string(),
        };

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(setup_error)?;
        }
        if let Some(parent) = self.socket_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(setup_error)?;
            }
        }
        UnixListener::bind(&self.socket_path).map_err(setup_error)
    }

    fn handle_connection(&self, stream: tokio::net::UnixStream, connection_number: u64) {
        let (reader, writer) = stream.into_split();
        let handler = ConnectionHandler::new(reader, writer, self.manager.clone(), connection_number);
        let cancel = self.cancel_token.clone();

        self.connections.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = handler.run() => {}
            }
        });
    }

    fn cleanup(&self) {
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    socket = %self.socket_path.display(),
                    error = %e,
                    "Failed to remove socket file"
                );
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

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_display() {
        let err = ServerError::SocketSetup {
            path: PathBuf::from("/tmp/test.sock"),
            error: "permission denied".to_string(),
        };
        assert!(err.to_string().contains("/tmp/test.sock"));
        assert!(err.to_string().contains("permission denied"));
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tierd.sock");
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let server = ControlServer::new(&path, ManagerHandle::new(tx), CancellationToken::new());

        let first = server.bind().unwrap();
        drop(first);
        assert!(path.exists());

        // A leftover socket file from a previous run is replaced
        assert!(server.bind().is_ok());
        server.cleanup();
        assert!(!path.exists());
    }
}
