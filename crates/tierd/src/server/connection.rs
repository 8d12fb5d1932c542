//! Connection handler for individual control clients.
//!
//! Each client connection gets its own `ConnectionHandler` that:
//! - Performs protocol version negotiation
//! - Parses newline-delimited JSON requests
//! - Routes requests to the manager and writes exactly one response each
//!
//! Orchestrator failures are answered with an `error` message carrying the
//! error's code and retryability; they never close the connection.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Connection errors are logged and result in graceful disconnect

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use tier_protocol::{ClientMessage, DaemonMessage, MessageType, ProtocolVersion, MAX_MESSAGE_SIZE};

use crate::error::OrchestratorError;
use crate::manager::ManagerHandle;

/// Read timeout for idle connections (5 minutes)
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection handler for a single control client.
pub struct ConnectionHandler {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    manager: ManagerHandle,
    /// Assigned after handshake
    client_id: Option<String>,
    connection_number: u64,
}

impl ConnectionHandler {
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        manager: ManagerHandle,
        connection_number: u64,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            manager,
            client_id: None,
            connection_number,
        }
    }

    /// Performs the handshake, then serves requests until the client leaves.
    ///
    /// Returns the client id if the handshake succeeded.
    pub async fn run(mut self) -> Option<String> {
        debug!(connection = self.connection_number, "New client connected");

        if let Err(e) = self.handle_handshake().await {
            warn!(connection = self.connection_number, error = %e, "Handshake failed");
            return None;
        }
        info!(client_id = ?self.client_id, "Client handshake completed");

        if let Err(e) = self.process_messages().await {
            debug!(client_id = ?self.client_id, error = %e, "Connection closed");
        }

        info!(client_id = ?self.client_id, "Client disconnected");
        self.client_id
    }

    /// Expects `connect` with a compatible protocol version.
    async fn handle_handshake(&mut self) -> Result<(), ConnectionError> {
        let msg = match timeout(READ_TIMEOUT, self.read_message()).await {
            Ok(result) => result?,
            Err(_) => return Err(ConnectionError::Timeout),
        };

        let client_version = msg.protocol_version;
        if !client_version.is_compatible_with(&ProtocolVersion::CURRENT) {
            warn!(
                client_version = %client_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );
            self.send_message(DaemonMessage::rejected(&format!(
                "Protocol version {} not compatible with server version {}",
                client_version,
                ProtocolVersion::CURRENT
            )))
            .await?;
            return Err(ConnectionError::VersionMismatch {
                client: client_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        match msg.message {
            MessageType::Connect { client_id } => {
                let assigned_id =
                    client_id.unwrap_or_else(|| format!("client-{}", self.connection_number));
                self.client_id = Some(assigned_id.clone());
                self.send_message(DaemonMessage::connected(assigned_id)).await
            }
            other => {
                self.send_message(DaemonMessage::error("Expected connect message for handshake"))
                    .await?;
                Err(ConnectionError::UnexpectedMessage(format!("{other:?}")))
            }
        }
    }

    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        loop {
            let msg = match timeout(READ_TIMEOUT, self.read_message()).await {
                Ok(Ok(msg)) => msg,
                Ok(Err(ConnectionError::Eof)) => {
                    debug!(client_id = ?self.client_id, "Client sent EOF");
                    return Ok(());
                }
                Ok(Err(ConnectionError::ParseError(e))) => {
                    // The line was consumed; the stream is still in sync
                    self.send_message(DaemonMessage::error_with_code(&e, "parse_error", false))
                        .await?;
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(client_id = ?self.client_id, "Connection timed out");
                    return Err(ConnectionError::Timeout);
                }
            };

            let response = match self.handle_message(msg.message).await {
                Some(response) => response,
                None => {
                    debug!(client_id = ?self.client_id, "Client requested disconnect");
                    return Ok(());
                }
            };
            self.send_message(response).await?;
        }
    }

    /// Maps a request onto the manager. `None` means disconnect.
    async fn handle_message(&mut self, message: MessageType) -> Option<DaemonMessage> {
        let response = match message {
            MessageType::Connect { .. } => DaemonMessage::error("Already connected"),

            MessageType::Enqueue {
                intent,
                tier,
                priority,
            } => respond(
                self.manager
                    .enqueue(intent, tier, priority)
                    .await
                    .map(|id| DaemonMessage::Enqueued { id }),
            ),

            MessageType::MessageStatus { id } => respond(
                self.manager
                    .message_status(id.clone())
                    .await
                    .map(|lookup| DaemonMessage::MessageStatus { id, lookup }),
            ),

            MessageType::InitializeContainer {
                process_id,
                container,
            } => {
                let container_id = container.id;
                respond(
                    self.manager
                        .initialize_container(&process_id, container)
                        .await
                        .map(|port| DaemonMessage::ContainerInitialized {
                            process_id,
                            container_id,
                            port,
                        }),
                )
            }

            MessageType::HealthCheck {
                process_id,
                container_id,
            } => respond(
                self.manager
                    .check_health(&process_id, container_id)
                    .await
                    .map(|status| DaemonMessage::Health {
                        container_id,
                        status,
                    }),
            ),

            MessageType::Forward {
                process_id,
                container_id,
                body,
            } => respond(
                self.manager
                    .forward(&process_id, container_id, body)
                    .await
                    .map(|body| DaemonMessage::Forwarded { body }),
            ),

            MessageType::KillProcess { process_id } => respond(
                self.manager
                    .kill_process(&process_id)
                    .await
                    .map(|()| DaemonMessage::KillAccepted { process_id }),
            ),

            MessageType::KillContainer {
                process_id,
                container_id,
            } => respond(
                self.manager
                    .kill_container(&process_id, container_id)
                    .await
                    .map(|report| DaemonMessage::ContainerKilled { report }),
            ),

            MessageType::Snapshot => {
                respond(self.manager.snapshot().await.map(DaemonMessage::snapshot))
            }

            MessageType::Ping { seq } => DaemonMessage::Pong { seq },

            MessageType::Disconnect => return None,
        };
        Some(response)
    }

    /// Reads one line, bounded by [`MAX_MESSAGE_SIZE`].
    async fn read_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        let mut line = String::new();
        let limit = (MAX_MESSAGE_SIZE + 1) as u64;

        let bytes_read = (&mut self.reader)
            .take(limit)
            .read_line(&mut line)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }
        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ConnectionError::MessageTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let msg: ClientMessage =
            serde_json::from_str(&line).map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        debug!(
            client_id = ?self.client_id,
            message_type = ?std::mem::discriminant(&msg.message),
            "Received message"
        );
        Ok(msg)
    }

    async fn send_message(&mut self, msg: DaemonMessage) -> Result<(), ConnectionError> {
        let json =
            serde_json::to_string(&msg).map_err(|e| ConnectionError::ParseError(e.to_string()))?;
        let writer = &mut self.writer;

        match timeout(WRITE_TIMEOUT, async {
            writer.write_all(json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            Ok::<(), std::io::Error>(())
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
            Err(_) => Err(ConnectionError::WriteTimeout),
        }
    }
}

/// Turns an orchestrator result into the wire response.
fn respond(result: Result<DaemonMessage, OrchestratorError>) -> DaemonMessage {
    result.unwrap_or_else(|e| {
        debug!(code = e.code(), error = %e, "Request failed");
        DaemonMessage::error_with_code(&e.to_string(), e.code(), e.is_retryable())
    })
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tier_core::{MessageId, ProcessId};
    use crate::error::ResourceAllocationError;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::VersionMismatch {
            client: ProtocolVersion::new(2, 0),
            server: ProtocolVersion::new(1, 0),
        };
        assert!(err.to_string().contains("2.0"));
        assert!(err.to_string().contains("1.0"));
    }

    #[test]
    fn test_respond_carries_code_and_retryability() {
        let shortage = OrchestratorError::from(ResourceAllocationError::Ports {
            process_id: ProcessId::new("user0"),
            requested: 4,
            available: 1,
        });
        match respond(Err(shortage)) {
            DaemonMessage::Error {
                code, retryable, ..
            } => {
                assert_eq!(code.as_deref(), Some("port_allocation"));
                assert!(retryable);
            }
            other => panic!("Expected Error, got {other:?}"),
        }

        match respond(Err(OrchestratorError::DaemonNotFound(ProcessId::new("user5")))) {
            DaemonMessage::Error {
                message,
                code,
                retryable,
            } => {
                assert!(message.contains("user5"));
                assert_eq!(code.as_deref(), Some("daemon_not_found"));
                assert!(!retryable);
            }
            other => panic!("Expected Error, got {other:?}"),
        }

        assert!(matches!(
            respond(Ok(DaemonMessage::Enqueued {
                id: MessageId::new("m")
            })),
            DaemonMessage::Enqueued { .. }
        ));
    }
}
