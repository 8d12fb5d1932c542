//! Integration tests for the control socket.
//!
//! Each test runs a real `ControlServer` on a temporary Unix socket in
//! front of a manager backed by the in-memory runtime, and talks to it the
//! way `tierctl` does: newline-delimited JSON.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tier_core::{
    Container, ContainerId, HealthStatus, MessageId, MessageIntent, MessageLookup, MessageStatus,
    ProcessId,
};
use tier_protocol::{ClientMessage, DaemonMessage, ProtocolVersion};
use tier_runtime::MockRuntime;
use tierd::server::ControlServer;
use tierd::tiers::StaticTierDirectory;
use tierd::{spawn_manager, ManagerConfig, ManagerHandle};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Test Helpers
// ============================================================================

struct TestServer {
    _dir: TempDir,
    socket_path: PathBuf,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    manager: ManagerHandle,
}

impl TestServer {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("tierd.sock");

        let config = ManagerConfig {
            ports: (7100..7120).collect(),
            tick: Some(Duration::from_millis(10)),
            ..ManagerConfig::default()
        };
        let manager = spawn_manager(
            config,
            Arc::new(StaticTierDirectory::with_defaults()),
            Arc::new(MockRuntime::new()),
        );

        let cancel = CancellationToken::new();
        let server = ControlServer::new(&socket_path, manager.clone(), cancel.clone());
        let task = tokio::spawn(async move {
            server.run().await.unwrap();
        });

        for _ in 0..100 {
            if socket_path.exists() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }

        Self {
            _dir: dir,
            socket_path,
            cancel,
            task,
            manager,
        }
    }

    async fn stop(self) {
        self.cancel.cancel();
        timeout(Duration::from_secs(5), self.task).await.unwrap().unwrap();
        assert!(!self.socket_path.exists());
        self.manager.shutdown().await.unwrap();
    }
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn raw(socket_path: &PathBuf) -> Self {
        let stream = UnixStream::connect(socket_path).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn connect(socket_path: &PathBuf) -> Self {
        let mut client = Self::raw(socket_path).await;
        match client.request(ClientMessage::connect(Some("test".into()))).await {
            DaemonMessage::Connected { client_id, .. } => assert_eq!(client_id, "test"),
            other => panic!("Expected Connected, got {other:?}"),
        }
        client
    }

    async fn send_line(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn recv(&mut self) -> Option<DaemonMessage> {
        let mut line = String::new();
        let n = timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        if n == 0 {
            return None;
        }
        Some(serde_json::from_str(&line).unwrap())
    }

    async fn request(&mut self, msg: ClientMessage) -> DaemonMessage {
        let line = serde_json::to_string(&msg).unwrap();
        self.send_line(&line).await;
        self.recv().await.expect("connection closed")
    }
}

fn user(n: u8) -> ProcessId {
    ProcessId::new(format!("user{n}"))
}

async fn wait_for_status(client: &mut Client, id: &MessageId, want: MessageStatus) {
    for _ in 0..200 {
        match client.request(ClientMessage::message_status(id.clone())).await {
            DaemonMessage::MessageStatus { lookup, .. } if lookup.status() == Some(want) => return,
            DaemonMessage::MessageStatus { .. } => {}
            other => panic!("Expected MessageStatus, got {other:?}"),
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("message {id} never reached {want:?}");
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_handshake_and_ping() {
    let server = TestServer::start().await;
    let mut client = Client::connect(&server.socket_path).await;

    match client.request(ClientMessage::ping(7)).await {
        DaemonMessage::Pong { seq } => assert_eq!(seq, 7),
        other => panic!("Expected Pong, got {other:?}"),
    }

    // Disconnect gets no reply; the server closes the stream
    let line = serde_json::to_string(&ClientMessage::disconnect()).unwrap();
    client.send_line(&line).await;
    assert!(client.recv().await.is_none());

    server.stop().await;
}

#[tokio::test]
async fn test_incompatible_version_rejected() {
    let server = TestServer::start().await;
    let mut client = Client::raw(&server.socket_path).await;

    let mut hello = ClientMessage::connect(None);
    hello.protocol_version = ProtocolVersion::new(2, 0);
    match client.request(hello).await {
        DaemonMessage::Rejected {
            protocol_version, ..
        } => assert_eq!(protocol_version, ProtocolVersion::CURRENT),
        other => panic!("Expected Rejected, got {other:?}"),
    }
    assert!(client.recv().await.is_none());

    server.stop().await;
}

#[tokio::test]
async fn test_handshake_requires_connect() {
    let server = TestServer::start().await;
    let mut client = Client::raw(&server.socket_path).await;

    assert!(client.request(ClientMessage::snapshot()).await.is_error());
    assert!(client.recv().await.is_none());

    server.stop().await;
}

#[tokio::test]
async fn test_malformed_request_keeps_connection() {
    let server = TestServer::start().await;
    let mut client = Client::connect(&server.socket_path).await;

    client.send_line("{not json").await;
    match client.recv().await.unwrap() {
        DaemonMessage::Error { code, retryable, .. } => {
            assert_eq!(code.as_deref(), Some("parse_error"));
            assert!(!retryable);
        }
        other => panic!("Expected Error, got {other:?}"),
    }

    match client.request(ClientMessage::ping(1)).await {
        DaemonMessage::Pong { seq } => assert_eq!(seq, 1),
        other => panic!("Expected Pong, got {other:?}"),
    }

    server.stop().await;
}

// ============================================================================
// Requests
// ============================================================================

#[tokio::test]
async fn test_process_lifecycle_over_socket() {
    let server = TestServer::start().await;
    let mut client = Client::connect(&server.socket_path).await;
    let process_id = user(0);

    let id = match client
        .request(ClientMessage::enqueue(
            MessageIntent::Start {
                process_id: process_id.clone(),
            },
            None,
            0,
        ))
        .await
    {
        DaemonMessage::Enqueued { id } => id,
        other => panic!("Expected Enqueued, got {other:?}"),
    };
    wait_for_status(&mut client, &id, MessageStatus::Success).await;

    let port = match client
        .request(ClientMessage::initialize_container(
            process_id.clone(),
            Container::new(11u64, 0.5, 256.0, "models/echo"),
        ))
        .await
    {
        DaemonMessage::ContainerInitialized {
            container_id, port, ..
        } => {
            assert_eq!(container_id, ContainerId::new(11));
            port
        }
        other => panic!("Expected ContainerInitialized, got {other:?}"),
    };

    match client
        .request(ClientMessage::health_check(process_id.clone(), ContainerId::new(11)))
        .await
    {
        DaemonMessage::Health { status, .. } => assert_eq!(status, HealthStatus::Healthy),
        other => panic!("Expected Health, got {other:?}"),
    }

    match client.request(ClientMessage::snapshot()).await {
        DaemonMessage::Snapshot { snapshot } => {
            assert_eq!(snapshot.daemons.len(), 1);
            let daemon = &snapshot.daemons[0];
            assert_eq!(daemon.process_id, process_id);
            assert_eq!(daemon.containers.len(), 1);
            assert_eq!(daemon.containers[0].port, Some(port));
            assert!(snapshot.queue.is_empty());
            assert!(snapshot.monitor.usage.contains_key(&process_id));
        }
        other => panic!("Expected Snapshot, got {other:?}"),
    }

    match client
        .request(ClientMessage::kill_container(process_id.clone(), ContainerId::new(11)))
        .await
    {
        DaemonMessage::ContainerKilled { report } => {
            assert_eq!(report.killed, vec![ContainerId::new(11)]);
        }
        other => panic!("Expected ContainerKilled, got {other:?}"),
    }

    match client.request(ClientMessage::kill_process(process_id.clone())).await {
        DaemonMessage::KillAccepted { process_id: killed } => assert_eq!(killed, process_id),
        other => panic!("Expected KillAccepted, got {other:?}"),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_errors_carry_codes() {
    let server = TestServer::start().await;
    let mut client = Client::connect(&server.socket_path).await;

    match client.request(ClientMessage::kill_process(user(9))).await {
        DaemonMessage::Error { code, retryable, .. } => {
            assert_eq!(code.as_deref(), Some("daemon_not_found"));
            assert!(!retryable);
        }
        other => panic!("Expected Error, got {other:?}"),
    }

    match client
        .request(ClientMessage::enqueue(
            MessageIntent::Start {
                process_id: ProcessId::new("nobody"),
            },
            None,
            0,
        ))
        .await
    {
        DaemonMessage::Error { code, .. } => assert_eq!(code.as_deref(), Some("tier_directory")),
        other => panic!("Expected Error, got {other:?}"),
    }

    match client
        .request(ClientMessage::message_status(MessageId::new("missing")))
        .await
    {
        DaemonMessage::MessageStatus { lookup, .. } => assert_eq!(lookup, MessageLookup::NotFound),
        other => panic!("Expected MessageStatus, got {other:?}"),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_concurrent_clients() {
    let server = TestServer::start().await;

    let mut tasks = Vec::new();
    for n in 0..4u64 {
        let socket_path = server.socket_path.clone();
        tasks.push(tokio::spawn(async move {
            let mut client = Client::connect(&socket_path).await;
            for seq in 0..10 {
                match client.request(ClientMessage::ping(n * 100 + seq)).await {
                    DaemonMessage::Pong { seq: got } => assert_eq!(got, n * 100 + seq),
                    other => panic!("Expected Pong, got {other:?}"),
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    server.stop().await;
}
