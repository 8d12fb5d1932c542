//! tierctl - Control client for the tierd orchestrator
//!
//! Sends one request over the control socket and prints the response as
//! JSON. Exits non-zero when the orchestrator answers with an error.
//!
//! ```bash
//! tierctl start user0
//! tierctl status 6f1c...            # poll a queued message
//! tierctl init user0 42 --cpu 0.5 --memory 512 --model models/echo
//! tierctl forward user0 42 '{"prompt":"hi"}'
//! tierctl snapshot
//! ```

use std::io::Read;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;

use tier_core::{Container, ContainerId, MessageId, MessageIntent, ProcessId, TierLevel};
use tier_protocol::{ClientMessage, DaemonMessage};
use tierd::config::SOCKET_ENV;
use tierd::server::DEFAULT_SOCKET_PATH;

/// Generous enough for a container build behind `init`.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Control client for tierd
#[derive(Parser, Debug)]
#[command(name = "tierctl", version, about)]
struct Args {
    /// Control socket path
    #[arg(long, global = true, env = SOCKET_ENV, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Queue a START request for a process
    Start {
        process_id: String,
        #[command(flatten)]
        queue: QueueArgs,
    },
    /// Queue an OVERLOAD request for a process
    Overload {
        process_id: String,
        #[command(flatten)]
        queue: QueueArgs,
    },
    /// Look up a queued or completed message
    Status { id: String },
    /// Build and run a container in a process's daemon
    Init {
        process_id: String,
        container_id: u64,
        #[arg(long)]
        cpu: f64,
        /// Memory in MB
        #[arg(long)]
        memory: f64,
        /// Build context for the container image
        #[arg(long)]
        model: String,
    },
    /// Check a container's health
    Health { process_id: String, container_id: u64 },
    /// Send a request body to a container; `-` reads it from stdin
    Forward {
        process_id: String,
        container_id: u64,
        body: String,
    },
    /// Shut down a process's daemon
    Kill { process_id: String },
    /// Kill one container
    KillContainer { process_id: String, container_id: u64 },
    /// Dump daemons, queue and block usage
    Snapshot,
    /// Check that tierd answers
    Ping,
}

#[derive(clap::Args, Debug)]
struct QueueArgs {
    /// Tier level; looked up in the tier directory when omitted
    #[arg(long)]
    tier: Option<u8>,
    /// Ordering within a tier (lower first)
    #[arg(long, default_value_t = 0)]
    priority: u32,
}

fn build_request(command: Command) -> Result<ClientMessage> {
    let enqueue = |intent: MessageIntent, queue: QueueArgs| {
        ClientMessage::enqueue(intent, queue.tier.map(TierLevel::new), queue.priority)
    };

    let request = match command {
        Command::Start { process_id, queue } => enqueue(
            MessageIntent::Start {
                process_id: ProcessId::new(process_id),
            },
            queue,
        ),
        Command::Overload { process_id, queue } => enqueue(
            MessageIntent::Overload {
                process_id: ProcessId::new(process_id),
            },
            queue,
        ),
        Command::Status { id } => ClientMessage::message_status(MessageId::new(id)),
        Command::Init {
            process_id,
            container_id,
            cpu,
            memory,
            model,
        } => ClientMessage::initialize_container(
            ProcessId::new(process_id),
            Container::new(container_id, cpu, memory, model),
        ),
        Command::Health {
            process_id,
            container_id,
        } => ClientMessage::health_check(ProcessId::new(process_id), ContainerId::new(container_id)),
        Command::Forward {
            process_id,
            container_id,
            body,
        } => {
            let body = if body == "-" {
                let mut buf = String::new();
                std::io::stdin()
                    .read_to_string(&mut buf)
                    .context("Failed to read request body from stdin")?;
                buf
            } else {
                body
            };
            ClientMessage::forward(ProcessId::new(process_id), ContainerId::new(container_id), body)
        }
        Command::Kill { process_id } => ClientMessage::kill_process(ProcessId::new(process_id)),
        Command::KillContainer {
            process_id,
            container_id,
        } => ClientMessage::kill_container(ProcessId::new(process_id), ContainerId::new(container_id)),
        Command::Snapshot => ClientMessage::snapshot(),
        Command::Ping => ClientMessage::ping(1),
    };
    Ok(request)
}

/// One line out, one line back.
async fn exchange(
    reader: &mut BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    request: &ClientMessage,
) -> Result<DaemonMessage> {
    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;

    let mut response = String::new();
    let n = timeout(REQUEST_TIMEOUT, reader.read_line(&mut response))
        .await
        .context("Timed out waiting for tierd")??;
    if n == 0 {
        bail!("tierd closed the connection");
    }
    serde_json::from_str(&response).context("Malformed response from tierd")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let request = build_request(args.command)?;

    let stream = UnixStream::connect(&args.socket)
        .await
        .with_context(|| format!("Failed to connect to {}", args.socket.display()))?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let client_id = format!("tierctl-{}", process::id());
    match exchange(&mut reader, &mut writer, &ClientMessage::connect(Some(client_id))).await? {
        DaemonMessage::Connected { .. } => {}
        DaemonMessage::Rejected { reason, .. } => bail!("Connection rejected: {reason}"),
        other => bail!("Unexpected handshake response: {other:?}"),
    }

    let response = exchange(&mut reader, &mut writer, &request).await?;

    // Best effort; the answer is already in hand
    if let Ok(mut line) = serde_json::to_string(&ClientMessage::disconnect()) {
        line.push('\n');
        let _ = writer.write_all(line.as_bytes()).await;
    }

    let failed = response.is_error();
    match &response {
        DaemonMessage::Forwarded { body } => println!("{body}"),
        other => println!("{}", serde_json::to_string_pretty(other)?),
    }
    if failed {
        process::exit(1);
    }
    Ok(())
}
