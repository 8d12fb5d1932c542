//! tierd - Tiered compute orchestrator daemon
//!
//! Runs the daemon manager (queue, resource monitor and per-process
//! platform daemons) behind a Unix control socket.
//!
//! # Usage
//!
//! ```bash
//! # Start the orchestrator (foreground)
//! tierd start
//!
//! # Start in the background
//! tierd start -d
//!
//! # Use an explicit config file
//! tierd start --config ./tierd.toml
//!
//! # Stop / inspect the running orchestrator
//! tierd stop
//! tierd status
//!
//! # Custom socket path and debug logging
//! TIERD_SOCKET=/run/tierd.sock RUST_LOG=tierd=debug tierd start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: stop accepting clients, shut down every daemon, exit

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tierd::config::OrchestratorConfig;
use tierd::server::ControlServer;
use tierd::spawn_manager;

/// Tiered compute orchestrator daemon
#[derive(Parser, Debug)]
#[command(name = "tierd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the orchestrator
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Config file (defaults to $TIERD_CONFIG, then <config dir>/tierd/config.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Stop the running orchestrator
    Stop,
    /// Show orchestrator status
    Status,
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("tierd")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("tierd.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("tierd.log")
}

fn read_pid() -> Option<u32> {
    let mut file = File::open(pid_file_path()).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

/// Returns the PID of a live orchestrator, clearing a stale PID file.
fn running_pid() -> Option<u32> {
    let pid = read_pid()?;
    if is_process_running(pid) {
        return Some(pid);
    }
    remove_pid_file();
    None
}

fn stop_daemon(pid: u32) -> Result<()> {
    let Ok(raw) = i32::try_from(pid) else {
        bail!("Invalid PID {pid}");
    };
    // SAFETY: kill(2) has no memory-safety preconditions
    let result = unsafe { libc::kill(raw, libc::SIGTERM) };
    if result != 0 {
        bail!("Failed to send SIGTERM to process {pid}");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        config: None,
    });

    match command {
        Command::Start { daemon, config } => {
            if let Some(pid) = running_pid() {
                eprintln!("tierd is already running (PID {pid})");
                eprintln!("Use 'tierd stop' to stop it first.");
                process::exit(1);
            }

            // Fail on a bad config before forking
            let config = OrchestratorConfig::load(config.as_deref())
                .context("Failed to load configuration")?;

            if daemon {
                daemonize()?;
            }
            write_pid()?;
            let result = run_daemon(config);
            remove_pid_file();
            result
        }
        Command::Stop => {
            let Some(pid) = running_pid() else {
                println!("tierd is not running.");
                return Ok(());
            };
            println!("Stopping tierd (PID {pid})...");
            stop_daemon(pid)?;

            // Daemons tear their containers down first, so allow some time
            for _ in 0..300 {
                if !is_process_running(pid) {
                    println!("tierd stopped.");
                    return Ok(());
                }
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            eprintln!("tierd did not stop within 30 seconds.");
            process::exit(1);
        }
        Command::Status => {
            let Some(pid) = running_pid() else {
                println!("tierd is not running.");
                process::exit(1);
            };
            println!("tierd is running (PID {pid})");
            if let Ok(config) = OrchestratorConfig::load(None) {
                if config.socket_path.exists() {
                    println!("Socket: {}", config.socket_path.display());
                }
            }
            Ok(())
        }
    }
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;
    Ok(())
}

#[tokio::main]
async fn run_daemon(config: OrchestratorConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("tierd=info".parse()?)
                .add_directive("tier_core=info".parse()?)
                .add_directive("tier_runtime=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        runtime = ?config.runtime,
        "tierd starting"
    );

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let manager_config = config.manager_config();
    info!(
        max_cpu = manager_config.max_cpu,
        max_memory_mb = manager_config.max_memory_mb,
        blocks = manager_config.total_blocks(),
        ports = manager_config.ports.len(),
        "Resource budget"
    );
    let manager = spawn_manager(
        manager_config,
        Arc::new(config.tier_directory()),
        config.container_runtime(),
    );

    let server = ControlServer::new(&config.socket_path, manager.clone(), cancel_token);
    info!(socket = %config.socket_path.display(), "Starting control server");
    let served = server.run().await;

    match manager.shutdown().await {
        Ok(codes) => {
            for (process_id, code) in codes.iter().filter(|(_, code)| *code != 0) {
                warn!(process_id = %process_id, code, "Daemon exited uncleanly");
            }
            info!(daemons = codes.len(), "Manager stopped");
        }
        Err(e) => warn!(error = %e, "Manager already stopped"),
    }

    if let Err(e) = served {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("tierd stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}
