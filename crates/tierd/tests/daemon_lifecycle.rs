//! Integration tests for a single platform daemon.
//!
//! Every test drives a real `DaemonActor` through its handle against the
//! in-memory runtime. Timer behaviour runs on paused tokio time.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::sync::Arc;
use std::time::Duration;

use tier_core::{Container, ContainerId, DaemonState, HealthStatus, ProcessId, TierLevel};
use tier_runtime::{MockRuntime, RuntimeCall};
use tierd::daemon::{spawn_daemon, DaemonConfig, DaemonHandle, LifecycleEvent};
use tierd::OrchestratorError;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::sleep;

// ============================================================================
// Test Helpers
// ============================================================================

fn config(cpu: f64, memory_mb: f64, ports: Vec<u16>) -> DaemonConfig {
    DaemonConfig {
        process_id: ProcessId::new("user0"),
        tier: TierLevel::new(1),
        cpu,
        memory_mb,
        ports,
        max_uptime: Duration::from_secs(3600),
        max_overload: Duration::from_secs(10),
        tick: Duration::from_secs(1),
        forward_host: "127.0.0.1".to_string(),
    }
}

struct TestDaemon {
    handle: DaemonHandle,
    runtime: Arc<MockRuntime>,
    events: mpsc::UnboundedReceiver<LifecycleEvent>,
}

fn spawn(config: DaemonConfig) -> TestDaemon {
    let runtime = Arc::new(MockRuntime::new());
    let (tx, events) = mpsc::unbounded_channel();
    let handle = spawn_daemon(config, runtime.clone(), reqwest::Client::new(), tx);
    TestDaemon {
        handle,
        runtime,
        events,
    }
}

/// Runtime tag of container `id` owned by the test process.
fn tag(id: u64) -> String {
    ContainerId::new(id).tag(&ProcessId::new("user0"))
}

fn container(id: u64, cpu: f64, memory: f64) -> Container {
    Container::new(id, cpu, memory, "models/echo")
}

/// Polls until `check` holds, letting background teardown finish.
async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

// ============================================================================
// Container Lifecycle
// ============================================================================

#[tokio::test]
async fn test_full_container_lifecycle() {
    let daemon = spawn(config(1.0, 1024.0, vec![7000, 7001]));

    let port = daemon
        .handle
        .initialize_container(container(1, 1.0, 1024.0))
        .await
        .unwrap();
    assert!([7000, 7001].contains(&port));
    assert!(daemon.runtime.is_running(&tag(1)));

    let snapshot = daemon.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.used_cpu, snapshot.capacity_cpu);
    assert_eq!(snapshot.used_memory, snapshot.capacity_memory);
    assert_eq!(snapshot.containers.len(), 1);
    assert!(snapshot.containers[0].running);
    assert_eq!(snapshot.containers[0].port, Some(port));

    let err = daemon
        .handle
        .initialize_container(container(2, 0.1, 1.0))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::CapacityExceeded(_)));
    assert!(!daemon.runtime.has_image(&tag(2)));

    let report = daemon
        .handle
        .kill_containers(vec![ContainerId::new(1)])
        .await
        .unwrap();
    assert_eq!(report.killed, vec![ContainerId::new(1)]);
    assert!(report.is_clean());
    assert!(!daemon.runtime.is_running(&tag(1)));
    assert!(!daemon.runtime.has_image(&tag(1)));

    let snapshot = daemon.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.used_cpu, 0.0);
    assert_eq!(snapshot.used_memory, 0.0);
    assert!(snapshot.containers.is_empty());
}

#[tokio::test]
async fn test_duplicate_container_rejected() {
    let daemon = spawn(config(2.0, 2048.0, vec![7000, 7001]));
    daemon
        .handle
        .initialize_container(container(4, 0.5, 256.0))
        .await
        .unwrap();

    let err = daemon
        .handle
        .initialize_container(container(4, 0.5, 256.0))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        OrchestratorError::DuplicateContainer {
            process_id: ProcessId::new("user0"),
            container_id: ContainerId::new(4),
        }
    );
}

#[tokio::test]
async fn test_failed_start_rolls_back() {
    let daemon = spawn(config(2.0, 2048.0, vec![7000]));
    daemon.runtime.fail_run(&tag(5));

    let err = daemon
        .handle
        .initialize_container(container(5, 1.0, 512.0))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "container_start_failed");

    // Stack entry, port and image are all gone
    let snapshot = daemon.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.used_cpu, 0.0);
    assert!(snapshot.containers.is_empty());
    assert!(!daemon.runtime.has_image(&tag(5)));

    // The single port is free again
    let port = daemon
        .handle
        .initialize_container(container(6, 1.0, 512.0))
        .await
        .unwrap();
    assert_eq!(port, 7000);
}

#[tokio::test]
async fn test_port_exhaustion_rolls_back_stack() {
    let daemon = spawn(config(4.0, 4096.0, vec![7000]));
    daemon
        .handle
        .initialize_container(container(1, 1.0, 512.0))
        .await
        .unwrap();

    let err = daemon
        .handle
        .initialize_container(container(2, 1.0, 512.0))
        .await
        .unwrap_err();
    assert_eq!(err, OrchestratorError::NoPortsAvailable { total: 1 });

    let snapshot = daemon.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.containers.len(), 1);
    assert_eq!(snapshot.used_cpu, 1.0);
}

#[tokio::test]
async fn test_kill_is_idempotent() {
    let daemon = spawn(config(2.0, 2048.0, vec![7000, 7001]));
    daemon
        .handle
        .initialize_container(container(1, 0.5, 256.0))
        .await
        .unwrap();
    let before = daemon.handle.snapshot().await.unwrap();

    let report = daemon
        .handle
        .kill_containers(vec![ContainerId::new(99)])
        .await
        .unwrap();
    assert!(report.is_clean());
    assert!(report.killed.is_empty());
    assert_eq!(report.skipped, vec![ContainerId::new(99)]);

    let after = daemon.handle.snapshot().await.unwrap();
    assert_eq!(before.used_cpu, after.used_cpu);
    assert_eq!(before.used_memory, after.used_memory);
    assert!(!daemon
        .runtime
        .calls()
        .iter()
        .any(|call| matches!(call, RuntimeCall::Stop { .. })));
}

#[tokio::test]
async fn test_kill_collects_partial_failures() {
    let daemon = spawn(config(2.0, 2048.0, vec![7000, 7001, 7002]));
    for id in 1..=3 {
        daemon
            .handle
            .initialize_container(container(id, 0.5, 256.0))
            .await
            .unwrap();
    }
    daemon.runtime.fail_stop(&tag(2));

    let report = daemon
        .handle
        .kill_containers(vec![ContainerId::new(1), ContainerId::new(2), ContainerId::new(3)])
        .await
        .unwrap();

    assert_eq!(report.killed, vec![ContainerId::new(1), ContainerId::new(3)]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].container_id, ContainerId::new(2));
    assert!(!daemon.runtime.is_running(&tag(1)));
    assert!(!daemon.runtime.is_running(&tag(3)));

    // Ledger entries go regardless of the runtime outcome
    let snapshot = daemon.handle.snapshot().await.unwrap();
    assert!(snapshot.containers.is_empty());
}

#[tokio::test]
async fn test_health_check() {
    let daemon = spawn(config(2.0, 2048.0, vec![7000]));
    daemon
        .handle
        .initialize_container(container(8, 0.5, 256.0))
        .await
        .unwrap();

    assert_eq!(
        daemon.handle.check_health(ContainerId::new(8)).await.unwrap(),
        HealthStatus::Healthy
    );
    daemon.runtime.set_health(&tag(8), HealthStatus::Unhealthy);
    assert_eq!(
        daemon.handle.check_health(ContainerId::new(8)).await.unwrap(),
        HealthStatus::Unhealthy
    );

    daemon
        .handle
        .kill_containers(vec![ContainerId::new(8)])
        .await
        .unwrap();
    assert_eq!(
        daemon.handle.check_health(ContainerId::new(8)).await.unwrap_err(),
        OrchestratorError::ContainerNotRunning {
            container_id: ContainerId::new(8)
        }
    );
}

// ============================================================================
// Resource Limits
// ============================================================================

#[tokio::test]
async fn test_downsizing_evicts_newest_first() {
    let daemon = spawn(config(2.0, 2048.0, vec![7000, 7001, 7002]));
    for id in 1..=3 {
        daemon
            .handle
            .initialize_container(container(id, 0.5, 512.0))
            .await
            .unwrap();
    }

    let evicted = daemon.handle.set_resource_limits(0.5, 2048.0).await.unwrap();
    assert_eq!(evicted, vec![ContainerId::new(3), ContainerId::new(2)]);

    let snapshot = daemon.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.capacity_cpu, 0.5);
    assert_eq!(snapshot.containers.len(), 1);
    assert_eq!(snapshot.containers[0].id, ContainerId::new(1));

    let runtime = daemon.runtime.clone();
    eventually(|| !runtime.is_running(&tag(2)) && !runtime.is_running(&tag(3))).await;
    assert!(runtime.is_running(&tag(1)));

    // Growing never evicts
    let evicted = daemon.handle.set_resource_limits(4.0, 4096.0).await.unwrap();
    assert!(evicted.is_empty());
}

// ============================================================================
// Timers
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_overload_window_exits_once() {
    let mut daemon = spawn(config(1.0, 1024.0, vec![7000]));

    daemon.handle.enable_overload().await.unwrap();
    let snapshot = daemon.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, DaemonState::OverloadActive);
    assert!(snapshot.overload_active);

    tokio::time::advance(Duration::from_secs(11)).await;

    let event = daemon.events.recv().await.unwrap();
    assert_eq!(
        event,
        LifecycleEvent::OverloadExited {
            process_id: ProcessId::new("user0")
        }
    );

    let snapshot = daemon.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, DaemonState::Monitoring);
    assert!(!snapshot.overload_active);

    tokio::time::advance(Duration::from_secs(30)).await;
    daemon.handle.snapshot().await.unwrap();
    assert_eq!(daemon.events.try_recv().unwrap_err(), TryRecvError::Empty);
}

#[tokio::test(start_paused = true)]
async fn test_uptime_expiry_shuts_down() {
    let mut cfg = config(2.0, 2048.0, vec![7000, 7001]);
    cfg.max_uptime = Duration::from_secs(60);
    let mut daemon = spawn(cfg);

    daemon
        .handle
        .initialize_container(container(1, 0.5, 256.0))
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(61)).await;

    let event = daemon.events.recv().await.unwrap();
    assert_eq!(
        event,
        LifecycleEvent::Exited {
            process_id: ProcessId::new("user0"),
            code: 0,
        }
    );
    assert!(!daemon.runtime.is_running(&tag(1)));
    assert!(!daemon.handle.is_connected());
    assert_eq!(
        daemon.handle.snapshot().await.unwrap_err(),
        OrchestratorError::ChannelClosed
    );
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_exit_codes() {
    let daemon = spawn(config(2.0, 2048.0, vec![7000, 7001]));
    daemon
        .handle
        .initialize_container(container(1, 0.5, 256.0))
        .await
        .unwrap();
    assert_eq!(daemon.handle.shutdown().await.unwrap(), 0);
    assert!(daemon.runtime.running().is_empty());

    let mut failing = spawn(config(2.0, 2048.0, vec![7000, 7001]));
    failing
        .handle
        .initialize_container(container(1, 0.5, 256.0))
        .await
        .unwrap();
    failing.runtime.fail_stop(&tag(1));
    assert_eq!(failing.handle.shutdown().await.unwrap(), 1);
    assert!(matches!(
        failing.events.recv().await.unwrap(),
        LifecycleEvent::Exited { code: 1, .. }
    ));
}

#[tokio::test]
async fn test_commands_after_shutdown_fail() {
    let daemon = spawn(config(1.0, 1024.0, vec![7000]));
    daemon.handle.shutdown().await.unwrap();

    assert_eq!(
        daemon.handle.enable_overload().await.unwrap_err(),
        OrchestratorError::ChannelClosed
    );
}

#[tokio::test]
async fn test_orphaned_start_is_torn_down() {
    let runtime = Arc::new(MockRuntime::with_latency(Duration::from_millis(50)));
    let (tx, _events) = mpsc::unbounded_channel();
    let handle = spawn_daemon(
        config(2.0, 2048.0, vec![7000]),
        runtime.clone(),
        reqwest::Client::new(),
        tx,
    );

    let starter = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.initialize_container(container(1, 0.5, 256.0)).await })
    };
    sleep(Duration::from_millis(5)).await;

    assert_eq!(handle.shutdown().await.unwrap(), 0);
    assert!(starter.await.unwrap().is_err());

    let runtime_check = runtime.clone();
    eventually(move || runtime_check.running().is_empty()).await;
}
