//! Fleet discovery integration tests: reconciliation, dead-host session
//! recovery, and loop resilience to provider failures.


use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use gridstitch::catalog::JobPayload;
use gridstitch::discovery::{FleetMonitor, HostProvider, StaticHostProvider};
use gridstitch::error::{Result, StitchError};
use gridstitch::registry::WorkerRegistry;
use gridstitch::session::{Session, SessionTable};

use test_harness::assert_eventually;

fn payload() -> JobPayload {
    JobPayload {
        scenario_id: "A".to_string(),
        raster_id: "r".to_string(),
        lng_min: -180.0,
        lat_min: -90.0,
        lng_max: -90.0,
        lat_max: 0.0,
    }
}

fn monitor_parts() -> (
    Arc<WorkerRegistry>,
    Arc<SessionTable>,
    mpsc::UnboundedSender<JobPayload>,
    mpsc::UnboundedReceiver<JobPayload>,
) {
    let registry = Arc::new(WorkerRegistry::new());
    let sessions = Arc::new(SessionTable::new());
    let (tx, rx) = mpsc::unbounded_channel();
    (registry, sessions, tx, rx)
}

#[tokio::test]
async fn dead_host_sweep_requeues_the_lost_payload() {
    let (registry, sessions, tx, mut rx) = monitor_parts();
    let cancel = CancellationToken::new();

    // w1 is running a job with an open session.
    registry.add("w1:8888").await;
    let worker = registry.acquire_ready(&cancel).await.unwrap();
    let session_id = Uuid::new_v4();
    sessions
        .insert(
            session_id,
            Session::new(worker, payload(), "http://w1:8888/s".to_string()),
        )
        .await;

    // Discovery now reports an empty fleet.
    let monitor = FleetMonitor::new(
        Arc::new(StaticHostProvider::new([])),
        registry.clone(),
        sessions.clone(),
        tx,
        Duration::from_secs(30),
        true,
    );
    monitor.poll_once().await.unwrap();

    // Exactly one reschedule entry, carrying the session's payload.
    assert_eq!(rx.try_recv().unwrap(), payload());
    assert!(rx.try_recv().is_err());

    // The session is gone and the registry is empty.
    assert!(sessions.is_empty().await);
    assert!(sessions.resolve(&session_id).await.is_none());
    assert_eq!(registry.counts().await, (0, 0));
}

#[tokio::test]
async fn surviving_hosts_keep_their_sessions() {
    let (registry, sessions, tx, mut rx) = monitor_parts();
    let cancel = CancellationToken::new();

    registry.add("w1:8888").await;
    registry.add("w2:8888").await;
    let first = registry.acquire_ready(&cancel).await.unwrap();
    let second = registry.acquire_ready(&cancel).await.unwrap();
    sessions
        .insert(Uuid::new_v4(), Session::new(first.clone(), payload(), String::new()))
        .await;
    sessions
        .insert(Uuid::new_v4(), Session::new(second.clone(), payload(), String::new()))
        .await;

    // Only `first` survives the next reconciliation.
    let active: HashSet<String> = [first.clone()].into_iter().collect();
    let monitor = FleetMonitor::new(
        Arc::new(StaticHostProvider::new(active)),
        registry.clone(),
        sessions.clone(),
        tx,
        Duration::from_secs(30),
        true,
    );
    monitor.poll_once().await.unwrap();

    assert_eq!(rx.try_recv().unwrap(), payload());
    assert!(rx.try_recv().is_err());
    assert_eq!(sessions.len().await, 1);
    assert_eq!(registry.counts().await, (1, 0));
}

#[tokio::test]
async fn static_mode_reconciles_once_then_idles() {
    let (registry, sessions, tx, _rx) = monitor_parts();
    let cancel = CancellationToken::new();

    let monitor = FleetMonitor::new(
        Arc::new(StaticHostProvider::new(["w1:8888".to_string()])),
        registry.clone(),
        sessions,
        tx,
        Duration::from_secs(3600),
        true,
    );
    let task = tokio::spawn(monitor.run(cancel.clone()));

    assert_eventually(
        || async { registry.counts().await == (0, 1) },
        Duration::from_secs(1),
        "static worker list was not reconciled into the registry",
    )
    .await;

    // Idles until cancelled.
    assert!(!task.is_finished());
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("monitor did not stop on cancellation")
        .unwrap();
}

struct FailingProvider;

#[async_trait]
impl HostProvider for FailingProvider {
    async fn running_workers(&self) -> Result<HashSet<String>> {
        Err(StitchError::Discovery("inventory unreachable".to_string()))
    }
}

#[tokio::test]
async fn discovery_failures_do_not_stop_the_loop() {
    let (registry, sessions, tx, _rx) = monitor_parts();
    let cancel = CancellationToken::new();

    let monitor = FleetMonitor::new(
        Arc::new(FailingProvider),
        registry,
        sessions,
        tx,
        Duration::from_millis(10),
        false,
    );
    let task = tokio::spawn(monitor.run(cancel.clone()));

    // Several failing cycles pass; the loop must survive all of them.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!task.is_finished());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("monitor did not stop on cancellation")
        .unwrap();
}
