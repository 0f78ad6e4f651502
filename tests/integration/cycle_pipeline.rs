//! Scheduler → pool → aggregator → store pipeline
//!
//! These tests verify that:
//! - An admitted cycle probes every active device and records one row each
//! - A panicking probe costs only its own device
//! - Duplicate deliveries leave a single history row
//! - The self-driving loop starts the first cycle on its own

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;
use dvr_monitoring::{
    CycleStatus, CycleTrigger, ProbeResult, ProbeStatus,
    scheduler::SchedulerSettings,
    storage::{HistoryQuery, StorageBackend, memory::MemoryBackend},
};
use pretty_assertions::assert_eq;

use crate::helpers::{
    ScriptedProbe, create_fleet, create_test_hub, default_scheduler_settings,
};

#[tokio::test]
async fn test_cycle_records_every_active_device() {
    let mut devices = create_fleet(6);
    devices[5].active = false;

    let probe = ScriptedProbe::healthy()
        .with_outcome(2, ProbeStatus::Timeout)
        .with_outcome(4, ProbeStatus::AuthFailed);

    let hub = create_test_hub(
        Arc::new(MemoryBackend::new()),
        &devices,
        Arc::new(probe),
        default_scheduler_settings(),
    )
    .await;

    let admission = hub.scheduler.check_and_run(Utc::now()).await.unwrap();
    assert!(admission.started);
    hub.scheduler.wait_idle().await;

    let cycle = hub.store.latest_cycle().await.unwrap().unwrap();
    assert_eq!(cycle.status, CycleStatus::Completed);
    assert_eq!(cycle.trigger, CycleTrigger::AutoStart);

    let summary = cycle.summary.unwrap();
    assert_eq!(summary.total, 5);
    assert_eq!(summary.count(ProbeStatus::Success), 3);
    assert_eq!(summary.count(ProbeStatus::Timeout), 1);
    assert_eq!(summary.count(ProbeStatus::AuthFailed), 1);

    let snapshots = hub.store.snapshots().await.unwrap();
    assert_eq!(snapshots.len(), 5);
    assert!(hub.store.snapshot(6).await.unwrap().is_none());

    let stats = hub.aggregator.stats().await.unwrap();
    assert_eq!(stats.ingested, 5);
    assert_eq!(stats.cycles_finalized, 1);
}

#[tokio::test]
async fn test_fifty_devices_one_panic() {
    let probe = Arc::new(
        ScriptedProbe::healthy()
            .with_delay(Duration::from_millis(5))
            .with_outcome(10, ProbeStatus::Unreachable)
            .panicking_on(25),
    );

    let hub = create_test_hub(
        Arc::new(MemoryBackend::new()),
        &create_fleet(50),
        probe.clone(),
        default_scheduler_settings(),
    )
    .await;

    let results = hub.pool.process(create_fleet(50), 5).await;
    assert_eq!(results.len(), 50);

    let panicked: Vec<&ProbeResult> = results
        .iter()
        .filter(|r| r.status == ProbeStatus::InternalError)
        .collect();
    assert_eq!(panicked.len(), 1);
    assert_eq!(panicked[0].device_id, 25);
    assert!(panicked[0].diagnostic.contains("blew up"));

    let unreachable = results
        .iter()
        .filter(|r| r.status == ProbeStatus::Unreachable)
        .count();
    assert_eq!(unreachable, 1);
    assert_eq!(
        results.iter().filter(|r| r.status.is_success()).count(),
        48
    );

    assert!(probe.max_in_flight.load(std::sync::atomic::Ordering::SeqCst) <= 5);
}

#[tokio::test]
async fn test_duplicate_delivery_keeps_one_row() {
    let store = Arc::new(MemoryBackend::new());
    let hub = create_test_hub(
        store.clone(),
        &create_fleet(1),
        Arc::new(ScriptedProbe::healthy()),
        default_scheduler_settings(),
    )
    .await;

    let cycle = store.begin_cycle(CycleTrigger::Manual, Utc::now()).await.unwrap();
    let result = ProbeResult::failed(1, ProbeStatus::Timeout, "late", Utc::now());

    hub.aggregator.ingest(cycle.id, result.clone()).await.unwrap();
    hub.aggregator.ingest(cycle.id, result.clone()).await.unwrap();
    let summary = hub
        .aggregator
        .finalize_cycle(cycle.id, vec![result])
        .await
        .unwrap();
    assert_matches!(summary, Some(s) if s.total == 1);

    let history = store.query_history(HistoryQuery::latest(1, 10)).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(store.snapshot(1).await.unwrap().unwrap().consecutive_failures, 1);

    let stats = hub.aggregator.stats().await.unwrap();
    assert_eq!(stats.duplicates, 1);
}

#[tokio::test]
async fn test_run_loop_starts_first_cycle() {
    let settings = SchedulerSettings {
        tick: Duration::from_millis(20),
        ..default_scheduler_settings()
    };
    let hub = create_test_hub(
        Arc::new(MemoryBackend::new()),
        &create_fleet(3),
        Arc::new(ScriptedProbe::healthy()),
        settings,
    )
    .await;

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(hub.scheduler.clone().run(async move {
        let _ = stop_rx.await;
    }));

    tokio::time::sleep(Duration::from_millis(100)).await;
    stop_tx.send(()).unwrap();
    handle.await.unwrap();
    hub.scheduler.wait_idle().await;

    // the interval is five minutes, so a few ticks produce exactly one cycle
    let cycle = hub.store.latest_cycle().await.unwrap().unwrap();
    assert_eq!(cycle.id, 1);
    assert_eq!(cycle.trigger, CycleTrigger::AutoStart);
    assert_eq!(cycle.summary.unwrap().total, 3);
}
