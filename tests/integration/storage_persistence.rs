//! SQLite persistence across hub restarts
//!
//! These tests verify that:
//! - Cycles, snapshots and history survive a reopen of the database
//! - A restarted scheduler keeps the cadence of the previous process
//! - A cycle left RUNNING by a crash is recovered once stale
//! - Retention cleanup only removes expired history

use std::sync::Arc;

use chrono::{Duration, Utc};
use dvr_monitoring::{
    CycleStatus, CycleTrigger, ProbeResult, ProbeStatus,
    actors::{AggregatorHandle, Retention},
    registry::DeviceFilter,
    storage::{HistoryQuery, StorageBackend, sqlite::SqliteBackend},
};
use pretty_assertions::assert_eq;
use tempfile::tempdir;

use crate::helpers::{ScriptedProbe, create_fleet, create_test_hub, default_scheduler_settings};

#[tokio::test]
async fn test_cycle_results_survive_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("hub.db");

    {
        let store: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::new(&db_path).await.unwrap());
        let hub = create_test_hub(
            store.clone(),
            &create_fleet(4),
            Arc::new(ScriptedProbe::healthy().with_outcome(3, ProbeStatus::Unreachable)),
            default_scheduler_settings(),
        )
        .await;

        assert!(hub.scheduler.check_and_run(Utc::now()).await.unwrap().started);
        hub.scheduler.wait_idle().await;
        store.close().await.unwrap();
    }

    let store = SqliteBackend::new(&db_path).await.unwrap();

    let cycle = store.latest_cycle().await.unwrap().unwrap();
    assert_eq!(cycle.status, CycleStatus::Completed);
    assert_eq!(cycle.summary.unwrap().total, 4);

    assert_eq!(store.snapshots().await.unwrap().len(), 4);
    let failing = store.snapshot(3).await.unwrap().unwrap();
    assert_eq!(failing.result.status, ProbeStatus::Unreachable);
    assert_eq!(failing.consecutive_failures, 1);

    let devices = store.list_devices(&DeviceFilter::default()).await.unwrap();
    assert_eq!(devices.iter().find(|d| d.id == 3).unwrap().consecutive_failures, 1);

    let history = store.query_history(HistoryQuery::latest(1, 10)).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].cycle_id, cycle.id);
}

#[tokio::test]
async fn test_restored_scheduler_keeps_cadence() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("hub.db");
    let first_start = Utc::now() - Duration::seconds(60);

    {
        let store = SqliteBackend::new(&db_path).await.unwrap();
        let cycle = store.begin_cycle(CycleTrigger::AutoStart, first_start).await.unwrap();
        store
            .complete_cycle(cycle.id, first_start + Duration::seconds(5), &Default::default())
            .await
            .unwrap();
        store.close().await.unwrap();
    }

    let store: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::new(&db_path).await.unwrap());
    let hub = create_test_hub(
        store.clone(),
        &create_fleet(2),
        Arc::new(ScriptedProbe::healthy()),
        default_scheduler_settings(),
    )
    .await;
    hub.scheduler.restore().await.unwrap();

    // one minute into a five minute interval
    let refused = hub.scheduler.check_and_run(Utc::now()).await.unwrap();
    assert!(!refused.started);

    let due = first_start + Duration::seconds(300);
    let admission = hub.scheduler.check_and_run(due).await.unwrap();
    assert!(admission.started);
    hub.scheduler.wait_idle().await;

    let cycle = store.latest_cycle().await.unwrap().unwrap();
    assert_eq!(cycle.trigger, CycleTrigger::Scheduled);
}

#[tokio::test]
async fn test_crashed_cycle_is_recovered_when_stale() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("hub.db");
    let crashed_at = Utc::now() - Duration::seconds(120);

    {
        let store = SqliteBackend::new(&db_path).await.unwrap();
        store.begin_cycle(CycleTrigger::Scheduled, crashed_at).await.unwrap();
        store.close().await.unwrap();
    }

    let store: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::new(&db_path).await.unwrap());
    let hub = create_test_hub(
        store.clone(),
        &create_fleet(2),
        Arc::new(ScriptedProbe::healthy()),
        default_scheduler_settings(),
    )
    .await;
    hub.scheduler.restore().await.unwrap();

    let status = hub.scheduler.status(Utc::now());
    assert!(status.active);
    assert_eq!(status.current_cycle_id, Some(1));
    assert!(!hub.scheduler.trigger_manual(Utc::now()).await.unwrap().started);

    let after_stale = crashed_at + Duration::seconds(600);
    let admission = hub.scheduler.check_and_run(after_stale).await.unwrap();
    assert!(admission.started);
    hub.scheduler.wait_idle().await;

    let crashed = store.get_cycle(1).await.unwrap().unwrap();
    assert_eq!(crashed.status, CycleStatus::Aborted);
    assert!(crashed.error.is_some());
}

#[tokio::test]
async fn test_retention_cleanup_keeps_recent_history() {
    let dir = tempdir().unwrap();
    let store: Arc<dyn StorageBackend> =
        Arc::new(SqliteBackend::new(dir.path().join("hub.db")).await.unwrap());
    for device in create_fleet(1) {
        store.upsert_device(&device).await.unwrap();
    }

    let now = Utc::now();
    for (days_ago, cycle_offset) in [(45, 0), (31, 1), (2, 2)] {
        let checked_at = now - Duration::days(days_ago);
        let cycle = store.begin_cycle(CycleTrigger::Scheduled, checked_at).await.unwrap();
        let result = ProbeResult::failed(
            1,
            ProbeStatus::Timeout,
            format!("run {cycle_offset}"),
            checked_at,
        );
        store.record_result(cycle.id, &result).await.unwrap();
    }

    let aggregator = AggregatorHandle::spawn(
        store.clone(),
        Some(Retention {
            keep: Duration::days(30),
            every: std::time::Duration::from_secs(3600),
        }),
    );

    // the first cleanup runs on spawn, an explicit one finds nothing left
    let history = loop {
        let history = store.query_history(HistoryQuery::latest(1, 10)).await.unwrap();
        if history.len() == 1 {
            break history;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    };
    assert_eq!(history[0].result.diagnostic, "run 2");
    assert_eq!(aggregator.cleanup().await.unwrap(), 0);

    let stats = aggregator.stats().await.unwrap();
    assert_eq!(stats.history_deleted, 2);
}
