//! End-to-end probe classification against mock DVRs
//!
//! These tests verify that:
//! - A reachable device with valid credentials yields SUCCESS with its clock
//! - An unreachable device never receives a protocol request
//! - Rejected credentials yield AUTH_FAILED
//! - Snapshots and failure counters follow the results

use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Timelike, Utc};
use dvr_monitoring::{
    CycleTrigger, ProbeStatus,
    actors::AggregatorHandle,
    pool::WorkerPool,
    probe::Probe,
    storage::{IngestOutcome, StorageBackend, memory::MemoryBackend},
};
use pretty_assertions::assert_eq;

use crate::helpers::{closed_port, create_tcp_prober, create_test_device, spawn_mock_dvr};

#[tokio::test]
async fn test_reachable_authenticated_unreachable_rejected() {
    let dvr = spawn_mock_dvr("2025-08-27 10:15:30").await;
    let dvr_addr = dvr.address();

    let a = create_test_device(1, &dvr_addr.ip().to_string(), dvr_addr.port());
    let b = create_test_device(2, "127.0.0.1", closed_port().await);
    let mut c = create_test_device(3, &dvr_addr.ip().to_string(), dvr_addr.port());
    c.password = "wrong".to_string();

    let pool = WorkerPool::new(Arc::new(create_tcp_prober()), Duration::from_secs(10), 200);
    let mut results = pool.process(vec![a, b, c], 3).await;
    results.sort_by_key(|r| r.device_id);

    assert_eq!(results.len(), 3);

    assert_eq!(results[0].status, ProbeStatus::Success);
    let device_time = results[0].device_time.expect("device time parsed");
    assert_eq!(
        (device_time.year(), device_time.hour(), device_time.minute()),
        (2025, 10, 15)
    );

    assert_eq!(results[1].status, ProbeStatus::Unreachable);
    assert!(!results[1].reachable);
    assert!(results[1].protocol_latency_ms.is_none());

    assert_eq!(results[2].status, ProbeStatus::AuthFailed);
    assert!(results[2].diagnostic.starts_with("HTTP 401"));

    // only A and C made it to the protocol phase, each answering one digest challenge
    let requests = dvr.received_requests().await.unwrap();
    assert_eq!(requests.len(), 4);
    let answered = requests
        .iter()
        .filter(|r| {
            r.headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.starts_with("Digest "))
        })
        .count();
    assert_eq!(answered, 2);
}

#[tokio::test]
async fn test_snapshot_counters_follow_results() {
    let dvr = spawn_mock_dvr("2025-08-27 10:15:30").await;
    let dvr_addr = dvr.address();

    let a = create_test_device(1, &dvr_addr.ip().to_string(), dvr_addr.port());
    let b = create_test_device(2, "127.0.0.1", closed_port().await);
    let mut c = create_test_device(3, &dvr_addr.ip().to_string(), dvr_addr.port());
    c.password = "wrong".to_string();

    let store = Arc::new(MemoryBackend::new());
    for device in [&a, &b, &c] {
        store.upsert_device(device).await.unwrap();
    }

    let prober = create_tcp_prober();
    let aggregator = AggregatorHandle::spawn(store.clone(), None);

    for round in 1..=2 {
        let cycle = store.begin_cycle(CycleTrigger::Manual, Utc::now()).await.unwrap();
        let mut results = Vec::new();
        for device in [&a, &b, &c] {
            let result = prober.probe(device).await;
            aggregator.ingest(cycle.id, result.clone()).await.unwrap();
            results.push(result);
        }
        aggregator.finalize_cycle(cycle.id, results).await.unwrap();

        let a_snap = store.snapshot(1).await.unwrap().unwrap();
        let b_snap = store.snapshot(2).await.unwrap().unwrap();
        let c_snap = store.snapshot(3).await.unwrap().unwrap();

        assert_eq!(a_snap.consecutive_failures, 0);
        assert_eq!(b_snap.consecutive_failures, round);
        assert_eq!(c_snap.consecutive_failures, round);
        assert_eq!(b_snap.result.status, ProbeStatus::Unreachable);
    }

    // recovery resets the counter
    let cycle = store.begin_cycle(CycleTrigger::Manual, Utc::now()).await.unwrap();
    let mut fixed = c.clone();
    fixed.password = "admin123".to_string();
    let outcome = store
        .record_result(cycle.id, &prober.probe(&fixed).await)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        IngestOutcome::Recorded {
            consecutive_failures: 0
        }
    );
}

#[tokio::test]
async fn test_unparsable_payload_is_protocol_error() {
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
        .mount(&server)
        .await;

    let device = create_test_device(7, &server.address().ip().to_string(), server.address().port());
    let result = create_tcp_prober().probe(&device).await;

    assert_eq!(result.status, ProbeStatus::ProtocolError);
    assert!(result.reachable);
    assert!(result.device_time.is_none());
    assert!(result.diagnostic.contains("login"));
}

#[tokio::test]
async fn test_slow_device_times_out() {
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("result=2025-08-27 10:15:30")
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let device = create_test_device(8, &server.address().ip().to_string(), server.address().port());

    let started = std::time::Instant::now();
    let result = create_tcp_prober().probe(&device).await;

    assert_eq!(result.status, ProbeStatus::Timeout);
    assert!(started.elapsed() < Duration::from_secs(4));
}
