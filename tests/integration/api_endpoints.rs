//! Integration tests for API endpoints
//!
//! These tests verify that:
//! - All REST endpoints return correct responses
//! - Authentication middleware functions properly
//! - Requests give the scheduler a chance to start a due cycle
//! - Pausing stops request-driven cycles but not manual triggers
//! - Fleet stats reflect the recorded history
//! - Error handling is correct

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use dvr_monitoring::{
    ProbeStatus,
    api::{ApiConfig, ApiState, router, spawn_api_server},
    storage::memory::MemoryBackend,
};
use pretty_assertions::assert_eq;
use serde_json::Value;
use tower::ServiceExt;

use crate::helpers::{
    ScriptedProbe, TestHub, create_fleet, create_test_hub, default_scheduler_settings,
};

const TOKEN: &str = "test-token";

async fn create_hub(probe: ScriptedProbe) -> TestHub {
    create_test_hub(
        Arc::new(MemoryBackend::new()),
        &create_fleet(3),
        Arc::new(probe),
        default_scheduler_settings(),
    )
    .await
}

fn api_state(hub: &TestHub) -> ApiState {
    ApiState::new(
        hub.scheduler.clone(),
        hub.store.clone(),
        hub.aggregator.clone(),
        hub.pool.clone(),
        hub.registry.clone(),
        10,
    )
}

fn test_config(auth_token: Option<&str>) -> ApiConfig {
    ApiConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(), // Random port
        auth_token: auth_token.map(str::to_string),
        enable_cors: true,
    }
}

async fn spawn_test_api(hub: &TestHub) -> SocketAddr {
    spawn_api_server(test_config(Some(TOKEN)), api_state(hub))
        .await
        .unwrap()
}

async fn get_json(addr: SocketAddr, path: &str) -> (StatusCode, Value) {
    let response = reqwest::Client::new()
        .get(format!("http://{addr}{path}"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();

    let status = StatusCode::from_u16(response.status().as_u16()).unwrap();
    (status, response.json().await.unwrap())
}

async fn post_json(addr: SocketAddr, path: &str) -> (StatusCode, Value) {
    let response = reqwest::Client::new()
        .post(format!("http://{addr}{path}"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();

    let status = StatusCode::from_u16(response.status().as_u16()).unwrap();
    (status, response.json().await.unwrap())
}

#[tokio::test]
async fn test_health_endpoint() {
    let hub = create_hub(ScriptedProbe::healthy()).await;
    let addr = spawn_test_api(&hub).await;

    let (status, body) = get_json(addr, "/api/v1/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["storage"], true);
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_auth_required() {
    let hub = create_hub(ScriptedProbe::healthy()).await;
    let addr = spawn_test_api(&hub).await;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/api/v1/devices");

    let missing = client.get(&url).send().await.unwrap();
    assert_eq!(missing.status().as_u16(), 401);

    let malformed = client
        .get(&url)
        .header("Authorization", TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(malformed.status().as_u16(), 401);

    let wrong = client.get(&url).bearer_auth("nope").send().await.unwrap();
    assert_eq!(wrong.status().as_u16(), 403);

    // rejected requests must not start cycles
    assert!(hub.store.latest_cycle().await.unwrap().is_none());
}

#[tokio::test]
async fn test_request_starts_first_cycle() {
    let hub = create_hub(ScriptedProbe::healthy()).await;
    let addr = spawn_test_api(&hub).await;

    let (status, _) = get_json(addr, "/api/v1/health").await;
    assert_eq!(status, StatusCode::OK);

    hub.scheduler.wait_idle().await;

    let (status, cycle) = get_json(addr, "/api/v1/monitoring/cycles/latest").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cycle["id"], 1);
    assert_eq!(cycle["trigger"], "auto_start");
    assert_eq!(cycle["status"], "COMPLETED");
    assert_eq!(cycle["summary"]["total"], 3);

    let (_, status_body) = get_json(addr, "/api/v1/monitoring/status").await;
    assert_eq!(status_body["active"], false);
    assert!(status_body["last_cycle_at"].is_string());
    assert!(status_body["current_cycle_id"].is_null());
}

#[tokio::test]
async fn test_manual_trigger() {
    let hub = create_hub(
        ScriptedProbe::healthy().with_delay(std::time::Duration::from_millis(100)),
    )
    .await;
    let addr = spawn_test_api(&hub).await;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/api/v1/monitoring/trigger");

    let first: Value = client
        .post(&url)
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["started"], true);
    assert_eq!(first["cycle_id"], 1);

    let second: Value = client
        .post(&url)
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(second["started"], false);
    assert_eq!(second["cycle_id"], 1);

    hub.scheduler.wait_idle().await;
    let cycle = hub.store.latest_cycle().await.unwrap().unwrap();
    assert_eq!(cycle.trigger.as_str(), "manual");
}

#[tokio::test]
async fn test_device_status_and_history() {
    let hub = create_hub(ScriptedProbe::healthy().with_outcome(2, ProbeStatus::AuthFailed)).await;
    let addr = spawn_test_api(&hub).await;

    // the first request starts the cycle; wait for it before reading results
    let _ = get_json(addr, "/api/v1/health").await;
    hub.scheduler.wait_idle().await;

    let (status, devices) = get_json(addr, "/api/v1/devices").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(devices["count"], 3);
    assert!(devices["devices"][0]["password"].is_null());
    assert_eq!(devices["devices"][1]["snapshot"]["status"], "AUTH_FAILED");

    let (status, snapshot) = get_json(addr, "/api/v1/devices/2/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["consecutive_failures"], 1);
    assert_eq!(snapshot["cycle_id"], 1);

    let (status, history) = get_json(addr, "/api/v1/devices/1/history?limit=5").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history["count"], 1);
    assert_eq!(history["history"][0]["status"], "SUCCESS");

    let (status, missing) = get_json(addr, "/api/v1/devices/99/status").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(missing["error"].is_string());
}

#[tokio::test]
async fn test_history_rejects_inverted_range() {
    let hub = create_hub(ScriptedProbe::healthy()).await;
    let addr = spawn_test_api(&hub).await;

    let (status, body) = get_json(
        addr,
        "/api/v1/devices/1/history?start=2025-08-27T12:00:00Z&end=2025-08-27T10:00:00Z",
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("start"));
}

#[tokio::test]
async fn test_batch_endpoint_does_not_persist() {
    let hub = create_hub(
        ScriptedProbe::healthy()
            .with_outcome(1, ProbeStatus::Timeout)
            .with_outcome(3, ProbeStatus::Unreachable),
    )
    .await;

    // no token configured, requests go through the router directly
    let app = router(&test_config(None), api_state(&hub));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/batch?concurrency=500")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();

    assert_eq!(body["total"], 3);
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);

    let timeout = results.iter().find(|r| r["device_id"] == 1).unwrap();
    assert_eq!(timeout["status"], "TIMEOUT");
    assert!(timeout["error"].is_string());

    let healthy = results.iter().find(|r| r["device_id"] == 2).unwrap();
    assert_eq!(healthy["status"], "SUCCESS");
    assert!(healthy.get("error").is_none());

    // the auto-monitor middleware may have started a cycle, but batch itself records nothing
    hub.scheduler.wait_idle().await;
    let cycles = hub.store.latest_cycle().await.unwrap().map(|c| c.id);
    assert!(cycles.is_none() || cycles == Some(1));
}

#[tokio::test]
async fn test_pause_stops_automated_cycles_only() {
    let hub = create_hub(ScriptedProbe::healthy()).await;
    let addr = spawn_test_api(&hub).await;

    let (status, paused) = post_json(addr, "/api/v1/monitoring/pause").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(paused["changed"], true);
    assert_eq!(paused["status"]["paused"], true);

    // traffic no longer starts cycles
    let (status, _) = get_json(addr, "/api/v1/health").await;
    assert_eq!(status, StatusCode::OK);
    assert!(hub.store.latest_cycle().await.unwrap().is_none());

    let (_, again) = post_json(addr, "/api/v1/monitoring/pause").await;
    assert_eq!(again["changed"], false);

    let (_, manual) = post_json(addr, "/api/v1/monitoring/trigger").await;
    assert_eq!(manual["started"], true);
    hub.scheduler.wait_idle().await;

    let (_, resumed) = post_json(addr, "/api/v1/monitoring/resume").await;
    assert_eq!(resumed["changed"], true);
    assert_eq!(resumed["status"]["paused"], false);

    let (_, status_body) = get_json(addr, "/api/v1/monitoring/status").await;
    assert_eq!(status_body["paused"], false);
}

#[tokio::test]
async fn test_fleet_stats_over_window() {
    let hub = create_hub(ScriptedProbe::healthy().with_outcome(2, ProbeStatus::AuthFailed)).await;
    let addr = spawn_test_api(&hub).await;

    let _ = get_json(addr, "/api/v1/health").await;
    hub.scheduler.wait_idle().await;

    let (status, stats) = get_json(addr, "/api/v1/monitoring/stats?hours=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["hours"], 1);
    assert_eq!(stats["total_checks"], 3);
    assert_eq!(stats["devices_checked"], 3);
    assert_eq!(stats["by_status"]["SUCCESS"]["checks"], 2);
    assert_eq!(stats["by_status"]["SUCCESS"]["devices"], 2);
    assert_eq!(stats["by_status"]["AUTH_FAILED"]["devices"], 1);
    assert_eq!(stats["by_status"]["TIMEOUT"]["checks"], 0);

    let (status, defaults) = get_json(addr, "/api/v1/monitoring/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(defaults["hours"], 24);

    let (status, body) = get_json(addr, "/api/v1/monitoring/stats?hours=0").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("hours"));
}

#[tokio::test]
async fn test_hub_stats_and_cleanup() {
    let hub = create_hub(ScriptedProbe::healthy()).await;
    let addr = spawn_test_api(&hub).await;

    let _ = get_json(addr, "/api/v1/health").await;
    hub.scheduler.wait_idle().await;

    let (status, stats) = get_json(addr, "/api/v1/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["aggregator"]["ingested"], 3);
    assert_eq!(stats["aggregator"]["cycles_finalized"], 1);
    assert!(stats["storage"].as_str().unwrap().contains("3 history rows"));
    assert_eq!(stats["scheduler"]["active"], false);

    // the test hub keeps history forever, so nothing is removed
    let (status, cleanup) = post_json(addr, "/api/v1/monitoring/cleanup").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cleanup["deleted"], 0);
}
