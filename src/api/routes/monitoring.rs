//! Scheduler status and control endpoints

use axum::{Json, extract::State};
use chrono::Utc;
use serde::Serialize;

use crate::MonitoringCycle;
use crate::api::{
    error::{ApiError, ApiResult},
    state::ApiState,
};
use crate::scheduler::{Admission, SchedulerStatus};

/// GET /api/v1/monitoring/status
pub async fn get_status(State(state): State<ApiState>) -> Json<SchedulerStatus> {
    Json(state.scheduler.status(Utc::now()))
}

/// POST /api/v1/monitoring/trigger
///
/// Start a cycle immediately unless one is already running
pub async fn trigger_cycle(State(state): State<ApiState>) -> ApiResult<Json<Admission>> {
    let admission = state.scheduler.trigger_manual(Utc::now()).await?;
    Ok(Json(admission))
}

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    /// False when the scheduler was already in the requested state
    pub changed: bool,
    pub status: SchedulerStatus,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub deleted: usize,
}

/// POST /api/v1/monitoring/pause
///
/// Stop automated cycles; manual triggers keep working
pub async fn pause(State(state): State<ApiState>) -> Json<ControlResponse> {
    let changed = state.scheduler.pause();
    Json(ControlResponse {
        changed,
        status: state.scheduler.status(Utc::now()),
    })
}

/// POST /api/v1/monitoring/resume
pub async fn resume(State(state): State<ApiState>) -> Json<ControlResponse> {
    let changed = state.scheduler.resume();
    Json(ControlResponse {
        changed,
        status: state.scheduler.status(Utc::now()),
    })
}

/// POST /api/v1/monitoring/cleanup
///
/// Run the retention cleanup now instead of waiting for its interval
pub async fn run_cleanup(State(state): State<ApiState>) -> ApiResult<Json<CleanupResponse>> {
    let deleted = state.aggregator.cleanup().await?;
    Ok(Json(CleanupResponse { deleted }))
}

/// GET /api/v1/monitoring/cycles/latest
pub async fn latest_cycle(State(state): State<ApiState>) -> ApiResult<Json<MonitoringCycle>> {
    state
        .store
        .latest_cycle()
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("no cycle has run yet".to_string()))
}
