//! Device status and history endpoints

use axum::{
    Json,
    extract::{Path, Query, State},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::{
    error::{ApiError, ApiResult},
    state::ApiState,
};
use crate::registry::DeviceFilter;
use crate::storage::{HistoryEntry, HistoryQuery, StatusSnapshot};
use crate::{Device, DeviceId};

/// Query parameters for a history time range
#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    /// Start time (RFC 3339, inclusive)
    start: Option<DateTime<Utc>>,

    /// End time (RFC 3339, inclusive)
    end: Option<DateTime<Utc>>,

    /// Max results (default: 100, at most 1000)
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct DeviceStatus {
    #[serde(flatten)]
    pub device: Device,

    /// Absent until the device has been probed once
    pub snapshot: Option<StatusSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct DevicesResponse {
    pub count: usize,
    pub devices: Vec<DeviceStatus>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub device_id: DeviceId,
    pub count: usize,
    pub history: Vec<HistoryEntry>,
}

/// GET /api/v1/devices
///
/// Every registered device with its latest snapshot
pub async fn list_devices(State(state): State<ApiState>) -> ApiResult<Json<DevicesResponse>> {
    let devices = state.store.list_devices(&DeviceFilter::default()).await?;
    let mut snapshots = state.store.snapshots().await?;

    let devices: Vec<DeviceStatus> = devices
        .into_iter()
        .map(|device| {
            let snapshot = snapshots
                .iter()
                .position(|s| s.result.device_id == device.id)
                .map(|i| snapshots.swap_remove(i));
            DeviceStatus { device, snapshot }
        })
        .collect();

    Ok(Json(DevicesResponse {
        count: devices.len(),
        devices,
    }))
}

/// GET /api/v1/devices/{id}/status
pub async fn device_status(
    State(state): State<ApiState>,
    Path(id): Path<DeviceId>,
) -> ApiResult<Json<StatusSnapshot>> {
    state
        .store
        .snapshot(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no status recorded for device {id}")))
}

/// GET /api/v1/devices/{id}/history?start&end&limit
///
/// Probe results of one device, most recent first
pub async fn device_history(
    State(state): State<ApiState>,
    Path(id): Path<DeviceId>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Json<HistoryResponse>> {
    if let (Some(start), Some(end)) = (params.start, params.end) {
        if start > end {
            return Err(ApiError::InvalidRequest(
                "start must not be after end".to_string(),
            ));
        }
    }

    let query = HistoryQuery {
        device_id: id,
        start: params.start,
        end: params.end,
        limit: params
            .limit
            .unwrap_or(HistoryQuery::DEFAULT_LIMIT)
            .clamp(1, HistoryQuery::MAX_LIMIT),
    };

    let history = state.store.query_history(query).await?;

    Ok(Json(HistoryResponse {
        device_id: id,
        count: history.len(),
        history,
    }))
}
