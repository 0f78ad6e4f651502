//! On-demand batch status endpoint

use axum::{
    Json,
    extract::{Query, State},
};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::api::{
    error::{ApiError, ApiResult},
    state::ApiState,
};
use crate::registry::DeviceFilter;
use crate::{DeviceId, ProbeResult, ProbeStatus};

#[derive(Debug, Deserialize)]
pub struct BatchQuery {
    /// Concurrent probes (clamped to 1..=max, default from configuration)
    concurrency: Option<usize>,

    /// Only devices of this group
    group: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub total: usize,
    pub results: Vec<BatchEntry>,
}

#[derive(Debug, Serialize)]
pub struct BatchEntry {
    pub device_id: DeviceId,
    pub status: ProbeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_time: Option<DateTime<FixedOffset>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<ProbeResult> for BatchEntry {
    fn from(result: ProbeResult) -> Self {
        let latency_ms = result.latency_ms();
        let error = (!result.status.is_success()).then_some(result.diagnostic);

        Self {
            device_id: result.device_id,
            status: result.status,
            latency_ms,
            device_time: result.device_time,
            error,
        }
    }
}

/// GET /api/v1/batch?concurrency=N&group=G
///
/// Probe every active device now and return all results. Nothing is persisted and
/// no cycle is recorded.
#[instrument(skip(state))]
pub async fn batch_status(
    State(state): State<ApiState>,
    Query(query): Query<BatchQuery>,
) -> ApiResult<Json<BatchResponse>> {
    let filter = DeviceFilter::active().with_group(query.group);
    let devices = state
        .registry
        .devices(&filter)
        .await
        .map_err(|e| ApiError::RegistryUnavailable(format!("{e:#}")))?;

    let concurrency = query.concurrency.unwrap_or(state.default_concurrency);
    debug!(
        "batch probing {} devices at concurrency {}",
        devices.len(),
        state.pool.clamp(concurrency)
    );

    let results = state.pool.process(devices, concurrency).await;

    Ok(Json(BatchResponse {
        total: results.len(),
        results: results.into_iter().map(BatchEntry::from).collect(),
    }))
}
