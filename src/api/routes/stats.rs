//! Fleet and hub statistics endpoints

use axum::{
    Json,
    extract::{Query, State},
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::api::{
    error::{ApiError, ApiResult},
    state::ApiState,
};
use crate::storage::FleetStats;

const DEFAULT_WINDOW_HOURS: u32 = 24;

/// One year of history at most
const MAX_WINDOW_HOURS: u32 = 24 * 366;

#[derive(Debug, Deserialize)]
pub struct StatsParams {
    /// Window size in hours, counted back from now (default: 24)
    hours: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct FleetStatsResponse {
    pub hours: u32,

    #[serde(flatten)]
    pub stats: FleetStats,
}

/// GET /api/v1/monitoring/stats?hours=N
///
/// Checks and distinct devices per status over the last `hours`
pub async fn fleet_stats(
    State(state): State<ApiState>,
    Query(params): Query<StatsParams>,
) -> ApiResult<Json<FleetStatsResponse>> {
    let hours = params.hours.unwrap_or(DEFAULT_WINDOW_HOURS);
    if !(1..=MAX_WINDOW_HOURS).contains(&hours) {
        return Err(ApiError::InvalidRequest(format!(
            "hours must be between 1 and {MAX_WINDOW_HOURS}"
        )));
    }

    let since = Utc::now() - Duration::hours(i64::from(hours));
    let stats = state.store.history_stats(since).await?;

    Ok(Json(FleetStatsResponse { hours, stats }))
}

/// GET /api/v1/stats
///
/// Aggregator counters and storage statistics
pub async fn get_stats(State(state): State<ApiState>) -> ApiResult<Json<Value>> {
    let aggregator = state.aggregator.stats().await?;
    let storage = state.store.get_stats().await?;

    Ok(Json(json!({
        "timestamp": Utc::now().to_rfc3339(),
        "aggregator": aggregator,
        "storage": storage,
        "scheduler": state.scheduler.status(Utc::now()),
    })))
}
