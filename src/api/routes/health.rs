//! Health check endpoint

use axum::{Json, extract::State};
use serde::Serialize;

use crate::api::state::ApiState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
    pub storage: bool,
}

/// GET /api/v1/health
///
/// Liveness of the hub plus whether its store answers
pub async fn health_check(State(state): State<ApiState>) -> Json<HealthResponse> {
    let storage = state
        .store
        .health_check()
        .await
        .map(|health| health.healthy)
        .unwrap_or(false);

    Json(HealthResponse {
        status: "ok",
        timestamp: chrono::Utc::now().to_rfc3339(),
        storage,
    })
}
