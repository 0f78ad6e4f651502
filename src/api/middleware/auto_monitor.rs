//! Request-driven cycle start
//!
//! Any API traffic doubles as a scheduler tick, so a hub whose background loop is
//! stalled still polls the fleet while someone is looking at it.

use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use tracing::{debug, error, trace};

use crate::api::state::ApiState;

/// Routes that decide on their own whether a cycle starts
const SKIPPED_PATHS: &[&str] = &[
    "/api/v1/monitoring/trigger",
    "/api/v1/monitoring/pause",
    "/api/v1/monitoring/resume",
];

pub async fn auto_monitor_middleware(
    State(state): State<ApiState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !SKIPPED_PATHS.contains(&request.uri().path()) {
        match state.scheduler.check_and_run(Utc::now()).await {
            Ok(admission) if admission.started => {
                debug!(
                    "request to {} started cycle {:?}",
                    request.uri().path(),
                    admission.cycle_id
                );
            }
            Ok(admission) => trace!("no cycle started: {}", admission.reason),
            Err(e) => error!("auto-monitoring failed: {e:#}"),
        }
    }

    next.run(request).await
}
