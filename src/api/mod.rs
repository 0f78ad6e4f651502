//! REST API for the monitoring hub
//!
//! Read access to device health plus control over the cycle scheduler.
//!
//! ## Architecture
//!
//! - **Axum** web framework with Tower middleware
//! - **Scheduler and store handles** shared through [`ApiState`]
//! - Every request also gives the scheduler a chance to start a due cycle
//!
//! ## Endpoints
//!
//! - `GET /api/v1/health` - Health check
//! - `GET /api/v1/monitoring/status` - Scheduler state
//! - `POST /api/v1/monitoring/trigger` - Start a cycle now
//! - `POST /api/v1/monitoring/pause` - Stop automated cycles
//! - `POST /api/v1/monitoring/resume` - Allow automated cycles again
//! - `POST /api/v1/monitoring/cleanup` - Run retention cleanup now
//! - `GET /api/v1/monitoring/cycles/latest` - Most recent cycle
//! - `GET /api/v1/monitoring/stats` - Per-status totals over the last `hours`
//! - `GET /api/v1/stats` - Aggregator and storage statistics
//! - `GET /api/v1/batch` - Probe devices without recording anything
//! - `GET /api/v1/devices` - Latest status of every device
//! - `GET /api/v1/devices/{id}/status` - Latest status of one device
//! - `GET /api/v1/devices/{id}/history` - Probe history of one device

pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::ApiState;

use std::net::SocketAddr;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ApiSettings;
use crate::util::{get_bind, get_token};

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Bind address (e.g., "0.0.0.0:8080")
    pub bind_addr: SocketAddr,

    /// Optional bearer token required on every route
    pub auth_token: Option<String>,

    /// Enable CORS for dashboards served elsewhere
    pub enable_cors: bool,
}

impl ApiConfig {
    /// Settings from the config file, with `DVR_HUB_BIND` and `DVR_HUB_TOKEN` taking precedence
    pub fn from_settings(settings: &ApiSettings) -> Self {
        Self {
            bind_addr: get_bind(settings.bind),
            auth_token: get_token(settings.token.clone()),
            enable_cors: settings.enable_cors,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self::from_settings(&ApiSettings::default())
    }
}

/// Build the router with all routes and layers
pub fn router(config: &ApiConfig, state: ApiState) -> Router {
    let mut app = Router::new()
        .route("/api/v1/health", get(routes::health::health_check))
        .route(
            "/api/v1/monitoring/status",
            get(routes::monitoring::get_status),
        )
        .route(
            "/api/v1/monitoring/trigger",
            post(routes::monitoring::trigger_cycle),
        )
        .route("/api/v1/monitoring/pause", post(routes::monitoring::pause))
        .route("/api/v1/monitoring/resume", post(routes::monitoring::resume))
        .route(
            "/api/v1/monitoring/cleanup",
            post(routes::monitoring::run_cleanup),
        )
        .route(
            "/api/v1/monitoring/cycles/latest",
            get(routes::monitoring::latest_cycle),
        )
        .route("/api/v1/monitoring/stats", get(routes::stats::fleet_stats))
        .route("/api/v1/stats", get(routes::stats::get_stats))
        .route("/api/v1/batch", get(routes::batch::batch_status))
        .route("/api/v1/devices", get(routes::devices::list_devices))
        .route(
            "/api/v1/devices/:id/status",
            get(routes::devices::device_status),
        )
        .route(
            "/api/v1/devices/:id/history",
            get(routes::devices::device_history),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auto_monitor::auto_monitor_middleware,
        ))
        .with_state(state);

    if let Some(token) = config.auth_token.clone() {
        app = app.layer(axum::middleware::from_fn_with_state(
            token,
            middleware::auth::auth_middleware,
        ));
    }

    app = app.layer(TraceLayer::new_for_http());

    if config.enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app = app.layer(cors);
    }

    app
}

/// Spawn the API server
///
/// Starts an Axum HTTP server in a background task and returns its local address.
pub async fn spawn_api_server(config: ApiConfig, state: ApiState) -> anyhow::Result<SocketAddr> {
    info!("starting API server on {}", config.bind_addr);

    let app = router(&config, state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let addr = listener.local_addr()?;

    info!("API server listening on {}", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("API server error: {}", e);
        }
    });

    Ok(addr)
}
