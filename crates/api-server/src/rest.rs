//! Operational endpoints: health, readiness and liveness checks.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use campaign_management::ManagementState;
use serde::Serialize;
use std::time::Instant;
use tracing::warn;

/// Shared application state for the operational handlers.
#[derive(Clone)]
pub struct AppState {
    pub node_id: String,
    pub start_time: Instant,
    pub management: ManagementState,
}

/// GET /health — Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        engine: state.management.controller.adapter().engine().name().to_string(),
    })
}

/// GET /ready — Readiness check for Kubernetes.
/// Returns 200 only while the automation engine answers.
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    if state.management.controller.test_connection().await {
        StatusCode::OK
    } else {
        warn!("Readiness check failed: automation engine unreachable");
        metrics::counter!("api.readiness_failures").increment(1);
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// GET /live — Liveness check for Kubernetes.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
    pub engine: String,
}
