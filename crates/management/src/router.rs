//! Campaign API router — mounts the controller endpoints under /api/v1.

use crate::handlers::{self, ManagementState};
use axum::routing::{get, patch, post};
use axum::Router;

/// Build the campaign router with all endpoints.
/// Returns a Router that should be merged into the main app.
pub fn campaign_router(state: ManagementState) -> Router {
    Router::new()
        // Campaigns
        .route("/api/v1/campaigns", get(handlers::list_campaigns).post(handlers::create_campaign))
        .route(
            "/api/v1/campaigns/:id",
            get(handlers::get_campaign)
                .put(handlers::update_campaign)
                .delete(handlers::delete_campaign),
        )
        .route("/api/v1/campaigns/:id/history", get(handlers::campaign_history))
        // Flow
        .route("/api/v1/campaigns/:id/flow", get(handlers::get_flow).patch(handlers::save_flow))
        // Lifecycle
        .route("/api/v1/campaigns/:id/status", patch(handlers::change_status))
        .route("/api/v1/campaigns/:id/schedule", post(handlers::schedule_campaign))
        .route("/api/v1/campaigns/:id/run-now", post(handlers::run_now))
        .route("/api/v1/campaigns/:id/pause", post(handlers::pause_campaign))
        .route("/api/v1/campaigns/:id/resume", post(handlers::resume_campaign))
        .route("/api/v1/campaigns/:id/retry-failed", post(handlers::retry_failed))
        // Deployment
        .route("/api/v1/campaigns/:id/deploy-flow", post(handlers::deploy_flow))
        .route("/api/v1/campaigns/:id/workflow-status", get(handlers::workflow_status))
        .route("/api/v1/campaigns/:id/trigger-workflow", post(handlers::trigger_workflow))
        .route("/api/v1/n8n/test-connection", get(handlers::test_connection))
        .route("/api/v1/campaigns/n8n/test-connection", get(handlers::test_connection))
        // Progress
        .route("/api/v1/campaigns/:id/progress", get(handlers::campaign_progress))
        .route("/api/v1/campaigns/:id/executions", get(handlers::list_executions))
        // Segments
        .route("/api/v1/segments", get(handlers::list_segments).post(handlers::create_segment))
        .with_state(state)
}
