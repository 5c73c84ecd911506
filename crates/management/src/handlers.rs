//! Axum REST handlers for the campaign controller API.

use crate::lifecycle::CampaignController;
use crate::models::*;
use crate::store::CampaignStore;
use crate::ledger::ExecutionLedger;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use campaign_automation::{AutomationEngine, Deployment, DeploymentAdapter, WorkflowStatus};
use campaign_core::types::{Campaign, ExecutionPage, ProgressSnapshot, Segment, StatusTransition};
use campaign_core::{AppConfig, CampaignError};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

/// Shared state for the campaign endpoints.
#[derive(Clone)]
pub struct ManagementState {
    pub controller: Arc<CampaignController>,
}

impl ManagementState {
    /// Wire store, ledger and deployment adapter around `engine`.
    pub fn new(config: &AppConfig, engine: Arc<dyn AutomationEngine>) -> Self {
        let adapter = Arc::new(DeploymentAdapter::new(engine, config.engine.clone()));
        let controller = CampaignController::new(
            Arc::new(CampaignStore::new()),
            Arc::new(ExecutionLedger::new(config.ledger.clone())),
            adapter,
        );
        Self {
            controller: Arc::new(controller),
        }
    }
}

// ─── Errors ────────────────────────────────────────────────────────────────

/// Maps controller errors onto HTTP status codes with an `{error, message}` body.
#[derive(Debug)]
pub struct ApiError(pub CampaignError);

impl From<CampaignError> for ApiError {
    fn from(err: CampaignError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            CampaignError::NotFound(_) => StatusCode::NOT_FOUND,
            CampaignError::Validation(_) | CampaignError::InvalidScheduleTime => StatusCode::BAD_REQUEST,
            CampaignError::InvalidTransition { .. }
            | CampaignError::InvalidRecordTransition(_)
            | CampaignError::WorkflowNotDeployed
            | CampaignError::Conflict(_) => StatusCode::CONFLICT,
            CampaignError::DeploymentRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CampaignError::EngineUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CampaignError::Serialization(_) => StatusCode::BAD_REQUEST,
            CampaignError::Config(_) | CampaignError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, code = self.0.code(), "Request failed");
        }
        metrics::counter!("api.errors", "code" => self.0.code()).increment(1);
        let body = ErrorResponse {
            error: self.0.code().to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(CampaignError::Validation(rejection.body_text()))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self(CampaignError::Validation(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(CampaignError::Validation(rejection.body_text()))
    }
}

// Extractors whose rejections render through `ApiError`.

#[derive(FromRequest)]
#[from_request(via(Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(Path), rejection(ApiError))]
pub struct ApiPath<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(Query), rejection(ApiError))]
pub struct ApiQuery<T>(pub T);

type ApiResult<T> = Result<T, ApiError>;

// ─── Campaigns ─────────────────────────────────────────────────────────────

pub async fn list_campaigns(State(state): State<ManagementState>) -> Json<Vec<Campaign>> {
    Json(state.controller.list_campaigns())
}

pub async fn get_campaign(
    State(state): State<ManagementState>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<Campaign>> {
    Ok(Json(state.controller.get_campaign(id)?))
}

pub async fn create_campaign(
    State(state): State<ManagementState>,
    ApiJson(req): ApiJson<CreateCampaignRequest>,
) -> ApiResult<(StatusCode, Json<Campaign>)> {
    let campaign = state.controller.create_campaign(req)?;
    metrics::counter!("campaigns.created").increment(1);
    Ok((StatusCode::CREATED, Json(campaign)))
}

pub async fn update_campaign(
    State(state): State<ManagementState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<UpdateCampaignRequest>,
) -> ApiResult<Json<Campaign>> {
    Ok(Json(state.controller.update_campaign(id, req).await?))
}

pub async fn delete_campaign(
    State(state): State<ManagementState>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<StatusCode> {
    state.controller.delete_campaign(id).await?;
    metrics::counter!("campaigns.deleted").increment(1);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn campaign_history(
    State(state): State<ManagementState>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<Vec<StatusTransition>>> {
    Ok(Json(state.controller.history(id)?))
}

// ─── Flow ──────────────────────────────────────────────────────────────────

pub async fn get_flow(
    State(state): State<ManagementState>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<FlowPayload>> {
    let flow_data = state.controller.get_flow(id)?;
    Ok(Json(FlowPayload { flow_data }))
}

pub async fn save_flow(
    State(state): State<ManagementState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<FlowPayload>,
) -> ApiResult<Json<Campaign>> {
    Ok(Json(state.controller.save_flow(id, req.flow_data).await?))
}

// ─── Status ────────────────────────────────────────────────────────────────

pub async fn change_status(
    State(state): State<ManagementState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<StatusChangeRequest>,
) -> ApiResult<Json<Campaign>> {
    Ok(Json(state.controller.change_status(id, req.status).await?))
}

pub async fn schedule_campaign(
    State(state): State<ManagementState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<ScheduleRequest>,
) -> ApiResult<Json<Campaign>> {
    let at = req.parse()?;
    Ok(Json(state.controller.schedule(id, at).await?))
}

pub async fn run_now(
    State(state): State<ManagementState>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<RunResponse>> {
    let run = state.controller.run_now(id).await?;
    Ok(Json(RunResponse {
        message: "Campaign started".to_string(),
        execution_id: run.execution_id,
        campaign: run.campaign,
    }))
}

pub async fn pause_campaign(
    State(state): State<ManagementState>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<Campaign>> {
    Ok(Json(state.controller.pause(id).await?))
}

pub async fn resume_campaign(
    State(state): State<ManagementState>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<Campaign>> {
    Ok(Json(state.controller.resume(id).await?))
}

pub async fn retry_failed(
    State(state): State<ManagementState>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<RetryResponse>> {
    let requeued_count = state.controller.retry_failed(id).await?;
    let message = if requeued_count == 0 {
        "No failed executions to retry".to_string()
    } else {
        format!("Requeued {} failed executions", requeued_count)
    };
    Ok(Json(RetryResponse {
        message,
        requeued_count,
    }))
}

// ─── Deployment ────────────────────────────────────────────────────────────

pub async fn deploy_flow(
    State(state): State<ManagementState>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<Deployment>> {
    Ok(Json(state.controller.deploy_flow(id).await?))
}

pub async fn workflow_status(
    State(state): State<ManagementState>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<WorkflowStatus>> {
    Ok(Json(state.controller.workflow_status(id).await?))
}

pub async fn trigger_workflow(
    State(state): State<ManagementState>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<TriggerResponse>> {
    let execution = state.controller.trigger_workflow(id).await?;
    Ok(Json(TriggerResponse {
        message: "Workflow triggered".to_string(),
        execution_id: execution.id,
    }))
}

pub async fn test_connection(State(state): State<ManagementState>) -> Json<ConnectionResponse> {
    Json(ConnectionResponse {
        connected: state.controller.test_connection().await,
    })
}

// ─── Progress ──────────────────────────────────────────────────────────────

pub async fn campaign_progress(
    State(state): State<ManagementState>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<ProgressSnapshot>> {
    Ok(Json(state.controller.progress(id)?))
}

pub async fn list_executions(
    State(state): State<ManagementState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiQuery(query): ApiQuery<ExecutionsQuery>,
) -> ApiResult<Json<ExecutionPage>> {
    let status = query.status_filter()?;
    let page = query.page.unwrap_or(1);
    let limit = query
        .limit
        .unwrap_or_else(|| state.controller.ledger().default_page_size());
    Ok(Json(state.controller.executions(id, status, page, limit)?))
}

// ─── Segments ──────────────────────────────────────────────────────────────

pub async fn list_segments(State(state): State<ManagementState>) -> Json<Vec<Segment>> {
    Json(state.controller.store().list_segments())
}

pub async fn create_segment(
    State(state): State<ManagementState>,
    ApiJson(req): ApiJson<CreateSegmentRequest>,
) -> ApiResult<(StatusCode, Json<Segment>)> {
    let segment = state.controller.store().create_segment(req)?;
    Ok((StatusCode::CREATED, Json(segment)))
}

/// Fallback for unknown routes under the API prefix.
pub async fn not_found() -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "not_found", "message": "No such endpoint" })),
    )
}
