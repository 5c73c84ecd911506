//! API request/response types for the campaign endpoints.

use campaign_core::flow::FlowData;
use campaign_core::types::{Campaign, CampaignStatus, ExecutionStatus, Recipient};
use campaign_core::{CampaignError, CampaignResult};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Campaigns ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCampaignRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub segment_id: Option<Uuid>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub flow_data: Option<FlowData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCampaignRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub segment_id: Option<Uuid>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowPayload {
    pub flow_data: FlowData,
}

#[derive(Debug, Deserialize)]
pub struct StatusChangeRequest {
    pub status: CampaignStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    pub scheduled_at: String,
}

impl ScheduleRequest {
    /// Accepts RFC 3339 timestamps, or naive `YYYY-MM-DDTHH:MM[:SS]` values
    /// taken as UTC (what a `datetime-local` input produces).
    pub fn parse(&self) -> CampaignResult<DateTime<Utc>> {
        let raw = self.scheduled_at.trim();
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Ok(ts.with_timezone(&Utc));
        }
        ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
            .map(|naive| naive.and_utc())
            .ok_or_else(|| {
                CampaignError::Validation(format!("scheduledAt '{}' is not an ISO-8601 timestamp", raw))
            })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResponse {
    pub message: String,
    pub execution_id: String,
    pub campaign: Campaign,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    pub message: String,
    pub execution_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryResponse {
    pub message: String,
    pub requeued_count: usize,
}

#[derive(Debug, Serialize)]
pub struct ConnectionResponse {
    pub connected: bool,
}

// ─── Executions ────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ExecutionsQuery {
    pub status: Option<String>,
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

impl ExecutionsQuery {
    /// Empty and `all` mean no filter.
    pub fn status_filter(&self) -> CampaignResult<Option<ExecutionStatus>> {
        match self.status.as_deref().map(str::trim) {
            None | Some("") | Some("all") => Ok(None),
            Some("pending") => Ok(Some(ExecutionStatus::Pending)),
            Some("processing") => Ok(Some(ExecutionStatus::Processing)),
            Some("success") => Ok(Some(ExecutionStatus::Success)),
            Some("failed") => Ok(Some(ExecutionStatus::Failed)),
            Some(other) => Err(CampaignError::Validation(format!(
                "unknown execution status '{}'",
                other
            ))),
        }
    }
}

// ─── Segments ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateSegmentRequest {
    pub name: String,
    #[serde(default)]
    pub recipients: Vec<Recipient>,
}

// ─── Errors ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
