//! Campaign domain types shared by the controller, the ledger and the API.
//!
//! Everything serializes as camelCase because the dashboard consumes these
//! records verbatim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::flow::FlowData;

// ─── Campaign ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: CampaignStatus,
    pub segment_id: Option<Uuid>,
    #[serde(default)]
    pub flow_data: FlowData,
    #[serde(rename = "n8nWorkflowId")]
    pub n8n_workflow_id: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    /// Set when the current run was started.
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deployed_at: Option<DateTime<Utc>>,
    pub flow_updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub counters: CampaignCounters,
    /// Bumped on every persisted mutation; used for optimistic status writes.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: description.into(),
            status: CampaignStatus::Draft,
            segment_id: None,
            flow_data: FlowData::default(),
            n8n_workflow_id: None,
            scheduled_at: None,
            start_date: None,
            end_date: None,
            started_at: None,
            completed_at: None,
            deployed_at: None,
            flow_updated_at: None,
            counters: CampaignCounters::default(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_deployed(&self) -> bool {
        self.n8n_workflow_id.is_some()
    }

    /// The flow was saved after the last successful deployment.
    pub fn is_deployment_stale(&self) -> bool {
        match (self.deployed_at, self.flow_updated_at) {
            (Some(deployed), Some(edited)) => edited > deployed,
            _ => false,
        }
    }

    /// Mark the record as mutated.
    pub fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CampaignCounters {
    pub total_users_targeted: u64,
    pub total_jobs_created: u64,
    pub total_sent: u64,
    pub total_failed: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Running,
    Paused,
    Completed,
    Failed,
}

impl CampaignStatus {
    pub const ALL: [CampaignStatus; 6] = [
        CampaignStatus::Draft,
        CampaignStatus::Scheduled,
        CampaignStatus::Running,
        CampaignStatus::Paused,
        CampaignStatus::Completed,
        CampaignStatus::Failed,
    ];

    /// Statuses reachable from `self` in a single transition.
    pub fn allowed_transitions(self) -> &'static [CampaignStatus] {
        use CampaignStatus::*;
        match self {
            Draft => &[Scheduled],
            Scheduled => &[Running, Draft],
            Running => &[Paused, Completed, Failed],
            Paused => &[Running, Failed],
            Completed => &[],
            Failed => &[Draft],
        }
    }

    pub fn can_transition_to(self, target: CampaignStatus) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_transitions().is_empty()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Running => "running",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded status change in a campaign's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusTransition {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub from: CampaignStatus,
    pub to: CampaignStatus,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

// ─── Segments ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recipient {
    pub email: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: Uuid,
    pub name: String,
    pub recipients: Vec<Recipient>,
    pub created_at: DateTime<Utc>,
}

// ─── Execution Ledger ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Success | ExecutionStatus::Failed)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Processing => "processing",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Per-recipient send state for a campaign run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub email: String,
    pub name: String,
    pub status: ExecutionStatus,
    pub attempts: u32,
    pub processed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Insertion order within the campaign.
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn pending(campaign_id: Uuid, recipient: &Recipient, sequence: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            campaign_id,
            email: recipient.email.clone(),
            name: recipient.name.clone(),
            status: ExecutionStatus::Pending,
            attempts: 0,
            processed_at: None,
            last_error: None,
            sequence,
            created_at: Utc::now(),
        }
    }

    pub fn recipient(&self) -> Recipient {
        Recipient {
            email: self.email.clone(),
            name: self.name.clone(),
        }
    }
}

/// One page of execution records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPage {
    pub data: Vec<ExecutionRecord>,
    pub page: usize,
    /// Page size actually applied after capping.
    pub limit: usize,
    pub total_pages: usize,
    pub total: usize,
}

/// Aggregate progress of a campaign, derived from its execution records.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub total_recipients: u64,
    pub processed_count: u64,
    pub success_count: u64,
    pub failed_count: u64,
    pub pending_count: u64,
    pub processing_count: u64,
    pub progress_percent: f64,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_completion: Option<DateTime<Utc>>,
}
