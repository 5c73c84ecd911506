use thiserror::Error;

use crate::types::CampaignStatus;

pub type CampaignResult<T> = Result<T, CampaignError>;

#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("Cannot change status from {from} to {to}")]
    InvalidTransition {
        from: CampaignStatus,
        to: CampaignStatus,
    },

    #[error("Invalid execution record transition: {0}")]
    InvalidRecordTransition(String),

    #[error("Campaign has no deployed workflow. Deploy the flow first")]
    WorkflowNotDeployed,

    #[error("Scheduled time must be in the future")]
    InvalidScheduleTime,

    #[error("Workflow deployment rejected: {0}")]
    DeploymentRejected(String),

    #[error("Automation engine unreachable: {0}")]
    EngineUnreachable(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CampaignError {
    /// Stable machine-readable code surfaced in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            CampaignError::InvalidTransition { .. } => "invalid_transition",
            CampaignError::InvalidRecordTransition(_) => "invalid_transition",
            CampaignError::WorkflowNotDeployed => "workflow_not_deployed",
            CampaignError::InvalidScheduleTime => "invalid_schedule_time",
            CampaignError::DeploymentRejected(_) => "deployment_rejected",
            CampaignError::EngineUnreachable(_) => "engine_unreachable",
            CampaignError::NotFound(_) => "not_found",
            CampaignError::Validation(_) => "validation_error",
            CampaignError::Conflict(_) => "conflict",
            CampaignError::Config(_) => "config_error",
            CampaignError::Serialization(_) => "serialization_error",
            CampaignError::Internal(_) => "internal_error",
        }
    }

    pub fn campaign_not_found(id: impl std::fmt::Display) -> Self {
        CampaignError::NotFound(format!("Campaign {}", id))
    }
}
