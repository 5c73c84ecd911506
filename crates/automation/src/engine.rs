//! Automation engine seam and the execution records it reports.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::n8n::N8nWorkflow;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine unreachable: {0}")]
    Unreachable(String),

    #[error("engine rejected request: {0}")]
    Rejected(String),

    #[error("{0} not found on engine")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Manual,
    Trigger,
    Webhook,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Manual => "manual",
            ExecutionMode::Trigger => "trigger",
            ExecutionMode::Webhook => "webhook",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EngineExecutionStatus {
    Running,
    Waiting,
    Success,
    Error,
}

/// An execution as reported by the engine (not a ledger record).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_id: String,
    pub status: EngineExecutionStatus,
    pub finished: bool,
    pub mode: ExecutionMode,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowExecution {
    pub fn succeeded(&self) -> bool {
        self.status == EngineExecutionStatus::Success
    }
}

/// Operations the controller needs from an automation engine.
///
/// Implementations may block on the network; callers bound every call with a
/// timeout.
#[async_trait]
pub trait AutomationEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Register a workflow, returning the engine's workflow id.
    async fn create_workflow(&self, workflow: &N8nWorkflow) -> Result<String, EngineError>;

    async fn activate_workflow(&self, workflow_id: &str) -> Result<(), EngineError>;

    async fn delete_workflow(&self, workflow_id: &str) -> Result<(), EngineError>;

    /// Start one execution with `payload` as the trigger input.
    async fn execute(
        &self,
        workflow_id: &str,
        payload: serde_json::Value,
        mode: ExecutionMode,
    ) -> Result<WorkflowExecution, EngineError>;

    /// Most recent executions first.
    async fn list_executions(
        &self,
        workflow_id: &str,
        limit: usize,
    ) -> Result<Vec<WorkflowExecution>, EngineError>;

    async fn ping(&self) -> Result<(), EngineError>;
}
