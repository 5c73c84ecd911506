//! Deployment adapter — the controller's only path to the automation engine.
//!
//! Every engine call is bounded by `engine.timeout_ms`; a timeout or
//! transport failure surfaces as `EngineUnreachable` and is never retried
//! here.

use campaign_core::config::EngineConfig;
use campaign_core::flow::FlowData;
use campaign_core::types::{Campaign, Recipient};
use campaign_core::{CampaignError, CampaignResult};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::{AutomationEngine, EngineError, ExecutionMode, WorkflowExecution};
use crate::n8n;

/// Result of a successful deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    #[serde(rename = "n8nWorkflowId")]
    pub n8n_workflow_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

/// Deployment state plus recent engine executions for a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    pub is_deployed: bool,
    #[serde(rename = "n8nWorkflowId")]
    pub n8n_workflow_id: Option<String>,
    /// Flow was edited after the last deployment.
    pub is_stale: bool,
    pub executions: Vec<WorkflowExecution>,
}

pub struct DeploymentAdapter {
    engine: Arc<dyn AutomationEngine>,
    config: EngineConfig,
}

impl DeploymentAdapter {
    pub fn new(engine: Arc<dyn AutomationEngine>, config: EngineConfig) -> Self {
        info!(
            engine = engine.name(),
            base_url = %config.base_url,
            timeout_ms = config.timeout_ms,
            "Deployment adapter initialized"
        );
        Self { engine, config }
    }

    pub fn engine(&self) -> &Arc<dyn AutomationEngine> {
        &self.engine
    }

    /// Translate and register `flow` as the campaign's workflow, then activate it.
    ///
    /// A previously deployed workflow is removed once the new one is active.
    /// Nothing is left behind on the engine if activation fails.
    pub async fn deploy(&self, campaign: &Campaign, flow: &FlowData) -> CampaignResult<Deployment> {
        let workflow = n8n::translate(campaign.id, &campaign.name, flow)?;
        let workflow_id = self.call("create_workflow", self.engine.create_workflow(&workflow)).await?;

        if let Err(e) = self.call("activate_workflow", self.engine.activate_workflow(&workflow_id)).await {
            warn!(campaign_id = %campaign.id, workflow_id = %workflow_id, error = %e, "Activation failed, removing workflow");
            if let Err(cleanup) = self.call("delete_workflow", self.engine.delete_workflow(&workflow_id)).await {
                warn!(workflow_id = %workflow_id, error = %cleanup, "Failed to remove inactive workflow");
            }
            return Err(e);
        }

        if let Some(previous) = campaign.n8n_workflow_id.as_deref().filter(|p| *p != workflow_id) {
            if let Err(e) = self.call("delete_workflow", self.engine.delete_workflow(previous)).await {
                warn!(campaign_id = %campaign.id, workflow_id = %previous, error = %e, "Failed to remove superseded workflow");
            }
        }

        let webhook_url = match workflow.webhook_path() {
            Some(path) => Some(self.webhook_url(path)?),
            None => None,
        };

        info!(
            campaign_id = %campaign.id,
            workflow_id = %workflow_id,
            nodes = workflow.nodes.len(),
            "Flow deployed"
        );
        metrics::counter!("engine.deployments").increment(1);

        Ok(Deployment {
            n8n_workflow_id: workflow_id,
            webhook_url,
        })
    }

    /// Start one execution of the campaign's workflow.
    pub async fn trigger(&self, campaign: &Campaign) -> CampaignResult<WorkflowExecution> {
        let workflow_id = campaign
            .n8n_workflow_id
            .as_deref()
            .ok_or(CampaignError::WorkflowNotDeployed)?;
        let payload = json!({ "campaignId": campaign.id, "campaignName": campaign.name });
        let execution = self
            .call("execute", self.engine.execute(workflow_id, payload, ExecutionMode::Trigger))
            .await?;
        info!(campaign_id = %campaign.id, execution_id = %execution.id, "Workflow triggered");
        Ok(execution)
    }

    /// Run the workflow for a single recipient.
    pub async fn send(
        &self,
        campaign_id: Uuid,
        workflow_id: &str,
        recipient: &Recipient,
    ) -> CampaignResult<WorkflowExecution> {
        let payload = json!({
            "campaignId": campaign_id,
            "email": recipient.email,
            "name": recipient.name,
        });
        self.call("execute", self.engine.execute(workflow_id, payload, ExecutionMode::Webhook))
            .await
    }

    /// Deployment state and recent executions. Read-only.
    pub async fn poll_status(&self, campaign: &Campaign) -> CampaignResult<WorkflowStatus> {
        let Some(workflow_id) = campaign.n8n_workflow_id.clone() else {
            return Ok(WorkflowStatus {
                is_deployed: false,
                n8n_workflow_id: None,
                is_stale: false,
                executions: Vec::new(),
            });
        };
        let executions = self
            .call(
                "list_executions",
                self.engine
                    .list_executions(&workflow_id, self.config.status_history_limit),
            )
            .await?;
        Ok(WorkflowStatus {
            is_deployed: true,
            n8n_workflow_id: Some(workflow_id),
            is_stale: campaign.is_deployment_stale(),
            executions,
        })
    }

    /// Lightweight reachability check. Never fails.
    pub async fn test_connection(&self) -> bool {
        match self.call("ping", self.engine.ping()).await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "Engine connection test failed");
                false
            }
        }
    }

    pub fn webhook_url(&self, path: &str) -> CampaignResult<String> {
        let base = format!("{}/", self.config.webhook_base_url.trim_end_matches('/'));
        let base = url::Url::parse(&base)
            .map_err(|e| CampaignError::Config(format!("invalid webhook base URL: {}", e)))?;
        let url = base
            .join(&format!("webhook/{}", path.trim_start_matches('/')))
            .map_err(|e| CampaignError::Config(format!("invalid webhook path: {}", e)))?;
        Ok(url.to_string())
    }

    async fn call<T, F>(&self, op: &'static str, fut: F) -> CampaignResult<T>
    where
        F: Future<Output = Result<T, EngineError>>,
    {
        let start = Instant::now();
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let result = match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(EngineError::Unreachable(msg))) => Err(CampaignError::EngineUnreachable(msg)),
            Ok(Err(EngineError::Rejected(msg))) => Err(CampaignError::DeploymentRejected(msg)),
            Ok(Err(EngineError::NotFound(what))) => Err(CampaignError::NotFound(what)),
            Err(_) => Err(CampaignError::EngineUnreachable(format!(
                "{} timed out after {}ms",
                op, self.config.timeout_ms
            ))),
        };

        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!("engine.calls", "op" => op, "outcome" => outcome).increment(1);
        metrics::histogram!("engine.call_latency_ms", "op" => op)
            .record(start.elapsed().as_secs_f64() * 1000.0);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryEngine;
    use campaign_core::flow::{FlowEdge, FlowNode, NodeType};

    fn setup(timeout_ms: u64) -> (Arc<InMemoryEngine>, DeploymentAdapter) {
        let engine = Arc::new(InMemoryEngine::new());
        let config = EngineConfig {
            timeout_ms,
            webhook_base_url: "http://localhost:5678/".to_string(),
            ..EngineConfig::default()
        };
        (engine.clone(), DeploymentAdapter::new(engine, config))
    }

    fn flow() -> FlowData {
        FlowData {
            nodes: vec![
                FlowNode::new("t", NodeType::Trigger, "Webhook Trigger").with_property("webhookPath", "spring"),
                FlowNode::new("m", NodeType::SendEmail, "Send Email"),
            ],
            edges: vec![FlowEdge::new("t", "m")],
        }
    }

    #[tokio::test]
    async fn test_deploy_returns_webhook_url() {
        let (engine, adapter) = setup(1000);
        let campaign = Campaign::new("Spring", "");
        let deployment = adapter.deploy(&campaign, &flow()).await.unwrap();
        assert_eq!(deployment.webhook_url.as_deref(), Some("http://localhost:5678/webhook/spring"));
        assert!(engine.is_active(&deployment.n8n_workflow_id));
    }

    #[tokio::test]
    async fn test_deploy_without_trigger_has_no_webhook() {
        let (_engine, adapter) = setup(1000);
        let flow = FlowData {
            nodes: vec![FlowNode::new("m", NodeType::SendEmail, "Send Email")],
            edges: vec![],
        };
        let deployment = adapter.deploy(&Campaign::new("c", ""), &flow).await.unwrap();
        assert!(deployment.webhook_url.is_none());
    }

    #[tokio::test]
    async fn test_redeploy_replaces_previous_workflow() {
        let (engine, adapter) = setup(1000);
        let mut campaign = Campaign::new("c", "");
        let first = adapter.deploy(&campaign, &flow()).await.unwrap();
        campaign.n8n_workflow_id = Some(first.n8n_workflow_id.clone());
        let second = adapter.deploy(&campaign, &flow()).await.unwrap();
        assert_ne!(first.n8n_workflow_id, second.n8n_workflow_id);
        assert_eq!(engine.workflow_count(), 1);
        assert!(engine.workflow(&first.n8n_workflow_id).is_none());
    }

    #[tokio::test]
    async fn test_trigger_requires_deployment() {
        let (_engine, adapter) = setup(1000);
        let err = adapter.trigger(&Campaign::new("c", "")).await.unwrap_err();
        assert!(matches!(err, CampaignError::WorkflowNotDeployed));
    }

    #[tokio::test]
    async fn test_slow_engine_times_out() {
        let (engine, adapter) = setup(20);
        engine.set_latency(Some(Duration::from_millis(200)));
        let err = adapter.deploy(&Campaign::new("c", ""), &flow()).await.unwrap_err();
        assert!(matches!(err, CampaignError::EngineUnreachable(_)));
        assert!(!adapter.test_connection().await);

        engine.set_latency(None);
        assert!(adapter.test_connection().await);
    }

    #[tokio::test]
    async fn test_poll_status() {
        let (engine, adapter) = setup(1000);
        let mut campaign = Campaign::new("c", "");
        let status = adapter.poll_status(&campaign).await.unwrap();
        assert!(!status.is_deployed);
        assert!(status.executions.is_empty());

        let deployment = adapter.deploy(&campaign, &flow()).await.unwrap();
        campaign.n8n_workflow_id = Some(deployment.n8n_workflow_id);
        adapter.trigger(&campaign).await.unwrap();
        adapter.trigger(&campaign).await.unwrap();

        let status = adapter.poll_status(&campaign).await.unwrap();
        assert!(status.is_deployed);
        assert_eq!(status.executions.len(), 2);

        engine.set_online(false);
        assert!(matches!(
            adapter.poll_status(&campaign).await,
            Err(CampaignError::EngineUnreachable(_))
        ));
    }
}
