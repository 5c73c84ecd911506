//! n8n REST client behind the [`AutomationEngine`] seam.
//!
//! Workflow management goes through the public API under `/api/v1` and is
//! authenticated with the `X-N8N-API-KEY` header. Executions are started by
//! calling the workflow's webhook trigger, since the public API has no run
//! endpoint.

use async_trait::async_trait;
use campaign_core::config::EngineConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::engine::{AutomationEngine, EngineError, EngineExecutionStatus, ExecutionMode, WorkflowExecution};
use crate::n8n::N8nWorkflow;

const API_KEY_HEADER: &str = "X-N8N-API-KEY";

#[derive(Debug, Clone)]
pub struct HttpPoolConfig {
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
    pub tcp_keepalive: Option<Duration>,
}

impl Default for HttpPoolConfig {
    fn default() -> Self {
        Self {
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(90),
            tcp_keepalive: Some(Duration::from_secs(60)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreatedWorkflow {
    id: Value,
}

#[derive(Debug, Deserialize)]
struct ExecutionList {
    #[serde(default)]
    data: Vec<RawExecution>,
}

/// Execution as the n8n API reports it. Ids come back as numbers or strings
/// depending on the n8n version.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawExecution {
    id: Value,
    #[serde(default)]
    workflow_id: Option<Value>,
    #[serde(default)]
    finished: bool,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    status: Option<String>,
    started_at: DateTime<Utc>,
    #[serde(default)]
    stopped_at: Option<DateTime<Utc>>,
}

impl RawExecution {
    fn into_execution(self, workflow_id: &str) -> WorkflowExecution {
        let status = match self.status.as_deref() {
            Some("success") => EngineExecutionStatus::Success,
            Some("error") | Some("crashed") | Some("canceled") => EngineExecutionStatus::Error,
            Some("waiting") => EngineExecutionStatus::Waiting,
            Some(_) => EngineExecutionStatus::Running,
            // Older releases only report `finished`.
            None if self.finished => EngineExecutionStatus::Success,
            None if self.stopped_at.is_some() => EngineExecutionStatus::Error,
            None => EngineExecutionStatus::Running,
        };
        let mode = match self.mode.as_deref() {
            Some("webhook") => ExecutionMode::Webhook,
            Some("trigger") => ExecutionMode::Trigger,
            _ => ExecutionMode::Manual,
        };
        WorkflowExecution {
            id: id_string(&self.id),
            workflow_id: self
                .workflow_id
                .as_ref()
                .map(id_string)
                .unwrap_or_else(|| workflow_id.to_string()),
            status,
            finished: self.finished,
            mode,
            started_at: self.started_at,
            stopped_at: self.stopped_at,
            error: (status == EngineExecutionStatus::Error).then(|| "execution failed on engine".to_string()),
        }
    }
}

fn id_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// [`AutomationEngine`] backed by a live n8n instance.
pub struct N8nRestEngine {
    client: reqwest::Client,
    api_base: String,
    webhook_base: String,
    /// Webhook path per workflow id, filled at create time.
    webhook_paths: Mutex<HashMap<String, String>>,
}

impl N8nRestEngine {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        Self::with_pool(config, HttpPoolConfig::default())
    }

    pub fn with_pool(config: &EngineConfig, pool: HttpPoolConfig) -> Result<Self, EngineError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = config.api_key.as_deref().filter(|k| !k.is_empty()) {
            let mut value = HeaderValue::from_str(key)
                .map_err(|e| EngineError::Rejected(format!("invalid API key header: {}", e)))?;
            value.set_sensitive(true);
            headers.insert(API_KEY_HEADER, value);
        }

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .pool_max_idle_per_host(pool.pool_max_idle_per_host)
            .pool_idle_timeout(pool.pool_idle_timeout)
            .timeout(Duration::from_millis(config.timeout_ms));
        if let Some(keepalive) = pool.tcp_keepalive {
            builder = builder.tcp_keepalive(keepalive);
        }
        let client = builder
            .build()
            .map_err(|e| EngineError::Unreachable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_base: format!("{}/api/v1", config.base_url.trim_end_matches('/')),
            webhook_base: format!("{}/webhook", config.webhook_base_url.trim_end_matches('/')),
            webhook_paths: Mutex::new(HashMap::new()),
        })
    }

    async fn send(&self, method: Method, url: String, body: Option<&Value>) -> Result<Response, EngineError> {
        debug!(method = %method, url = %url, "Engine request");
        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| EngineError::Unreachable(e.to_string()))?;
        check_status(&url, response).await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: String,
        body: Option<&Value>,
    ) -> Result<T, EngineError> {
        self.send(method, url, body)
            .await?
            .json::<T>()
            .await
            .map_err(|e| EngineError::Rejected(format!("unexpected engine response: {}", e)))
    }

    /// Path of the workflow's webhook trigger, fetched from the engine when
    /// this process did not create the workflow.
    async fn webhook_path(&self, workflow_id: &str) -> Result<String, EngineError> {
        if let Some(path) = self.webhook_paths.lock().get(workflow_id) {
            return Ok(path.clone());
        }
        let workflow: N8nWorkflow = self
            .send_json(Method::GET, format!("{}/workflows/{}", self.api_base, workflow_id), None)
            .await?;
        let path = workflow
            .webhook_path()
            .ok_or_else(|| EngineError::Rejected(format!("workflow {} has no webhook trigger", workflow_id)))?
            .to_string();
        self.webhook_paths
            .lock()
            .insert(workflow_id.to_string(), path.clone());
        Ok(path)
    }
}

/// Transport-level outcome of an engine response. 404 names the missing
/// resource, other 4xx are rejections, 5xx means the engine is unhealthy.
async fn check_status(url: &str, response: Response) -> Result<Response, EngineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let detail = engine_message(&body).unwrap_or_else(|| status.to_string());
    Err(match status {
        StatusCode::NOT_FOUND => EngineError::NotFound(url.to_string()),
        s if s.is_client_error() => EngineError::Rejected(detail),
        _ => EngineError::Unreachable(format!("{}: {}", status, detail)),
    })
}

fn engine_message(body: &str) -> Option<String> {
    serde_json::from_str::<Value>(body)
        .ok()?
        .get("message")?
        .as_str()
        .map(str::to_string)
}

#[async_trait]
impl AutomationEngine for N8nRestEngine {
    fn name(&self) -> &str {
        "n8n"
    }

    async fn create_workflow(&self, workflow: &N8nWorkflow) -> Result<String, EngineError> {
        let body = serde_json::to_value(workflow)
            .map_err(|e| EngineError::Rejected(format!("workflow is not serializable: {}", e)))?;
        let created: CreatedWorkflow = self
            .send_json(Method::POST, format!("{}/workflows", self.api_base), Some(&body))
            .await?;
        let id = id_string(&created.id);
        if let Some(path) = workflow.webhook_path() {
            self.webhook_paths.lock().insert(id.clone(), path.to_string());
        }
        Ok(id)
    }

    async fn activate_workflow(&self, workflow_id: &str) -> Result<(), EngineError> {
        self.send(
            Method::POST,
            format!("{}/workflows/{}/activate", self.api_base, workflow_id),
            None,
        )
        .await?;
        Ok(())
    }

    async fn delete_workflow(&self, workflow_id: &str) -> Result<(), EngineError> {
        self.send(Method::DELETE, format!("{}/workflows/{}", self.api_base, workflow_id), None)
            .await?;
        self.webhook_paths.lock().remove(workflow_id);
        Ok(())
    }

    async fn execute(
        &self,
        workflow_id: &str,
        payload: Value,
        mode: ExecutionMode,
    ) -> Result<WorkflowExecution, EngineError> {
        let path = self.webhook_path(workflow_id).await?;
        let started_at = Utc::now();
        let response = self
            .send(
                Method::POST,
                format!("{}/{}", self.webhook_base, path.trim_start_matches('/')),
                Some(&payload),
            )
            .await?;
        let reply: Value = response.json().await.unwrap_or(Value::Null);
        let id = reply
            .get("executionId")
            .map(id_string)
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        Ok(WorkflowExecution {
            id,
            workflow_id: workflow_id.to_string(),
            status: EngineExecutionStatus::Success,
            finished: true,
            mode,
            started_at,
            stopped_at: Some(Utc::now()),
            error: None,
        })
    }

    async fn list_executions(
        &self,
        workflow_id: &str,
        limit: usize,
    ) -> Result<Vec<WorkflowExecution>, EngineError> {
        let url = format!(
            "{}/executions?workflowId={}&limit={}",
            self.api_base, workflow_id, limit
        );
        let list: ExecutionList = self.send_json(Method::GET, url, None).await?;
        Ok(list
            .data
            .into_iter()
            .map(|raw| raw.into_execution(workflow_id))
            .collect())
    }

    async fn ping(&self) -> Result<(), EngineError> {
        self.send(Method::GET, format!("{}/workflows?limit=1", self.api_base), None)
            .await?;
        Ok(())
    }
}
