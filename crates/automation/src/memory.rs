//! In-process automation engine used for development and tests.
//!
//! Mirrors the n8n behaviour the controller relies on: workflows must be
//! activated before they run, connections must name existing nodes, and
//! executions are listed newest first. The engine can be taken offline or
//! slowed down to exercise timeout handling.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::engine::{AutomationEngine, EngineError, EngineExecutionStatus, ExecutionMode, WorkflowExecution};
use crate::n8n::N8nWorkflow;

struct StoredWorkflow {
    workflow: N8nWorkflow,
    active: bool,
}

#[derive(Default)]
struct EngineState {
    workflows: HashMap<String, StoredWorkflow>,
    executions: HashMap<String, Vec<WorkflowExecution>>,
    failing_recipients: HashSet<String>,
}

pub struct InMemoryEngine {
    state: Mutex<EngineState>,
    online: AtomicBool,
    latency: Mutex<Option<Duration>>,
    next_execution: AtomicU64,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EngineState::default()),
            online: AtomicBool::new(true),
            latency: Mutex::new(None),
            next_execution: AtomicU64::new(1),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Delay applied to every call before it is served.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Executions whose payload targets `email` finish with an error.
    pub fn fail_recipient(&self, email: &str) {
        self.state.lock().failing_recipients.insert(email.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().failing_recipients.clear();
    }

    pub fn workflow(&self, workflow_id: &str) -> Option<N8nWorkflow> {
        self.state
            .lock()
            .workflows
            .get(workflow_id)
            .map(|w| w.workflow.clone())
    }

    pub fn is_active(&self, workflow_id: &str) -> bool {
        self.state
            .lock()
            .workflows
            .get(workflow_id)
            .map(|w| w.active)
            .unwrap_or(false)
    }

    pub fn workflow_count(&self) -> usize {
        self.state.lock().workflows.len()
    }

    async fn serve(&self) -> Result<(), EngineError> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::Unreachable("connection refused".to_string()))
        }
    }

    fn check_graph(workflow: &N8nWorkflow) -> Result<(), EngineError> {
        let names: HashSet<&str> = workflow.nodes.iter().map(|n| n.name.as_str()).collect();
        if names.len() != workflow.nodes.len() {
            return Err(EngineError::Rejected("node names must be unique".to_string()));
        }
        for (source, outputs) in &workflow.connections {
            if !names.contains(source.as_str()) {
                return Err(EngineError::Rejected(format!("connection from unknown node '{}'", source)));
            }
            let node = workflow.nodes.iter().find(|n| &n.name == source);
            let max_outputs = match node.map(|n| n.node_type.as_str()) {
                Some("n8n-nodes-base.if") => 2,
                _ => 1,
            };
            if outputs.main.len() > max_outputs {
                return Err(EngineError::Rejected(format!(
                    "node '{}' has {} outputs, expected at most {}",
                    source,
                    outputs.main.len(),
                    max_outputs
                )));
            }
            for target in outputs.main.iter().flatten() {
                if !names.contains(target.node.as_str()) {
                    return Err(EngineError::Rejected(format!(
                        "connection to unknown node '{}'",
                        target.node
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for InMemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AutomationEngine for InMemoryEngine {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn create_workflow(&self, workflow: &N8nWorkflow) -> Result<String, EngineError> {
        self.serve().await?;
        Self::check_graph(workflow)?;
        let id = Uuid::new_v4().simple().to_string()[..16].to_string();
        debug!(workflow_id = %id, nodes = workflow.nodes.len(), "Workflow created");
        self.state.lock().workflows.insert(
            id.clone(),
            StoredWorkflow {
                workflow: workflow.clone(),
                active: false,
            },
        );
        Ok(id)
    }

    async fn activate_workflow(&self, workflow_id: &str) -> Result<(), EngineError> {
        self.serve().await?;
        let mut state = self.state.lock();
        let stored = state
            .workflows
            .get_mut(workflow_id)
            .ok_or_else(|| EngineError::NotFound(format!("workflow {}", workflow_id)))?;
        stored.active = true;
        Ok(())
    }

    async fn delete_workflow(&self, workflow_id: &str) -> Result<(), EngineError> {
        self.serve().await?;
        let mut state = self.state.lock();
        state.executions.remove(workflow_id);
        state
            .workflows
            .remove(workflow_id)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(format!("workflow {}", workflow_id)))
    }

    async fn execute(
        &self,
        workflow_id: &str,
        payload: serde_json::Value,
        mode: ExecutionMode,
    ) -> Result<WorkflowExecution, EngineError> {
        self.serve().await?;
        let mut state = self.state.lock();
        let stored = state
            .workflows
            .get(workflow_id)
            .ok_or_else(|| EngineError::NotFound(format!("workflow {}", workflow_id)))?;
        if !stored.active {
            return Err(EngineError::Rejected(format!("workflow {} is not active", workflow_id)));
        }

        let failing = payload
            .get("email")
            .and_then(|e| e.as_str())
            .map(|e| state.failing_recipients.contains(e))
            .unwrap_or(false);
        let now = Utc::now();
        let execution = WorkflowExecution {
            id: self.next_execution.fetch_add(1, Ordering::SeqCst).to_string(),
            workflow_id: workflow_id.to_string(),
            status: if failing {
                EngineExecutionStatus::Error
            } else {
                EngineExecutionStatus::Success
            },
            finished: !failing,
            mode,
            started_at: now,
            stopped_at: Some(now),
            error: failing.then(|| "recipient rejected by mail server".to_string()),
        };
        state
            .executions
            .entry(workflow_id.to_string())
            .or_default()
            .push(execution.clone());
        Ok(execution)
    }

    async fn list_executions(
        &self,
        workflow_id: &str,
        limit: usize,
    ) -> Result<Vec<WorkflowExecution>, EngineError> {
        self.serve().await?;
        let state = self.state.lock();
        if !state.workflows.contains_key(workflow_id) {
            return Err(EngineError::NotFound(format!("workflow {}", workflow_id)));
        }
        Ok(state
            .executions
            .get(workflow_id)
            .map(|list| list.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn ping(&self) -> Result<(), EngineError> {
        self.serve().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::n8n::{N8nConnection, N8nNode, N8nNodeConnections};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn node(name: &str, node_type: &str) -> N8nNode {
        N8nNode {
            id: name.to_string(),
            name: name.to_string(),
            node_type: node_type.to_string(),
            type_version: 1,
            position: [0, 0],
            parameters: json!({}),
            webhook_id: None,
        }
    }

    fn workflow(target: &str) -> N8nWorkflow {
        let mut connections = BTreeMap::new();
        connections.insert(
            "Start".to_string(),
            N8nNodeConnections {
                main: vec![vec![N8nConnection {
                    node: target.to_string(),
                    connection_type: "main".to_string(),
                    index: 0,
                }]],
            },
        );
        N8nWorkflow {
            name: "wf".to_string(),
            nodes: vec![node("Start", "n8n-nodes-base.webhook"), node("Mail", "n8n-nodes-base.emailSend")],
            connections,
            settings: json!({}),
        }
    }

    #[tokio::test]
    async fn test_execute_requires_activation() {
        let engine = InMemoryEngine::new();
        let id = engine.create_workflow(&workflow("Mail")).await.unwrap();
        let err = engine.execute(&id, json!({}), ExecutionMode::Manual).await.unwrap_err();
        assert!(matches!(err, EngineError::Rejected(_)));

        engine.activate_workflow(&id).await.unwrap();
        let exec = engine.execute(&id, json!({}), ExecutionMode::Manual).await.unwrap();
        assert!(exec.succeeded());
        assert!(exec.finished);
    }

    #[tokio::test]
    async fn test_dangling_connection_rejected() {
        let engine = InMemoryEngine::new();
        let err = engine.create_workflow(&workflow("Nowhere")).await.unwrap_err();
        assert!(matches!(err, EngineError::Rejected(_)));
        assert_eq!(engine.workflow_count(), 0);
    }

    #[tokio::test]
    async fn test_offline_engine_is_unreachable() {
        let engine = InMemoryEngine::new();
        engine.set_online(false);
        assert!(matches!(engine.ping().await, Err(EngineError::Unreachable(_))));
        engine.set_online(true);
        assert!(engine.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_failing_recipient_and_history_order() {
        let engine = InMemoryEngine::new();
        let id = engine.create_workflow(&workflow("Mail")).await.unwrap();
        engine.activate_workflow(&id).await.unwrap();
        engine.fail_recipient("bounce@example.com");

        let ok = engine
            .execute(&id, json!({"email": "ok@example.com"}), ExecutionMode::Webhook)
            .await
            .unwrap();
        let bad = engine
            .execute(&id, json!({"email": "bounce@example.com"}), ExecutionMode::Webhook)
            .await
            .unwrap();
        assert!(ok.succeeded());
        assert_eq!(bad.status, EngineExecutionStatus::Error);
        assert!(bad.error.is_some());

        let history = engine.list_executions(&id, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, bad.id);
        assert_eq!(engine.list_executions(&id, 1).await.unwrap().len(), 1);
    }
}
