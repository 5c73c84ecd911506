//! Campaign lifecycle controller.
//!
//! Owns every status change. Operations on one campaign are serialized by an
//! async per-campaign mutex held across the engine call, and the final status
//! write is checked against the version read at the start of the operation.
//! An operation that fails leaves the campaign and its ledger as they were.

use campaign_automation::{Deployment, DeploymentAdapter, WorkflowExecution, WorkflowStatus};
use campaign_core::flow::FlowData;
use campaign_core::types::{
    Campaign, CampaignCounters, CampaignStatus, ExecutionPage, ExecutionStatus, ProgressSnapshot,
    StatusTransition,
};
use campaign_core::{CampaignError, CampaignResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};
use uuid::Uuid;

use crate::ledger::ExecutionLedger;
use crate::models::{CreateCampaignRequest, UpdateCampaignRequest};
use crate::store::CampaignStore;

/// A run that was started: the engine execution id and the running campaign.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub execution_id: String,
    pub campaign: Campaign,
}

pub struct CampaignController {
    store: Arc<CampaignStore>,
    ledger: Arc<ExecutionLedger>,
    adapter: Arc<DeploymentAdapter>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl CampaignController {
    pub fn new(store: Arc<CampaignStore>, ledger: Arc<ExecutionLedger>, adapter: Arc<DeploymentAdapter>) -> Self {
        Self {
            store,
            ledger,
            adapter,
            locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<CampaignStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<ExecutionLedger> {
        &self.ledger
    }

    pub fn adapter(&self) -> &Arc<DeploymentAdapter> {
        &self.adapter
    }

    async fn lock(&self, id: Uuid) -> OwnedMutexGuard<()> {
        let mutex = Arc::clone(
            self.locks
                .entry(id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        mutex.lock_owned().await
    }

    // ─── Campaign records ──────────────────────────────────────────────────

    pub fn list_campaigns(&self) -> Vec<Campaign> {
        self.store.list_campaigns()
    }

    pub fn get_campaign(&self, id: Uuid) -> CampaignResult<Campaign> {
        self.store.get_campaign(id)
    }

    pub fn create_campaign(&self, req: CreateCampaignRequest) -> CampaignResult<Campaign> {
        self.store.create_campaign(req)
    }

    pub async fn update_campaign(&self, id: Uuid, req: UpdateCampaignRequest) -> CampaignResult<Campaign> {
        let _guard = self.lock(id).await;
        self.store.update_campaign(id, req)
    }

    pub async fn delete_campaign(&self, id: Uuid) -> CampaignResult<Campaign> {
        let guard = self.lock(id).await;
        let campaign = self.store.delete_campaign(id)?;
        self.ledger.clear_campaign(id);
        drop(guard);
        self.locks.remove(&id);
        Ok(campaign)
    }

    pub fn history(&self, id: Uuid) -> CampaignResult<Vec<StatusTransition>> {
        self.store.history(id)
    }

    pub fn get_flow(&self, id: Uuid) -> CampaignResult<FlowData> {
        self.store.get_flow(id)
    }

    pub async fn save_flow(&self, id: Uuid, flow: FlowData) -> CampaignResult<Campaign> {
        let _guard = self.lock(id).await;
        self.store.save_flow(id, flow)
    }

    // ─── Deployment ────────────────────────────────────────────────────────

    /// Deploy the campaign's saved flow and remember the workflow id.
    pub async fn deploy_flow(&self, id: Uuid) -> CampaignResult<Deployment> {
        let _guard = self.lock(id).await;
        let campaign = self.store.get_campaign(id)?;
        let deployment = self.adapter.deploy(&campaign, &campaign.flow_data).await?;

        let workflow_id = deployment.n8n_workflow_id.clone();
        self.store.update(id, |c| {
            c.n8n_workflow_id = Some(workflow_id);
            c.deployed_at = Some(Utc::now());
            Ok(())
        })?;
        Ok(deployment)
    }

    pub async fn workflow_status(&self, id: Uuid) -> CampaignResult<WorkflowStatus> {
        let campaign = self.store.get_campaign(id)?;
        self.adapter.poll_status(&campaign).await
    }

    /// Fire the deployed workflow once without touching campaign state.
    pub async fn trigger_workflow(&self, id: Uuid) -> CampaignResult<WorkflowExecution> {
        let campaign = self.store.get_campaign(id)?;
        self.adapter.trigger(&campaign).await
    }

    pub async fn test_connection(&self) -> bool {
        self.adapter.test_connection().await
    }

    // ─── Status changes ────────────────────────────────────────────────────

    /// Generic status change along the transition table.
    pub async fn change_status(&self, id: Uuid, to: CampaignStatus) -> CampaignResult<Campaign> {
        let _guard = self.lock(id).await;
        let campaign = self.store.get_campaign(id)?;
        let from = campaign.status;
        if !from.can_transition_to(to) {
            return Err(CampaignError::InvalidTransition { from, to });
        }

        match (from, to) {
            (_, CampaignStatus::Scheduled) if !campaign.is_deployed() => Err(CampaignError::WorkflowNotDeployed),
            (CampaignStatus::Scheduled, CampaignStatus::Running) => {
                self.start_run(campaign, "status change").await.map(|run| run.campaign)
            }
            (_, CampaignStatus::Completed) => {
                let counts = self.ledger.counts(id);
                self.store
                    .transition(id, campaign.version, to, "status change", |c| {
                        c.completed_at = Some(Utc::now());
                        c.counters.total_sent = counts.success;
                        c.counters.total_failed = counts.failed;
                    })
            }
            (CampaignStatus::Scheduled, CampaignStatus::Draft) => {
                self.store
                    .transition(id, campaign.version, to, "status change", |c| c.scheduled_at = None)
            }
            _ => self
                .store
                .transition(id, campaign.version, to, "status change", |_| {}),
        }
    }

    /// Schedule a deployed campaign for a future start.
    pub async fn schedule(&self, id: Uuid, scheduled_at: DateTime<Utc>) -> CampaignResult<Campaign> {
        let _guard = self.lock(id).await;
        let campaign = self.store.get_campaign(id)?;
        if !campaign.is_deployed() {
            return Err(CampaignError::WorkflowNotDeployed);
        }
        if !matches!(campaign.status, CampaignStatus::Draft | CampaignStatus::Scheduled) {
            return Err(CampaignError::InvalidTransition {
                from: campaign.status,
                to: CampaignStatus::Scheduled,
            });
        }
        if scheduled_at <= Utc::now() {
            return Err(CampaignError::InvalidScheduleTime);
        }
        self.store
            .transition(id, campaign.version, CampaignStatus::Scheduled, "scheduled", |c| {
                c.scheduled_at = Some(scheduled_at)
            })
    }

    /// Start a run immediately.
    pub async fn run_now(&self, id: Uuid) -> CampaignResult<RunOutcome> {
        let _guard = self.lock(id).await;
        let campaign = self.store.get_campaign(id)?;
        self.start_run(campaign, "run now").await
    }

    pub async fn pause(&self, id: Uuid) -> CampaignResult<Campaign> {
        self.guarded_move(id, CampaignStatus::Running, CampaignStatus::Paused, "paused")
            .await
    }

    pub async fn resume(&self, id: Uuid) -> CampaignResult<Campaign> {
        self.guarded_move(id, CampaignStatus::Paused, CampaignStatus::Running, "resumed")
            .await
    }

    async fn guarded_move(
        &self,
        id: Uuid,
        required: CampaignStatus,
        to: CampaignStatus,
        reason: &str,
    ) -> CampaignResult<Campaign> {
        let _guard = self.lock(id).await;
        let campaign = self.store.get_campaign(id)?;
        if campaign.status != required {
            return Err(CampaignError::InvalidTransition {
                from: campaign.status,
                to,
            });
        }
        self.store.transition(id, campaign.version, to, reason, |_| {})
    }

    /// Reset failed records to pending. Status is never changed.
    pub async fn retry_failed(&self, id: Uuid) -> CampaignResult<usize> {
        let _guard = self.lock(id).await;
        let campaign = self.store.get_campaign(id)?;
        let requeued = self.ledger.requeue_failed(id);
        if requeued > 0 {
            self.write_counters(id)?;
            info!(campaign_id = %id, status = %campaign.status, requeued, "Failed executions requeued");
        }
        Ok(requeued)
    }

    /// Caller holds the campaign lock.
    async fn start_run(&self, campaign: Campaign, reason: &str) -> CampaignResult<RunOutcome> {
        if !campaign.is_deployed() {
            return Err(CampaignError::WorkflowNotDeployed);
        }
        if !matches!(
            campaign.status,
            CampaignStatus::Draft | CampaignStatus::Scheduled | CampaignStatus::Failed
        ) {
            return Err(CampaignError::InvalidTransition {
                from: campaign.status,
                to: CampaignStatus::Running,
            });
        }

        let recipients = self.store.recipients_for(&campaign)?;
        let execution = self.adapter.trigger(&campaign).await?;

        let targeted = recipients.len() as u64;
        let started_at = Utc::now();
        // Records go in before the status flips, so `running` is never
        // observable without its queued work.
        let staged = self.ledger.stage_run(campaign.id, &recipients);
        let transition = self
            .store
            .transition(campaign.id, campaign.version, CampaignStatus::Running, reason, |c| {
                c.started_at = Some(started_at);
                c.completed_at = None;
                c.counters = CampaignCounters {
                    total_users_targeted: targeted,
                    total_jobs_created: targeted,
                    ..CampaignCounters::default()
                };
            });
        let running = match transition {
            Ok(running) => {
                self.ledger.commit_run(staged);
                running
            }
            Err(e) => {
                self.ledger.rollback_run(staged);
                return Err(e);
            }
        };

        metrics::counter!("campaigns.runs_started").increment(1);
        info!(
            campaign_id = %campaign.id,
            execution_id = %execution.id,
            recipients = targeted,
            "Campaign run started"
        );
        Ok(RunOutcome {
            execution_id: execution.id,
            campaign: running,
        })
    }

    // ─── Scheduler hooks ───────────────────────────────────────────────────

    /// Start every scheduled campaign whose time has come. A campaign that
    /// cannot start stays scheduled and is retried on the next call.
    pub async fn start_due_runs(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let due: Vec<Uuid> = self
            .store
            .campaigns_with_status(CampaignStatus::Scheduled)
            .into_iter()
            .filter(|c| c.scheduled_at.is_some_and(|at| at <= now))
            .map(|c| c.id)
            .collect();

        let mut started = Vec::new();
        for id in due {
            let _guard = self.lock(id).await;
            let campaign = match self.store.get_campaign(id) {
                Ok(c) => c,
                Err(_) => continue,
            };
            // Re-check under the lock; it may have been rescheduled or cancelled.
            let still_due = campaign.status == CampaignStatus::Scheduled
                && campaign.scheduled_at.is_some_and(|at| at <= now);
            if !still_due {
                continue;
            }
            match self.start_run(campaign, "scheduled start").await {
                Ok(_) => started.push(id),
                Err(e) => {
                    warn!(campaign_id = %id, error = %e, "Scheduled campaign failed to start");
                    metrics::counter!("campaigns.scheduled_start_failures").increment(1);
                }
            }
        }
        started
    }

    /// Copy ledger totals onto the campaign row.
    pub async fn sync_counters(&self, id: Uuid) -> CampaignResult<Campaign> {
        let _guard = self.lock(id).await;
        self.write_counters(id)
    }

    fn write_counters(&self, id: Uuid) -> CampaignResult<Campaign> {
        let counts = self.ledger.counts(id);
        self.store.update(id, |c| {
            c.counters.total_sent = counts.success;
            c.counters.total_failed = counts.failed;
            Ok(())
        })
    }

    /// Complete a running campaign once nothing is pending or in flight.
    /// Returns the completed campaign, or `None` if it is not done yet.
    pub async fn complete_if_drained(&self, id: Uuid) -> CampaignResult<Option<Campaign>> {
        let _guard = self.lock(id).await;
        let campaign = self.store.get_campaign(id)?;
        if campaign.status != CampaignStatus::Running {
            return Ok(None);
        }
        let counts = self.ledger.counts(id);
        if !counts.is_drained() {
            return Ok(None);
        }
        let completed = self
            .store
            .transition(id, campaign.version, CampaignStatus::Completed, "all executions processed", |c| {
                c.completed_at = Some(Utc::now());
                c.counters.total_sent = counts.success;
                c.counters.total_failed = counts.failed;
            })?;
        info!(
            campaign_id = %id,
            sent = counts.success,
            failed = counts.failed,
            "Campaign completed"
        );
        Ok(Some(completed))
    }

    // ─── Progress ──────────────────────────────────────────────────────────

    pub fn progress(&self, id: Uuid) -> CampaignResult<ProgressSnapshot> {
        let campaign = self.store.get_campaign(id)?;
        Ok(self.ledger.snapshot(&campaign))
    }

    pub fn executions(
        &self,
        id: Uuid,
        status: Option<ExecutionStatus>,
        page: usize,
        page_size: usize,
    ) -> CampaignResult<ExecutionPage> {
        self.store.get_campaign(id)?;
        self.ledger.query(id, status, page, page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CreateSegmentRequest;
    use campaign_automation::InMemoryEngine;
    use campaign_core::config::{EngineConfig, LedgerConfig};
    use campaign_core::flow::{FlowEdge, FlowNode, NodeType};
    use campaign_core::types::Recipient;
    use chrono::Duration;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn setup() -> (Arc<InMemoryEngine>, Arc<CampaignController>) {
        let engine = Arc::new(InMemoryEngine::new());
        let config = EngineConfig {
            timeout_ms: 500,
            ..EngineConfig::default()
        };
        let adapter = Arc::new(DeploymentAdapter::new(engine.clone(), config));
        let controller = CampaignController::new(
            Arc::new(CampaignStore::new()),
            Arc::new(ExecutionLedger::new(LedgerConfig::default())),
            adapter,
        );
        (engine, Arc::new(controller))
    }

    fn flow() -> FlowData {
        FlowData {
            nodes: vec![
                FlowNode::new("t", NodeType::Trigger, "Start"),
                FlowNode::new("m", NodeType::SendEmail, "Welcome mail"),
            ],
            edges: vec![FlowEdge::new("t", "m")],
        }
    }

    fn create(controller: &CampaignController, recipients: usize) -> Campaign {
        let segment = controller
            .store()
            .create_segment(CreateSegmentRequest {
                name: "seg".to_string(),
                recipients: (0..recipients)
                    .map(|i| Recipient {
                        email: format!("r{}@example.com", i),
                        name: String::new(),
                    })
                    .collect(),
            })
            .unwrap();
        controller
            .create_campaign(CreateCampaignRequest {
                name: "Launch".to_string(),
                description: String::new(),
                segment_id: Some(segment.id),
                start_date: None,
                end_date: None,
                flow_data: Some(flow()),
            })
            .unwrap()
    }

    async fn deployed(controller: &CampaignController, recipients: usize) -> Campaign {
        let campaign = create(controller, recipients);
        controller.deploy_flow(campaign.id).await.unwrap();
        controller.get_campaign(campaign.id).unwrap()
    }

    #[tokio::test]
    async fn test_draft_cannot_jump_to_running() {
        let (_engine, controller) = setup();
        let campaign = deployed(&controller, 1).await;
        let err = controller
            .change_status(campaign.id, CampaignStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CampaignError::InvalidTransition {
                from: CampaignStatus::Draft,
                to: CampaignStatus::Running
            }
        ));
        assert_eq!(controller.get_campaign(campaign.id).unwrap().status, CampaignStatus::Draft);
    }

    #[tokio::test]
    async fn test_schedule_requires_deployment_before_time_check() {
        let (_engine, controller) = setup();
        let campaign = create(&controller, 1);
        let past = Utc::now() - Duration::hours(1);

        let err = controller.schedule(campaign.id, past).await.unwrap_err();
        assert!(matches!(err, CampaignError::WorkflowNotDeployed));

        controller.deploy_flow(campaign.id).await.unwrap();
        let err = controller.schedule(campaign.id, past).await.unwrap_err();
        assert!(matches!(err, CampaignError::InvalidScheduleTime));
        assert_eq!(controller.get_campaign(campaign.id).unwrap().status, CampaignStatus::Draft);

        let at = Utc::now() + Duration::hours(1);
        let scheduled = controller.schedule(campaign.id, at).await.unwrap();
        assert_eq!(scheduled.status, CampaignStatus::Scheduled);
        assert_eq!(scheduled.scheduled_at, Some(at));

        let history = controller.history(campaign.id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].to, CampaignStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_generic_schedule_requires_deployment() {
        let (_engine, controller) = setup();
        let campaign = create(&controller, 1);
        let err = controller
            .change_status(campaign.id, CampaignStatus::Scheduled)
            .await
            .unwrap_err();
        assert!(matches!(err, CampaignError::WorkflowNotDeployed));
    }

    #[tokio::test]
    async fn test_run_now_before_and_after_deploy() {
        let (_engine, controller) = setup();
        let campaign = create(&controller, 3);

        let err = controller.run_now(campaign.id).await.unwrap_err();
        assert!(matches!(err, CampaignError::WorkflowNotDeployed));

        controller.deploy_flow(campaign.id).await.unwrap();
        let run = controller.run_now(campaign.id).await.unwrap();
        assert!(!run.execution_id.is_empty());
        assert_eq!(run.campaign.status, CampaignStatus::Running);
        assert!(run.campaign.started_at.is_some());
        assert_eq!(run.campaign.counters.total_users_targeted, 3);
        assert_eq!(run.campaign.counters.total_jobs_created, 3);

        let counts = controller.ledger().counts(campaign.id);
        assert_eq!(counts.total, 3);
        assert_eq!(counts.pending, 3);
    }

    #[tokio::test]
    async fn test_failed_trigger_persists_nothing() {
        let (engine, controller) = setup();
        let campaign = deployed(&controller, 2).await;
        engine.set_online(false);

        let err = controller.run_now(campaign.id).await.unwrap_err();
        assert!(matches!(err, CampaignError::EngineUnreachable(_)));

        let after = controller.get_campaign(campaign.id).unwrap();
        assert_eq!(after.status, CampaignStatus::Draft);
        assert_eq!(after.version, campaign.version);
        assert_eq!(controller.ledger().counts(campaign.id).total, 0);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let (_engine, controller) = setup();
        let campaign = deployed(&controller, 2).await;
        controller.run_now(campaign.id).await.unwrap();

        let paused = controller.pause(campaign.id).await.unwrap();
        assert_eq!(paused.status, CampaignStatus::Paused);

        let err = controller.pause(campaign.id).await.unwrap_err();
        assert!(matches!(
            err,
            CampaignError::InvalidTransition {
                from: CampaignStatus::Paused,
                to: CampaignStatus::Paused
            }
        ));

        let resumed = controller.resume(campaign.id).await.unwrap();
        assert_eq!(resumed.status, CampaignStatus::Running);
        assert!(controller.resume(campaign.id).await.is_err());
        assert_eq!(controller.ledger().counts(campaign.id).pending, 2);
    }

    #[tokio::test]
    async fn test_retry_failed_is_idempotent() {
        let (_engine, controller) = setup();
        let campaign = deployed(&controller, 3).await;
        assert_eq!(controller.retry_failed(campaign.id).await.unwrap(), 0);

        controller.run_now(campaign.id).await.unwrap();
        let page = controller.executions(campaign.id, None, 1, 10).unwrap();
        controller
            .ledger()
            .record_failure(page.data[0].id, Utc::now(), "bounce")
            .unwrap();
        controller
            .ledger()
            .record_attempt(page.data[1].id, ExecutionStatus::Success, None)
            .unwrap();

        let before = controller.get_campaign(campaign.id).unwrap();
        assert_eq!(controller.retry_failed(campaign.id).await.unwrap(), 1);
        let after = controller.get_campaign(campaign.id).unwrap();
        assert_eq!(after.status, before.status);

        let version = after.version;
        assert_eq!(controller.retry_failed(campaign.id).await.unwrap(), 0);
        assert_eq!(controller.get_campaign(campaign.id).unwrap().version, version);

        let record = controller.ledger().get(page.data[0].id).unwrap();
        assert_eq!(record.status, ExecutionStatus::Pending);
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn test_scheduled_to_running_enqueues_run() {
        let (_engine, controller) = setup();
        let campaign = deployed(&controller, 4).await;
        controller
            .schedule(campaign.id, Utc::now() + Duration::hours(2))
            .await
            .unwrap();

        let running = controller
            .change_status(campaign.id, CampaignStatus::Running)
            .await
            .unwrap();
        assert_eq!(running.status, CampaignStatus::Running);
        assert_eq!(controller.ledger().counts(campaign.id).pending, 4);
    }

    #[tokio::test]
    async fn test_start_due_runs() {
        let (_engine, controller) = setup();
        let soon = deployed(&controller, 1).await;
        let later = deployed(&controller, 1).await;
        let now = Utc::now();
        controller.schedule(soon.id, now + Duration::minutes(5)).await.unwrap();
        controller.schedule(later.id, now + Duration::hours(5)).await.unwrap();

        let started = controller.start_due_runs(now + Duration::minutes(10)).await;
        assert_eq!(started, vec![soon.id]);
        assert_eq!(controller.get_campaign(soon.id).unwrap().status, CampaignStatus::Running);
        assert_eq!(controller.get_campaign(later.id).unwrap().status, CampaignStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_complete_if_drained() {
        let (_engine, controller) = setup();
        let campaign = deployed(&controller, 2).await;
        controller.run_now(campaign.id).await.unwrap();
        assert!(controller.complete_if_drained(campaign.id).await.unwrap().is_none());

        let claimed = controller.ledger().claim_pending(campaign.id, 10);
        controller
            .ledger()
            .record_attempt(claimed[0].id, ExecutionStatus::Success, None)
            .unwrap();
        controller
            .ledger()
            .record_failure(claimed[1].id, Utc::now(), "bounce")
            .unwrap();

        let completed = controller.complete_if_drained(campaign.id).await.unwrap().unwrap();
        assert_eq!(completed.status, CampaignStatus::Completed);
        assert!(completed.completed_at.is_some());
        assert_eq!(completed.counters.total_sent, 1);
        assert_eq!(completed.counters.total_failed, 1);

        let err = controller
            .change_status(campaign.id, CampaignStatus::Draft)
            .await
            .unwrap_err();
        assert!(matches!(err, CampaignError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_run_now_starts_once() {
        let (_engine, controller) = setup();
        let campaign = deployed(&controller, 5).await;

        let (a, b) = tokio::join!(controller.run_now(campaign.id), controller.run_now(campaign.id));
        let outcomes = [a.is_ok(), b.is_ok()];
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
        let err = a.err().or(b.err()).unwrap();
        assert!(matches!(err, CampaignError::InvalidTransition { .. }));
        assert_eq!(controller.ledger().counts(campaign.id).total, 5);
        assert_eq!(controller.history(campaign.id).unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_running_is_never_observed_without_records() {
        let (_engine, controller) = setup();
        let mut ids = Vec::new();
        for _ in 0..20 {
            ids.push(deployed(&controller, 7).await.id);
        }

        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let controller = controller.clone();
            let ids = ids.clone();
            let done = done.clone();
            tokio::spawn(async move {
                while !done.load(Ordering::SeqCst) {
                    for id in &ids {
                        if controller.get_campaign(*id).unwrap().status != CampaignStatus::Running {
                            continue;
                        }
                        assert_eq!(controller.progress(*id).unwrap().total_recipients, 7);
                        assert_eq!(controller.ledger().counts(*id).pending, 7);
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        for id in &ids {
            controller.run_now(*id).await.unwrap();
        }
        done.store(true, Ordering::SeqCst);
        reader.await.unwrap();

        for id in &ids {
            assert_eq!(controller.ledger().counts(*id).total, 7);
        }
    }

    #[tokio::test]
    async fn test_redeploy_keeps_status_and_marks_fresh() {
        let (_engine, controller) = setup();
        let campaign = deployed(&controller, 1).await;
        let first = campaign.n8n_workflow_id.clone().unwrap();

        controller.save_flow(campaign.id, flow()).await.unwrap();
        let status = controller.workflow_status(campaign.id).await.unwrap();
        assert!(status.is_stale);

        let deployment = controller.deploy_flow(campaign.id).await.unwrap();
        assert_ne!(deployment.n8n_workflow_id, first);
        let status = controller.workflow_status(campaign.id).await.unwrap();
        assert!(!status.is_stale);
        assert_eq!(controller.get_campaign(campaign.id).unwrap().status, CampaignStatus::Draft);
    }
}
