//! Execution scheduler — background loop that drives campaign runs.
//!
//! Each tick starts due scheduled campaigns, then claims a batch of pending
//! records for every running campaign and sends them through the deployment
//! adapter. Sends are bounded globally by a semaphore. Pause is cooperative:
//! a claimed record is handed back if its campaign stopped running before the
//! send was issued, while sends already in flight finish normally.

use campaign_core::config::SchedulerConfig;
use campaign_core::types::{Campaign, CampaignStatus, ExecutionRecord, ExecutionStatus};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::lifecycle::CampaignController;

/// What a single tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub started: usize,
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub released: usize,
    pub completed: usize,
}

enum SendOutcome {
    Sent,
    Failed,
    Released,
}

pub struct ExecutionScheduler {
    controller: Arc<CampaignController>,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
}

impl ExecutionScheduler {
    pub fn new(controller: Arc<CampaignController>, config: SchedulerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            controller,
            config,
            permits,
        }
    }

    /// Run the loop on its own task until `shutdown` turns true or its sender
    /// is dropped.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_millis(self.config.tick_interval_ms.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            tick_interval_ms = self.config.tick_interval_ms,
            batch_size = self.config.batch_size,
            max_concurrency = self.config.max_concurrency,
            "Execution scheduler started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.tick().await;
                    if report != TickReport::default() {
                        debug!(?report, "Scheduler tick");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Execution scheduler stopped");
    }

    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport {
            started: self.controller.start_due_runs(Utc::now()).await.len(),
            ..TickReport::default()
        };

        for campaign in self.controller.store().campaigns_with_status(CampaignStatus::Running) {
            self.dispatch(&campaign, &mut report).await;

            if let Err(e) = self.controller.sync_counters(campaign.id).await {
                debug!(campaign_id = %campaign.id, error = %e, "Counter sync skipped");
                continue;
            }
            match self.controller.complete_if_drained(campaign.id).await {
                Ok(Some(_)) => report.completed += 1,
                Ok(None) => {}
                Err(e) => warn!(campaign_id = %campaign.id, error = %e, "Completion check failed"),
            }
        }
        report
    }

    async fn dispatch(&self, campaign: &Campaign, report: &mut TickReport) {
        let Some(workflow_id) = campaign.n8n_workflow_id.clone() else {
            warn!(campaign_id = %campaign.id, "Running campaign has no workflow, skipping");
            return;
        };
        let batch = self
            .controller
            .ledger()
            .claim_pending(campaign.id, self.config.batch_size);
        if batch.is_empty() {
            return;
        }

        let mut tasks = JoinSet::new();
        for record in batch {
            let controller = Arc::clone(&self.controller);
            let permits = Arc::clone(&self.permits);
            let workflow_id = workflow_id.clone();
            tasks.spawn(async move {
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return release(&controller, &record),
                };
                if !still_running(&controller, &record) {
                    return release(&controller, &record);
                }
                send(&controller, &workflow_id, &record).await
            });
        }

        let mut dispatched = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(SendOutcome::Sent) => {
                    dispatched += 1;
                    report.succeeded += 1;
                }
                Ok(SendOutcome::Failed) => {
                    dispatched += 1;
                    report.failed += 1;
                }
                Ok(SendOutcome::Released) => report.released += 1,
                Err(e) => error!(campaign_id = %campaign.id, error = %e, "Send task aborted"),
            }
        }
        report.dispatched += dispatched;
        metrics::counter!("scheduler.dispatched").increment(dispatched as u64);
    }
}

fn still_running(controller: &CampaignController, record: &ExecutionRecord) -> bool {
    controller
        .store()
        .get_campaign(record.campaign_id)
        .map(|c| c.status == CampaignStatus::Running)
        .unwrap_or(false)
}

fn release(controller: &CampaignController, record: &ExecutionRecord) -> SendOutcome {
    if let Err(e) = controller.ledger().release(record.id) {
        debug!(execution_id = %record.id, error = %e, "Release skipped");
    }
    SendOutcome::Released
}

async fn send(controller: &CampaignController, workflow_id: &str, record: &ExecutionRecord) -> SendOutcome {
    let result = controller
        .adapter()
        .send(record.campaign_id, workflow_id, &record.recipient())
        .await;
    let ledger = controller.ledger();
    let now = Utc::now();

    let (outcome, written) = match result {
        Ok(execution) if execution.succeeded() => (
            SendOutcome::Sent,
            ledger.record_attempt(record.id, ExecutionStatus::Success, Some(now)),
        ),
        Ok(execution) => {
            let reason = execution
                .error
                .unwrap_or_else(|| format!("execution {} did not succeed", execution.id));
            (SendOutcome::Failed, ledger.record_failure(record.id, now, reason))
        }
        Err(e) => (SendOutcome::Failed, ledger.record_failure(record.id, now, e.to_string())),
    };

    let label = match outcome {
        SendOutcome::Sent => "success",
        _ => "failed",
    };
    metrics::counter!("scheduler.sends", "outcome" => label).increment(1);

    // The record is gone when a new run replaced the ledger mid-flight.
    if let Err(e) = written {
        debug!(execution_id = %record.id, error = %e, "Send result not recorded");
    }
    outcome
}
