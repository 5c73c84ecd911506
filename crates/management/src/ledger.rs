//! Execution ledger — per-recipient send state for campaign runs.
//!
//! Each record lives in its own map entry and is only mutated through
//! `DashMap::get_mut`, so a record has a single writer at a time and writes
//! to different recipients never contend on a shared lock. The per-campaign
//! index is replaced wholesale when a run is enqueued, which keeps readers
//! from observing a half-built run.

use campaign_core::config::LedgerConfig;
use campaign_core::types::{
    Campaign, CampaignStatus, ExecutionPage, ExecutionRecord, ExecutionStatus, ProgressSnapshot, Recipient,
};
use campaign_core::{CampaignError, CampaignResult};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Record counts for one campaign, by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerCounts {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub success: u64,
    pub failed: u64,
}

impl LedgerCounts {
    pub fn processed(&self) -> u64 {
        self.success + self.failed
    }

    /// No record is waiting or in flight.
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.processing == 0
    }
}

/// A run whose records are published but whose predecessor is not yet
/// discarded. Hand it back to the ledger with `commit_run` or `rollback_run`.
#[must_use]
#[derive(Debug)]
pub struct StagedRun {
    campaign_id: Uuid,
    ids: Arc<Vec<Uuid>>,
    previous: Option<Arc<Vec<Uuid>>>,
}

impl StagedRun {
    pub fn ids(&self) -> &[Uuid] {
        &self.ids
    }
}

pub struct ExecutionLedger {
    records: DashMap<Uuid, ExecutionRecord>,
    /// campaign_id -> record ids in insertion order
    by_campaign: DashMap<Uuid, Arc<Vec<Uuid>>>,
    config: LedgerConfig,
}

impl ExecutionLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            records: DashMap::new(),
            by_campaign: DashMap::new(),
            config,
        }
    }

    /// Replace the campaign's records with one pending record per recipient.
    pub fn enqueue_run(&self, campaign_id: Uuid, recipients: &[Recipient]) -> Vec<Uuid> {
        let staged = self.stage_run(campaign_id, recipients);
        let ids = staged.ids.as_ref().clone();
        self.commit_run(staged);
        ids
    }

    /// Publish a new run's records while keeping the previous run restorable.
    ///
    /// Readers see the new records as soon as this returns. The previous
    /// records stay stored until [`commit_run`](Self::commit_run), so
    /// [`rollback_run`](Self::rollback_run) can put them back.
    pub fn stage_run(&self, campaign_id: Uuid, recipients: &[Recipient]) -> StagedRun {
        let ids: Vec<Uuid> = recipients
            .iter()
            .enumerate()
            .map(|(seq, recipient)| {
                let record = ExecutionRecord::pending(campaign_id, recipient, seq as u64);
                let id = record.id;
                self.records.insert(id, record);
                id
            })
            .collect();
        let ids = Arc::new(ids);
        let previous = self.by_campaign.insert(campaign_id, Arc::clone(&ids));
        StagedRun {
            campaign_id,
            ids,
            previous,
        }
    }

    /// Drop the records the staged run replaced.
    pub fn commit_run(&self, staged: StagedRun) {
        if let Some(previous) = staged.previous {
            for id in previous.iter() {
                self.records.remove(id);
            }
        }
        debug!(campaign_id = %staged.campaign_id, records = staged.ids.len(), "Run enqueued");
    }

    /// Undo [`stage_run`](Self::stage_run): restore the previous index and drop
    /// the staged records.
    pub fn rollback_run(&self, staged: StagedRun) {
        match staged.previous {
            Some(previous) => {
                self.by_campaign.insert(staged.campaign_id, previous);
            }
            None => {
                self.by_campaign.remove(&staged.campaign_id);
            }
        }
        for id in staged.ids.iter() {
            self.records.remove(id);
        }
        debug!(campaign_id = %staged.campaign_id, "Staged run rolled back");
    }

    /// Drop every record of a campaign.
    pub fn clear_campaign(&self, campaign_id: Uuid) -> usize {
        match self.by_campaign.remove(&campaign_id) {
            Some((_, ids)) => {
                for id in ids.iter() {
                    self.records.remove(id);
                }
                ids.len()
            }
            None => 0,
        }
    }

    pub fn get(&self, execution_id: Uuid) -> CampaignResult<ExecutionRecord> {
        self.records
            .get(&execution_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| CampaignError::NotFound(format!("Execution record {}", execution_id)))
    }

    fn ids(&self, campaign_id: Uuid) -> Arc<Vec<Uuid>> {
        self.by_campaign
            .get(&campaign_id)
            .map(|ids| Arc::clone(ids.value()))
            .unwrap_or_default()
    }

    /// Move a record to `status`.
    ///
    /// Entering processing (directly or implicitly on pending → terminal)
    /// counts an attempt. Re-applying the current status is a no-op.
    pub fn record_attempt(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        processed_at: Option<DateTime<Utc>>,
    ) -> CampaignResult<ExecutionRecord> {
        self.apply(execution_id, status, processed_at, None)
    }

    /// Mark a record failed and keep the reason.
    pub fn record_failure(
        &self,
        execution_id: Uuid,
        processed_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> CampaignResult<ExecutionRecord> {
        self.apply(execution_id, ExecutionStatus::Failed, Some(processed_at), Some(error.into()))
    }

    fn apply(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        processed_at: Option<DateTime<Utc>>,
        error: Option<String>,
    ) -> CampaignResult<ExecutionRecord> {
        use ExecutionStatus::*;

        let mut entry = self
            .records
            .get_mut(&execution_id)
            .ok_or_else(|| CampaignError::NotFound(format!("Execution record {}", execution_id)))?;
        let record = entry.value_mut();

        if record.status == status {
            return Ok(record.clone());
        }

        match (record.status, status) {
            (Pending, Processing) => {
                record.attempts += 1;
            }
            (Pending, Success) | (Pending, Failed) => {
                record.attempts += 1;
                record.processed_at = Some(processed_at.unwrap_or_else(Utc::now));
            }
            (Processing, Success) | (Processing, Failed) => {
                record.processed_at = Some(processed_at.unwrap_or_else(Utc::now));
            }
            (Failed, Pending) => {
                record.processed_at = None;
            }
            (from, to) => {
                return Err(CampaignError::InvalidRecordTransition(format!(
                    "record {} cannot move from {} to {}",
                    execution_id, from, to
                )));
            }
        }

        record.status = status;
        match status {
            Success => record.last_error = None,
            Failed => record.last_error = error.or_else(|| record.last_error.take()),
            _ => {}
        }
        metrics::counter!("ledger.attempts_recorded", "status" => status_label(status)).increment(1);
        Ok(record.clone())
    }

    /// Atomically move up to `limit` pending records (oldest first) to
    /// processing and return them. A record is handed to one caller only.
    pub fn claim_pending(&self, campaign_id: Uuid, limit: usize) -> Vec<ExecutionRecord> {
        let mut claimed = Vec::new();
        if limit == 0 {
            return claimed;
        }
        for id in self.ids(campaign_id).iter() {
            if let Some(mut entry) = self.records.get_mut(id) {
                let record = entry.value_mut();
                if record.status == ExecutionStatus::Pending {
                    record.status = ExecutionStatus::Processing;
                    record.attempts += 1;
                    claimed.push(record.clone());
                    if claimed.len() >= limit {
                        break;
                    }
                }
            }
        }
        claimed
    }

    /// Hand a claimed record back without counting the attempt.
    /// Used when dispatch stops before the send was issued.
    pub fn release(&self, execution_id: Uuid) -> CampaignResult<()> {
        let mut entry = self
            .records
            .get_mut(&execution_id)
            .ok_or_else(|| CampaignError::NotFound(format!("Execution record {}", execution_id)))?;
        let record = entry.value_mut();
        if record.status == ExecutionStatus::Processing {
            record.status = ExecutionStatus::Pending;
            record.attempts = record.attempts.saturating_sub(1);
        }
        Ok(())
    }

    /// Reset every failed record to pending, keeping its attempt count.
    pub fn requeue_failed(&self, campaign_id: Uuid) -> usize {
        let mut requeued = 0;
        for id in self.ids(campaign_id).iter() {
            if let Some(mut entry) = self.records.get_mut(id) {
                let record = entry.value_mut();
                if record.status == ExecutionStatus::Failed {
                    record.status = ExecutionStatus::Pending;
                    record.processed_at = None;
                    requeued += 1;
                }
            }
        }
        if requeued > 0 {
            metrics::counter!("ledger.requeued").increment(requeued as u64);
        }
        requeued
    }

    /// A page of records in insertion order. Pages are 1-based; a page past
    /// the end is empty.
    pub fn query(
        &self,
        campaign_id: Uuid,
        status: Option<ExecutionStatus>,
        page: usize,
        page_size: usize,
    ) -> CampaignResult<ExecutionPage> {
        if page == 0 || page_size == 0 {
            return Err(CampaignError::Validation("page and limit must be at least 1".to_string()));
        }
        let page_size = page_size.min(self.config.max_page_size.max(1));

        let matching: Vec<ExecutionRecord> = self
            .ids(campaign_id)
            .iter()
            .filter_map(|id| self.records.get(id).map(|r| r.value().clone()))
            .filter(|r| status.map_or(true, |s| r.status == s))
            .collect();

        let total = matching.len();
        let total_pages = total.div_ceil(page_size);
        let data = matching
            .into_iter()
            .skip((page - 1).saturating_mul(page_size))
            .take(page_size)
            .collect();

        Ok(ExecutionPage {
            data,
            page,
            limit: page_size,
            total_pages,
            total,
        })
    }

    pub fn default_page_size(&self) -> usize {
        self.config.default_page_size
    }

    pub fn counts(&self, campaign_id: Uuid) -> LedgerCounts {
        let mut counts = LedgerCounts::default();
        for id in self.ids(campaign_id).iter() {
            let Some(record) = self.records.get(id) else { continue };
            counts.total += 1;
            match record.status {
                ExecutionStatus::Pending => counts.pending += 1,
                ExecutionStatus::Processing => counts.processing += 1,
                ExecutionStatus::Success => counts.success += 1,
                ExecutionStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Progress of the campaign's current run.
    pub fn snapshot(&self, campaign: &Campaign) -> ProgressSnapshot {
        self.snapshot_at(campaign, Utc::now())
    }

    pub fn snapshot_at(&self, campaign: &Campaign, now: DateTime<Utc>) -> ProgressSnapshot {
        let counts = self.counts(campaign.id);
        let processed = counts.processed();
        let progress_percent = if counts.total == 0 {
            0.0
        } else {
            (processed as f64 / counts.total as f64 * 100.0).clamp(0.0, 100.0)
        };

        let active = matches!(campaign.status, CampaignStatus::Running | CampaignStatus::Paused);
        let estimated_completion = match campaign.started_at {
            Some(started) if active && processed > 0 && processed < counts.total => {
                let elapsed_ms = (now - started).num_milliseconds().max(0) as f64;
                let remaining = (counts.total - processed) as f64;
                let eta_ms = elapsed_ms / processed as f64 * remaining;
                Some(now + Duration::milliseconds(eta_ms as i64))
            }
            _ => None,
        };

        ProgressSnapshot {
            total_recipients: counts.total,
            processed_count: processed,
            success_count: counts.success,
            failed_count: counts.failed,
            pending_count: counts.pending,
            processing_count: counts.processing,
            progress_percent,
            scheduled_at: campaign.scheduled_at,
            started_at: campaign.started_at,
            completed_at: campaign.completed_at,
            estimated_completion,
        }
    }
}

fn status_label(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Pending => "pending",
        ExecutionStatus::Processing => "processing",
        ExecutionStatus::Success => "success",
        ExecutionStatus::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipients(n: usize) -> Vec<Recipient> {
        (0..n)
            .map(|i| Recipient {
                email: format!("user{}@example.com", i),
                name: format!("User {}", i),
            })
            .collect()
    }

    fn ledger() -> ExecutionLedger {
        ExecutionLedger::new(LedgerConfig::default())
    }

    #[test]
    fn test_pagination() {
        let ledger = ledger();
        let campaign = Uuid::new_v4();
        ledger.enqueue_run(campaign, &recipients(25));

        let first = ledger.query(campaign, None, 1, 20).unwrap();
        assert_eq!(first.data.len(), 20);
        assert_eq!(first.total, 25);
        assert_eq!(first.total_pages, 2);
        assert_eq!(first.limit, 20);
        assert_eq!(first.data[0].email, "user0@example.com");

        let second = ledger.query(campaign, None, 2, 20).unwrap();
        assert_eq!(second.data.len(), 5);
        assert_eq!(second.data[0].sequence, 20);

        let beyond = ledger.query(campaign, None, 99, 20).unwrap();
        assert!(beyond.data.is_empty());
        assert_eq!(beyond.total, 25);

        assert!(matches!(ledger.query(campaign, None, 0, 20), Err(CampaignError::Validation(_))));
        assert!(matches!(ledger.query(campaign, None, 1, 0), Err(CampaignError::Validation(_))));
    }

    #[test]
    fn test_staged_run_rolls_back_to_previous_records() {
        let ledger = ledger();
        let campaign = Uuid::new_v4();
        let first = ledger.enqueue_run(campaign, &recipients(3));
        ledger.record_attempt(first[0], ExecutionStatus::Failed, None).unwrap();

        let staged = ledger.stage_run(campaign, &recipients(5));
        assert_eq!(ledger.counts(campaign).pending, 5);
        let staged_ids = staged.ids().to_vec();
        ledger.rollback_run(staged);
        let counts = ledger.counts(campaign);
        assert_eq!(counts.total, 3);
        assert_eq!(counts.failed, 1);
        assert!(ledger.get(staged_ids[0]).is_err());

        let staged = ledger.stage_run(campaign, &recipients(5));
        ledger.commit_run(staged);
        assert_eq!(ledger.counts(campaign).total, 5);
        assert!(ledger.get(first[0]).is_err());

        let fresh = Uuid::new_v4();
        let staged = ledger.stage_run(fresh, &recipients(2));
        ledger.rollback_run(staged);
        assert_eq!(ledger.counts(fresh).total, 0);
    }

    #[test]
    fn test_page_size_is_capped() {
        let ledger = ExecutionLedger::new(LedgerConfig {
            default_page_size: 2,
            max_page_size: 3,
        });
        let campaign = Uuid::new_v4();
        ledger.enqueue_run(campaign, &recipients(10));
        let page = ledger.query(campaign, None, 1, 1000).unwrap();
        assert_eq!(page.data.len(), 3);
        assert_eq!(page.limit, 3);
        assert_eq!(page.total_pages, 4);
    }

    #[test]
    fn test_status_filter() {
        let ledger = ledger();
        let campaign = Uuid::new_v4();
        let ids = ledger.enqueue_run(campaign, &recipients(4));
        ledger.record_attempt(ids[1], ExecutionStatus::Failed, None).unwrap();
        ledger.record_attempt(ids[3], ExecutionStatus::Failed, None).unwrap();

        let failed = ledger.query(campaign, Some(ExecutionStatus::Failed), 1, 20).unwrap();
        assert_eq!(failed.total, 2);
        assert_eq!(failed.data[0].id, ids[1]);
        assert_eq!(failed.data[1].id, ids[3]);
    }

    #[test]
    fn test_record_attempt_transitions() {
        let ledger = ledger();
        let campaign = Uuid::new_v4();
        let id = ledger.enqueue_run(campaign, &recipients(1))[0];

        let r = ledger.record_attempt(id, ExecutionStatus::Processing, None).unwrap();
        assert_eq!(r.attempts, 1);
        let r = ledger.record_attempt(id, ExecutionStatus::Processing, None).unwrap();
        assert_eq!(r.attempts, 1);

        let r = ledger.record_failure(id, Utc::now(), "mailbox full").unwrap();
        assert_eq!(r.status, ExecutionStatus::Failed);
        assert!(r.processed_at.is_some());
        assert_eq!(r.last_error.as_deref(), Some("mailbox full"));

        // Same terminal status again is a no-op.
        let again = ledger.record_attempt(id, ExecutionStatus::Failed, None).unwrap();
        assert_eq!(again.attempts, 1);
        assert_eq!(again.processed_at, r.processed_at);

        // Retry re-entry: attempts preserved, then counted on the next processing.
        let r = ledger.record_attempt(id, ExecutionStatus::Pending, None).unwrap();
        assert_eq!(r.attempts, 1);
        assert!(r.processed_at.is_none());
        let r = ledger.record_attempt(id, ExecutionStatus::Success, None).unwrap();
        assert_eq!(r.attempts, 2);
        assert!(r.last_error.is_none());

        let err = ledger.record_attempt(id, ExecutionStatus::Pending, None).unwrap_err();
        assert!(matches!(err, CampaignError::InvalidRecordTransition(_)));
        assert!(matches!(
            ledger.record_attempt(Uuid::new_v4(), ExecutionStatus::Success, None),
            Err(CampaignError::NotFound(_))
        ));
    }

    #[test]
    fn test_claim_is_exclusive_and_ordered() {
        let ledger = ledger();
        let campaign = Uuid::new_v4();
        let ids = ledger.enqueue_run(campaign, &recipients(5));

        let first = ledger.claim_pending(campaign, 3);
        assert_eq!(first.iter().map(|r| r.id).collect::<Vec<_>>(), ids[..3].to_vec());
        assert!(first.iter().all(|r| r.attempts == 1 && r.status == ExecutionStatus::Processing));

        let second = ledger.claim_pending(campaign, 10);
        assert_eq!(second.len(), 2);
        assert!(ledger.claim_pending(campaign, 10).is_empty());

        ledger.release(ids[0]).unwrap();
        let record = ledger.get(ids[0]).unwrap();
        assert_eq!(record.status, ExecutionStatus::Pending);
        assert_eq!(record.attempts, 0);
    }

    #[test]
    fn test_requeue_failed() {
        let ledger = ledger();
        let campaign = Uuid::new_v4();
        let ids = ledger.enqueue_run(campaign, &recipients(3));
        assert_eq!(ledger.requeue_failed(campaign), 0);

        ledger.record_failure(ids[0], Utc::now(), "bounce").unwrap();
        ledger.record_attempt(ids[1], ExecutionStatus::Success, None).unwrap();
        assert_eq!(ledger.requeue_failed(campaign), 1);

        let record = ledger.get(ids[0]).unwrap();
        assert_eq!(record.status, ExecutionStatus::Pending);
        assert_eq!(record.attempts, 1);
        assert_eq!(ledger.requeue_failed(campaign), 0);
    }

    #[test]
    fn test_snapshot_counts_are_consistent() {
        let ledger = ledger();
        let mut campaign = Campaign::new("c", "");
        campaign.status = CampaignStatus::Running;
        let started = Utc::now() - Duration::seconds(10);
        campaign.started_at = Some(started);
        let ids = ledger.enqueue_run(campaign.id, &recipients(4));

        let empty = ledger.snapshot(&campaign);
        assert_eq!(empty.total_recipients, 4);
        assert_eq!(empty.progress_percent, 0.0);
        assert!(empty.estimated_completion.is_none());

        ledger.record_attempt(ids[0], ExecutionStatus::Success, None).unwrap();
        ledger.record_attempt(ids[1], ExecutionStatus::Failed, None).unwrap();
        ledger.record_attempt(ids[2], ExecutionStatus::Processing, None).unwrap();

        let now = started + Duration::seconds(10);
        let snap = ledger.snapshot_at(&campaign, now);
        assert_eq!(snap.processed_count, snap.success_count + snap.failed_count);
        assert_eq!(snap.processed_count, 2);
        assert_eq!(snap.processing_count, 1);
        assert_eq!(snap.pending_count, 1);
        assert_eq!(snap.progress_percent, 50.0);
        // 2 records took 10s, 2 remain.
        assert_eq!(snap.estimated_completion, Some(now + Duration::seconds(10)));
    }

    #[test]
    fn test_snapshot_without_records() {
        let ledger = ledger();
        let campaign = Campaign::new("c", "");
        let snap = ledger.snapshot(&campaign);
        assert_eq!(snap.total_recipients, 0);
        assert_eq!(snap.progress_percent, 0.0);
    }

    #[test]
    fn test_enqueue_replaces_previous_run() {
        let ledger = ledger();
        let campaign = Uuid::new_v4();
        let old = ledger.enqueue_run(campaign, &recipients(3));
        ledger.enqueue_run(campaign, &recipients(2));
        assert_eq!(ledger.counts(campaign).total, 2);
        assert!(ledger.get(old[0]).is_err());
        assert_eq!(ledger.clear_campaign(campaign), 2);
        assert_eq!(ledger.counts(campaign), LedgerCounts::default());
    }

    #[test]
    fn test_concurrent_writers_keep_counts_consistent() {
        let ledger = Arc::new(ledger());
        let campaign = Uuid::new_v4();
        ledger.enqueue_run(campaign, &recipients(200));

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || loop {
                    let batch = ledger.claim_pending(campaign, 7);
                    if batch.is_empty() {
                        break;
                    }
                    for (i, record) in batch.iter().enumerate() {
                        let status = if (i + worker) % 3 == 0 {
                            ExecutionStatus::Failed
                        } else {
                            ExecutionStatus::Success
                        };
                        ledger.record_attempt(record.id, status, None).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let counts = ledger.counts(campaign);
        assert_eq!(counts.total, 200);
        assert_eq!(counts.processed(), 200);
        assert!(counts.is_drained());
        let page = ledger.query(campaign, None, 1, 100).unwrap();
        assert!(page.data.iter().all(|r| r.attempts == 1));
    }
}
