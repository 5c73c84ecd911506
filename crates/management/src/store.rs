//! In-memory campaign, flow and segment store backed by DashMap.
//!
//! Production: replace with PostgreSQL (sqlx) or similar ACID store.
//! The campaign row is the unit of atomicity: every mutation is applied to a
//! copy and written back only if it succeeds, so a failed operation never
//! leaves partial state behind.

use campaign_core::flow::FlowData;
use campaign_core::types::{Campaign, CampaignStatus, Recipient, Segment, StatusTransition};
use campaign_core::{CampaignError, CampaignResult};
use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{CreateCampaignRequest, CreateSegmentRequest, UpdateCampaignRequest};

/// Thread-safe store for campaigns (with their flows), segments and status history.
pub struct CampaignStore {
    campaigns: DashMap<Uuid, Campaign>,
    segments: DashMap<Uuid, Segment>,
    history: DashMap<Uuid, Vec<StatusTransition>>,
}

impl CampaignStore {
    pub fn new() -> Self {
        info!("Campaign store initialized (in-memory)");
        Self {
            campaigns: DashMap::new(),
            segments: DashMap::new(),
            history: DashMap::new(),
        }
    }

    // ─── Campaigns ─────────────────────────────────────────────────────────

    pub fn list_campaigns(&self) -> Vec<Campaign> {
        let mut campaigns: Vec<Campaign> = self.campaigns.iter().map(|r| r.value().clone()).collect();
        campaigns.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        campaigns
    }

    /// Campaigns currently in `status`.
    pub fn campaigns_with_status(&self, status: CampaignStatus) -> Vec<Campaign> {
        self.campaigns
            .iter()
            .filter(|r| r.value().status == status)
            .map(|r| r.value().clone())
            .collect()
    }

    pub fn get_campaign(&self, id: Uuid) -> CampaignResult<Campaign> {
        self.campaigns
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or_else(|| CampaignError::campaign_not_found(id))
    }

    pub fn create_campaign(&self, req: CreateCampaignRequest) -> CampaignResult<Campaign> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(CampaignError::Validation("campaign name must not be empty".to_string()));
        }
        if let Some(segment_id) = req.segment_id {
            self.get_segment(segment_id)?;
        }
        check_dates(req.start_date, req.end_date)?;

        let mut campaign = Campaign::new(name, req.description);
        campaign.segment_id = req.segment_id;
        campaign.start_date = req.start_date;
        campaign.end_date = req.end_date;
        if let Some(flow) = req.flow_data {
            flow.validate()?;
            campaign.flow_data = flow;
            campaign.flow_updated_at = Some(campaign.created_at);
        }

        self.campaigns.insert(campaign.id, campaign.clone());
        self.history.insert(campaign.id, Vec::new());
        info!(campaign_id = %campaign.id, name = %campaign.name, "Campaign created");
        Ok(campaign)
    }

    pub fn update_campaign(&self, id: Uuid, req: UpdateCampaignRequest) -> CampaignResult<Campaign> {
        if let Some(segment_id) = req.segment_id {
            self.get_segment(segment_id)?;
        }
        self.update(id, |c| {
            if let Some(name) = req.name {
                let name = name.trim();
                if name.is_empty() {
                    return Err(CampaignError::Validation("campaign name must not be empty".to_string()));
                }
                c.name = name.to_string();
            }
            if let Some(description) = req.description {
                c.description = description;
            }
            if let Some(segment_id) = req.segment_id {
                if matches!(c.status, CampaignStatus::Running | CampaignStatus::Paused) {
                    return Err(CampaignError::Conflict(
                        "segment cannot change while a run is in progress".to_string(),
                    ));
                }
                c.segment_id = Some(segment_id);
            }
            if let Some(start) = req.start_date {
                c.start_date = Some(start);
            }
            if let Some(end) = req.end_date {
                c.end_date = Some(end);
            }
            check_dates(c.start_date, c.end_date)
        })
    }

    pub fn delete_campaign(&self, id: Uuid) -> CampaignResult<Campaign> {
        let removed = self
            .campaigns
            .remove_if(&id, |_, c| c.status != CampaignStatus::Running)
            .map(|(_, c)| c);
        match removed {
            Some(campaign) => {
                self.history.remove(&id);
                info!(campaign_id = %id, "Campaign deleted");
                Ok(campaign)
            }
            None if self.campaigns.contains_key(&id) => Err(CampaignError::Conflict(
                "a running campaign cannot be deleted, pause it first".to_string(),
            )),
            None => Err(CampaignError::campaign_not_found(id)),
        }
    }

    /// Apply `f` to a copy of the campaign and persist it only on success.
    pub fn update<F>(&self, id: Uuid, f: F) -> CampaignResult<Campaign>
    where
        F: FnOnce(&mut Campaign) -> CampaignResult<()>,
    {
        let mut entry = self
            .campaigns
            .get_mut(&id)
            .ok_or_else(|| CampaignError::campaign_not_found(id))?;
        let mut draft = entry.value().clone();
        f(&mut draft)?;
        draft.touch();
        *entry.value_mut() = draft.clone();
        Ok(draft)
    }

    /// Persist a status change if the row is still at `expected_version`.
    ///
    /// `f` applies the side effects that must land together with the status.
    /// The caller is responsible for checking the transition is legal.
    pub fn transition<F>(
        &self,
        id: Uuid,
        expected_version: u64,
        to: CampaignStatus,
        reason: &str,
        f: F,
    ) -> CampaignResult<Campaign>
    where
        F: FnOnce(&mut Campaign),
    {
        let mut from = to;
        let campaign = self.update(id, |c| {
            if c.version != expected_version {
                return Err(CampaignError::Conflict(format!(
                    "campaign {} was modified concurrently (version {} != {})",
                    id, c.version, expected_version
                )));
            }
            from = c.status;
            c.status = to;
            f(c);
            Ok(())
        })?;

        if from != to {
            let entry = StatusTransition {
                id: Uuid::new_v4(),
                campaign_id: id,
                from,
                to,
                reason: reason.to_string(),
                timestamp: Utc::now(),
            };
            self.history.entry(id).or_default().push(entry);
            metrics::counter!("campaigns.status_changes", "to" => to.as_str()).increment(1);
            info!(campaign_id = %id, from = %from, to = %to, reason, "Campaign status changed");
        }
        Ok(campaign)
    }

    pub fn history(&self, id: Uuid) -> CampaignResult<Vec<StatusTransition>> {
        if !self.campaigns.contains_key(&id) {
            return Err(CampaignError::campaign_not_found(id));
        }
        Ok(self.history.get(&id).map(|h| h.clone()).unwrap_or_default())
    }

    // ─── Flows ─────────────────────────────────────────────────────────────

    pub fn get_flow(&self, id: Uuid) -> CampaignResult<FlowData> {
        self.campaigns
            .get(&id)
            .map(|r| r.value().flow_data.clone())
            .ok_or_else(|| CampaignError::campaign_not_found(id))
    }

    /// Replace the campaign's flow wholesale. Status is left untouched and a
    /// deployed workflow id is kept; staleness is visible through
    /// `flow_updated_at` vs `deployed_at`.
    pub fn save_flow(&self, id: Uuid, flow: FlowData) -> CampaignResult<Campaign> {
        flow.validate()?;
        let nodes = flow.nodes.len();
        let campaign = self.update(id, |c| {
            c.flow_data = flow;
            c.flow_updated_at = Some(Utc::now());
            Ok(())
        })?;
        debug!(campaign_id = %id, nodes, "Flow saved");
        Ok(campaign)
    }

    // ─── Segments ──────────────────────────────────────────────────────────

    pub fn create_segment(&self, req: CreateSegmentRequest) -> CampaignResult<Segment> {
        if req.name.trim().is_empty() {
            return Err(CampaignError::Validation("segment name must not be empty".to_string()));
        }
        if let Some(bad) = req.recipients.iter().find(|r| !r.email.contains('@')) {
            return Err(CampaignError::Validation(format!(
                "'{}' is not a valid email address",
                bad.email
            )));
        }
        let segment = Segment {
            id: Uuid::new_v4(),
            name: req.name.trim().to_string(),
            recipients: req.recipients,
            created_at: Utc::now(),
        };
        self.segments.insert(segment.id, segment.clone());
        info!(segment_id = %segment.id, recipients = segment.recipients.len(), "Segment created");
        Ok(segment)
    }

    pub fn list_segments(&self) -> Vec<Segment> {
        let mut segments: Vec<Segment> = self.segments.iter().map(|r| r.value().clone()).collect();
        segments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        segments
    }

    pub fn get_segment(&self, id: Uuid) -> CampaignResult<Segment> {
        self.segments
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or_else(|| CampaignError::NotFound(format!("Segment {}", id)))
    }

    /// Recipients targeted by a campaign; empty when it has no segment.
    pub fn recipients_for(&self, campaign: &Campaign) -> CampaignResult<Vec<Recipient>> {
        match campaign.segment_id {
            Some(segment_id) => Ok(self.get_segment(segment_id)?.recipients),
            None => Ok(Vec::new()),
        }
    }
}

impl Default for CampaignStore {
    fn default() -> Self {
        Self::new()
    }
}

fn check_dates(
    start: Option<chrono::DateTime<Utc>>,
    end: Option<chrono::DateTime<Utc>>,
) -> CampaignResult<()> {
    match (start, end) {
        (Some(start), Some(end)) if end < start => Err(CampaignError::Validation(
            "endDate must not be before startDate".to_string(),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campaign_core::flow::{FlowEdge, FlowNode, NodeType};

    fn create(store: &CampaignStore, name: &str) -> Campaign {
        store
            .create_campaign(CreateCampaignRequest {
                name: name.to_string(),
                description: String::new(),
                segment_id: None,
                start_date: None,
                end_date: None,
                flow_data: None,
            })
            .unwrap()
    }

    #[test]
    fn test_create_and_get() {
        let store = CampaignStore::new();
        let c = create(&store, "  Welcome series ");
        assert_eq!(c.name, "Welcome series");
        assert_eq!(c.status, CampaignStatus::Draft);
        assert_eq!(store.get_campaign(c.id).unwrap().id, c.id);
        assert!(matches!(store.get_campaign(Uuid::new_v4()), Err(CampaignError::NotFound(_))));
    }

    #[test]
    fn test_create_rejects_unknown_segment() {
        let store = CampaignStore::new();
        let err = store
            .create_campaign(CreateCampaignRequest {
                name: "x".to_string(),
                description: String::new(),
                segment_id: Some(Uuid::new_v4()),
                start_date: None,
                end_date: None,
                flow_data: None,
            })
            .unwrap_err();
        assert!(matches!(err, CampaignError::NotFound(_)));
        assert!(store.list_campaigns().is_empty());
    }

    #[test]
    fn test_failed_update_leaves_row_unchanged() {
        let store = CampaignStore::new();
        let c = create(&store, "c");
        let err = store
            .update(c.id, |c| {
                c.name = "changed".to_string();
                Err(CampaignError::Validation("nope".to_string()))
            })
            .unwrap_err();
        assert!(matches!(err, CampaignError::Validation(_)));
        let after = store.get_campaign(c.id).unwrap();
        assert_eq!(after.name, "c");
        assert_eq!(after.version, c.version);
    }

    #[test]
    fn test_transition_checks_version_and_records_history() {
        let store = CampaignStore::new();
        let c = create(&store, "c");
        let updated = store
            .transition(c.id, c.version, CampaignStatus::Scheduled, "test", |_| {})
            .unwrap();
        assert_eq!(updated.status, CampaignStatus::Scheduled);
        assert_eq!(updated.version, c.version + 1);

        // Stale version loses.
        let err = store
            .transition(c.id, c.version, CampaignStatus::Draft, "test", |_| {})
            .unwrap_err();
        assert!(matches!(err, CampaignError::Conflict(_)));

        let history = store.history(c.id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from, CampaignStatus::Draft);
        assert_eq!(history[0].to, CampaignStatus::Scheduled);
    }

    #[test]
    fn test_save_flow_replaces_and_validates() {
        let store = CampaignStore::new();
        let c = create(&store, "c");
        assert!(store.get_flow(c.id).unwrap().is_empty());

        let flow = FlowData {
            nodes: vec![
                FlowNode::new("a", NodeType::Trigger, "Start"),
                FlowNode::new("b", NodeType::SendEmail, "Mail"),
            ],
            edges: vec![FlowEdge::new("a", "b")],
        };
        let saved = store.save_flow(c.id, flow.clone()).unwrap();
        assert_eq!(saved.status, CampaignStatus::Draft);
        assert!(saved.flow_updated_at.is_some());
        assert_eq!(store.get_flow(c.id).unwrap(), flow);

        let mut broken = flow.clone();
        broken.edges.push(FlowEdge::new("b", "zzz"));
        assert!(matches!(store.save_flow(c.id, broken), Err(CampaignError::Validation(_))));
        assert_eq!(store.get_flow(c.id).unwrap(), flow);
    }

    #[test]
    fn test_delete_running_campaign_conflicts() {
        let store = CampaignStore::new();
        let c = create(&store, "c");
        store
            .update(c.id, |c| {
                c.status = CampaignStatus::Running;
                Ok(())
            })
            .unwrap();
        assert!(matches!(store.delete_campaign(c.id), Err(CampaignError::Conflict(_))));
        store
            .update(c.id, |c| {
                c.status = CampaignStatus::Paused;
                Ok(())
            })
            .unwrap();
        assert!(store.delete_campaign(c.id).is_ok());
        assert!(matches!(store.delete_campaign(c.id), Err(CampaignError::NotFound(_))));
    }

    #[test]
    fn test_segments() {
        let store = CampaignStore::new();
        let segment = store
            .create_segment(CreateSegmentRequest {
                name: "VIP".to_string(),
                recipients: vec![Recipient { email: "a@example.com".to_string(), name: "A".to_string() }],
            })
            .unwrap();
        let mut c = create(&store, "c");
        assert!(store.recipients_for(&c).unwrap().is_empty());
        c = store
            .update_campaign(c.id, UpdateCampaignRequest { segment_id: Some(segment.id), ..Default::default() })
            .unwrap();
        assert_eq!(store.recipients_for(&c).unwrap().len(), 1);

        let err = store
            .create_segment(CreateSegmentRequest {
                name: "bad".to_string(),
                recipients: vec![Recipient { email: "nope".to_string(), name: String::new() }],
            })
            .unwrap_err();
        assert!(matches!(err, CampaignError::Validation(_)));
    }
}
