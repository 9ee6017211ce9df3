//! In-memory store backed by DashMap.
//!
//! Same API surface as the PostgreSQL store, used for development (seeded
//! from a JSON catalog) and tests. Budget decrements hold the campaign's
//! shard lock, which gives the same row-level atomicity as the SQL path.

use crate::{AuditSink, BudgetSnapshot, CatalogStore, LedgerStore};
use adserve_core::types::{
    Campaign, CampaignId, CandidateRecord, DeliveryEvent, EventType, Placement, PlacementId,
    PlacementLink,
};
use adserve_core::{AdServeError, AdServeResult};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

/// Catalog snapshot used to seed the in-memory store.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogSeed {
    #[serde(default)]
    pub placements: Vec<Placement>,
    #[serde(default)]
    pub campaigns: Vec<Campaign>,
    #[serde(default)]
    pub links: Vec<PlacementLink>,
}

/// Thread-safe in-memory catalog, ledger and audit trail.
#[derive(Default)]
pub struct MemoryStore {
    campaigns: DashMap<CampaignId, Campaign>,
    placements: DashMap<PlacementId, Placement>,
    links: DashMap<PlacementId, Vec<PlacementLink>>,
    events: DashMap<Uuid, DeliveryEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: CatalogSeed) -> Self {
        let store = Self::new();
        for placement in seed.placements {
            store.upsert_placement(placement);
        }
        for campaign in seed.campaigns {
            store.upsert_campaign(campaign);
        }
        for link in seed.links {
            store.link(link);
        }
        info!(
            campaigns = store.campaigns.len(),
            placements = store.placements.len(),
            "Memory store seeded"
        );
        store
    }

    /// Load a JSON catalog file.
    pub fn load_seed_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let seed: CatalogSeed = serde_json::from_str(&raw)?;
        Ok(Self::from_seed(seed))
    }

    pub fn upsert_campaign(&self, campaign: Campaign) {
        self.campaigns.insert(campaign.id, campaign);
    }

    pub fn upsert_placement(&self, placement: Placement) {
        self.placements.insert(placement.id, placement);
    }

    /// Add or replace the link between a campaign and a placement.
    pub fn link(&self, link: PlacementLink) {
        let mut links = self.links.entry(link.placement_id).or_default();
        links.retain(|l| l.campaign_id != link.campaign_id);
        links.push(link);
    }

    /// Current campaign row, including counters and remaining budget.
    pub fn campaign_snapshot(&self, id: CampaignId) -> Option<Campaign> {
        self.campaigns.get(&id).map(|r| r.value().clone())
    }

    pub fn events_for_campaign(&self, id: CampaignId) -> Vec<DeliveryEvent> {
        let mut events: Vec<DeliveryEvent> = self
            .events
            .iter()
            .filter(|r| r.value().campaign_id == id)
            .map(|r| r.value().clone())
            .collect();
        events.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        events
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn placement(&self, id: PlacementId) -> AdServeResult<Option<Placement>> {
        Ok(self.placements.get(&id).map(|r| r.value().clone()))
    }

    async fn campaign(&self, id: CampaignId) -> AdServeResult<Option<Campaign>> {
        Ok(self.campaign_snapshot(id))
    }

    async fn candidates_for_placement(
        &self,
        id: PlacementId,
    ) -> AdServeResult<Vec<CandidateRecord>> {
        let Some(links) = self.links.get(&id).map(|r| r.value().clone()) else {
            return Ok(Vec::new());
        };
        Ok(links
            .into_iter()
            .filter_map(|link| {
                self.campaign_snapshot(link.campaign_id)
                    .map(|campaign| CandidateRecord {
                        campaign,
                        link_active: link.active,
                    })
            })
            .collect())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn budget(&self, id: CampaignId) -> AdServeResult<Option<BudgetSnapshot>> {
        Ok(self.campaigns.get(&id).map(|c| BudgetSnapshot {
            total_budget: c.total_budget,
            remaining_budget: c.remaining_budget,
            daily_budget: c.daily_budget,
        }))
    }

    async fn decrement_remaining(&self, id: CampaignId, cost: f64) -> AdServeResult<bool> {
        let mut campaign = self
            .campaigns
            .get_mut(&id)
            .ok_or_else(|| AdServeError::not_found(format!("campaign {id}")))?;
        if campaign.remaining_budget < cost {
            return Ok(false);
        }
        campaign.remaining_budget -= cost;
        Ok(true)
    }
}

#[async_trait]
impl AuditSink for MemoryStore {
    async fn append(&self, event: &DeliveryEvent) -> AdServeResult<()> {
        if let Some(parent) = event.parent_id {
            if !self.events.contains_key(&parent) {
                return Err(AdServeError::not_found(format!("delivery event {parent}")));
            }
        }
        let mut campaign = self
            .campaigns
            .get_mut(&event.campaign_id)
            .ok_or_else(|| AdServeError::not_found(format!("campaign {}", event.campaign_id)))?;
        match event.event_type {
            EventType::Impression => campaign.stats.impressions += 1,
            EventType::Click => campaign.stats.clicks += 1,
            EventType::Conversion => campaign.stats.conversions += 1,
        }
        drop(campaign);
        self.events.insert(event.id, event.clone());
        Ok(())
    }

    async fn event(&self, id: Uuid) -> AdServeResult<Option<DeliveryEvent>> {
        Ok(self.events.get(&id).map(|r| r.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adserve_core::types::{CampaignStatus, DeliveryStats, PlacementStatus};
    use adserve_core::TargetingRules;
    use chrono::Utc;

    fn campaign(id: CampaignId, remaining: f64) -> Campaign {
        Campaign {
            id,
            advertiser_id: 1,
            creative_payload: r#"{"type":"text","content":{"headline":"Sale"}}"#.to_string(),
            target_url: "https://example.com/landing".to_string(),
            status: CampaignStatus::Approved,
            starts_at: None,
            ends_at: None,
            total_budget: 10.0,
            daily_budget: None,
            remaining_budget: remaining,
            cost_per_impression: 0.01,
            cost_per_click: 0.25,
            targeting: TargetingRules::default(),
            stats: DeliveryStats::default(),
        }
    }

    fn event(campaign_id: CampaignId, event_type: EventType, parent: Option<Uuid>) -> DeliveryEvent {
        DeliveryEvent {
            id: Uuid::new_v4(),
            event_type,
            campaign_id,
            placement_id: 1,
            parent_id: parent,
            context_digest: "digest".to_string(),
            cost: 0.0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_candidates_follow_links() {
        let store = MemoryStore::new();
        store.upsert_placement(Placement {
            id: 1,
            publisher_id: 9,
            width: 300,
            height: 250,
            status: PlacementStatus::Active,
        });
        store.upsert_campaign(campaign(1, 10.0));
        store.upsert_campaign(campaign(2, 10.0));
        store.link(PlacementLink {
            campaign_id: 1,
            placement_id: 1,
            active: true,
        });
        store.link(PlacementLink {
            campaign_id: 2,
            placement_id: 1,
            active: false,
        });
        // Re-linking replaces rather than duplicates.
        store.link(PlacementLink {
            campaign_id: 1,
            placement_id: 1,
            active: true,
        });

        let candidates = store.candidates_for_placement(1).await.unwrap();
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().any(|c| c.campaign.id == 2 && !c.link_active));
        assert!(store.candidates_for_placement(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conditional_decrement() {
        let store = MemoryStore::new();
        store.upsert_campaign(campaign(1, 1.0));

        assert!(store.decrement_remaining(1, 0.75).await.unwrap());
        assert!(!store.decrement_remaining(1, 0.5).await.unwrap());
        let budget = store.budget(1).await.unwrap().unwrap();
        assert!((budget.remaining_budget - 0.25).abs() < 1e-9);

        assert!(matches!(
            store.decrement_remaining(99, 0.1).await,
            Err(AdServeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_append_updates_counters_and_checks_parent() {
        let store = MemoryStore::new();
        store.upsert_campaign(campaign(1, 10.0));

        let impression = event(1, EventType::Impression, None);
        store.append(&impression).await.unwrap();
        store
            .append(&event(1, EventType::Click, Some(impression.id)))
            .await
            .unwrap();

        let orphan = event(1, EventType::Click, Some(Uuid::new_v4()));
        assert!(matches!(
            store.append(&orphan).await,
            Err(AdServeError::NotFound(_))
        ));

        let stats = store.campaign_snapshot(1).unwrap().stats;
        assert_eq!(stats.impressions, 1);
        assert_eq!(stats.clicks, 1);
        assert_eq!(store.event_count(), 2);
        assert_eq!(store.event(impression.id).await.unwrap(), Some(impression));
    }

    #[test]
    fn test_seed_parses_catalog_json() {
        let json = r#"{
            "placements": [{"id": 1, "publisher_id": 3, "width": 728, "height": 90, "status": "active"}],
            "campaigns": [{
                "id": 10, "advertiser_id": 4,
                "creative_payload": "{\"type\":\"image\",\"content\":{\"src\":\"https://cdn/x.png\"}}",
                "target_url": "https://example.com", "status": "approved",
                "total_budget": 100.0, "remaining_budget": 100.0, "cost_per_impression": 0.02
            }],
            "links": [{"campaign_id": 10, "placement_id": 1}]
        }"#;
        let seed: CatalogSeed = serde_json::from_str(json).unwrap();
        let store = MemoryStore::from_seed(seed);
        let c = store.campaign_snapshot(10).unwrap();
        assert_eq!(c.cost_per_click, 0.0);
        assert_eq!(c.targeting.configured_dimensions(), 0);
        assert!(store.links.get(&1).unwrap()[0].active);
    }

    #[tokio::test]
    async fn test_bundled_dev_catalog_loads() {
        let seed: CatalogSeed =
            serde_json::from_str(include_str!("../../../config/catalog.json")).unwrap();
        let store = MemoryStore::from_seed(seed);
        for c in store.campaigns.iter() {
            assert!(
                c.status != CampaignStatus::Approved
                    || adserve_core::types::Creative::parse(&c.creative_payload).is_ok(),
                "campaign {} has an invalid creative",
                c.id
            );
        }
        let links = store.candidates_for_placement(3).await.unwrap();
        assert!(links.iter().all(|l| !l.link_active));
    }
}
