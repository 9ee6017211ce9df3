//! Delivery recorder: appends impression/click/conversion rows to the audit
//! trail and mirrors them to the analytics sink.

use adserve_core::types::{CampaignId, DeliveryEvent, EventType, PlacementId};
use adserve_core::{AdServeError, AdServeResult, DeliverySink};
use adserve_store::AuditSink;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct DeliveryRecorder {
    audit: Arc<dyn AuditSink>,
    sink: Arc<dyn DeliverySink>,
}

impl DeliveryRecorder {
    pub fn new(audit: Arc<dyn AuditSink>, sink: Arc<dyn DeliverySink>) -> Self {
        Self { audit, sink }
    }

    /// Build an impression row with a fresh id. Nothing is persisted.
    pub fn impression_event(
        campaign_id: CampaignId,
        placement_id: PlacementId,
        context_digest: String,
        cost: f64,
    ) -> DeliveryEvent {
        DeliveryEvent {
            id: Uuid::new_v4(),
            event_type: EventType::Impression,
            campaign_id,
            placement_id,
            parent_id: None,
            context_digest,
            cost,
            created_at: Utc::now(),
        }
    }

    /// Persist the event, then mirror it downstream.
    pub async fn record(&self, event: &DeliveryEvent) -> AdServeResult<()> {
        if let Err(e) = self.audit.append(event).await {
            metrics::counter!("delivery.record_errors", "type" => event.event_type.as_str())
                .increment(1);
            warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                campaign_id = event.campaign_id,
                error = %e,
                "Failed to append delivery event"
            );
            return Err(e);
        }
        self.sink.emit(event);
        metrics::counter!("delivery.recorded", "type" => event.event_type.as_str()).increment(1);
        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            campaign_id = event.campaign_id,
            placement_id = event.placement_id,
            "Delivery event recorded"
        );
        Ok(())
    }

    pub async fn record_impression(
        &self,
        campaign_id: CampaignId,
        placement_id: PlacementId,
        context_digest: String,
        cost: f64,
    ) -> AdServeResult<Uuid> {
        let event = Self::impression_event(campaign_id, placement_id, context_digest, cost);
        self.record(&event).await?;
        Ok(event.id)
    }

    /// The recorded impression with this id.
    pub async fn impression(&self, impression_id: Uuid) -> AdServeResult<DeliveryEvent> {
        match self.audit.event(impression_id).await? {
            Some(event) if event.event_type == EventType::Impression => Ok(event),
            _ => Err(AdServeError::not_found(format!("impression {impression_id}"))),
        }
    }

    /// Record a click on a prior impression. Campaign and placement are
    /// taken from the impression; an unknown impression writes nothing.
    pub async fn record_click(
        &self,
        impression_id: Uuid,
        context_digest: String,
        cost: f64,
    ) -> AdServeResult<DeliveryEvent> {
        self.record_child(EventType::Click, impression_id, context_digest, cost)
            .await
    }

    pub async fn record_conversion(
        &self,
        impression_id: Uuid,
        context_digest: String,
    ) -> AdServeResult<DeliveryEvent> {
        self.record_child(EventType::Conversion, impression_id, context_digest, 0.0)
            .await
    }

    async fn record_child(
        &self,
        event_type: EventType,
        impression_id: Uuid,
        context_digest: String,
        cost: f64,
    ) -> AdServeResult<DeliveryEvent> {
        let parent = self.impression(impression_id).await?;
        let event = DeliveryEvent {
            id: Uuid::new_v4(),
            event_type,
            campaign_id: parent.campaign_id,
            placement_id: parent.placement_id,
            parent_id: Some(parent.id),
            context_digest,
            cost,
            created_at: Utc::now(),
        };
        self.record(&event).await?;
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adserve_core::types::{Campaign, CampaignStatus, DeliveryStats};
    use adserve_core::{CaptureSink, TargetingRules};
    use adserve_store::MemoryStore;

    fn setup() -> (Arc<MemoryStore>, Arc<CaptureSink>, DeliveryRecorder) {
        let store = Arc::new(MemoryStore::new());
        store.upsert_campaign(Campaign {
            id: 7,
            advertiser_id: 1,
            creative_payload: String::new(),
            target_url: "https://example.com".to_string(),
            status: CampaignStatus::Approved,
            starts_at: None,
            ends_at: None,
            total_budget: 10.0,
            daily_budget: None,
            remaining_budget: 10.0,
            cost_per_impression: 0.01,
            cost_per_click: 0.2,
            targeting: TargetingRules::default(),
            stats: DeliveryStats::default(),
        });
        let sink = Arc::new(CaptureSink::new());
        let recorder = DeliveryRecorder::new(store.clone(), sink.clone());
        (store, sink, recorder)
    }

    #[tokio::test]
    async fn test_click_inherits_from_impression() {
        let (store, sink, recorder) = setup();
        let impression_id = recorder
            .record_impression(7, 3, "ctx".to_string(), 0.01)
            .await
            .unwrap();

        let click = recorder
            .record_click(impression_id, "ctx2".to_string(), 0.2)
            .await
            .unwrap();
        assert_eq!(click.campaign_id, 7);
        assert_eq!(click.placement_id, 3);
        assert_eq!(click.parent_id, Some(impression_id));

        let conversion = recorder
            .record_conversion(impression_id, "ctx3".to_string())
            .await
            .unwrap();
        assert_eq!(conversion.cost, 0.0);

        assert_eq!(sink.count(), 3);
        let stats = store.campaign_snapshot(7).unwrap().stats;
        assert_eq!((stats.impressions, stats.clicks, stats.conversions), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_unknown_impression_writes_nothing() {
        let (store, sink, recorder) = setup();
        let err = recorder
            .record_click(Uuid::new_v4(), "ctx".to_string(), 0.2)
            .await
            .unwrap_err();
        assert!(matches!(err, AdServeError::NotFound(_)));
        assert_eq!(store.event_count(), 0);
        assert_eq!(sink.count(), 0);
    }

    #[tokio::test]
    async fn test_click_cannot_parent_a_click() {
        let (_store, _sink, recorder) = setup();
        let impression_id = recorder
            .record_impression(7, 3, "ctx".to_string(), 0.01)
            .await
            .unwrap();
        let click = recorder
            .record_click(impression_id, "ctx".to_string(), 0.0)
            .await
            .unwrap();

        assert!(matches!(
            recorder.record_click(click.id, "ctx".to_string(), 0.0).await,
            Err(AdServeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_append_is_not_mirrored() {
        let (_store, sink, recorder) = setup();
        assert!(recorder
            .record_impression(404, 3, "ctx".to_string(), 0.01)
            .await
            .is_err());
        assert_eq!(sink.count(), 0);
    }
}
