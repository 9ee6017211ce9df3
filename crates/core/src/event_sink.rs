//! Delivery sink: trait for mirroring durably-recorded delivery events
//! into downstream pipelines (ClickHouse reporting feed, tests).
//!
//! The recorder accepts an `Arc<dyn DeliverySink>`. Emission must not block:
//! the audit trail in the durable store stays the source of truth.

use crate::types::{DeliveryEvent, EventType};
use parking_lot::Mutex;

pub trait DeliverySink: Send + Sync {
    fn emit(&self, event: &DeliveryEvent);
}

/// No-op sink for deployments without a reporting feed.
pub struct NoOpSink;

impl DeliverySink for NoOpSink {
    fn emit(&self, _event: &DeliveryEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<DeliveryEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DeliveryEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

impl DeliverySink for CaptureSink {
    fn emit(&self, event: &DeliveryEvent) {
        self.events.lock().push(event.clone());
    }
}
