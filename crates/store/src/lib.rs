#![warn(clippy::unwrap_used)]

//! Storage seams of the serving engine: the read-only catalog, the durable
//! budget ledger and the append-only audit trail.

pub mod memory;
pub mod postgres;

pub use memory::{CatalogSeed, MemoryStore};
pub use postgres::PgStore;

use adserve_core::types::{
    Campaign, CampaignId, CandidateRecord, DeliveryEvent, Placement, PlacementId,
};
use adserve_core::AdServeResult;
use async_trait::async_trait;
use uuid::Uuid;

/// Read-only view of campaigns, placements and their linkage.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn placement(&self, id: PlacementId) -> AdServeResult<Option<Placement>>;

    async fn campaign(&self, id: CampaignId) -> AdServeResult<Option<Campaign>>;

    /// Every campaign linked to the placement, with its linkage status.
    async fn candidates_for_placement(
        &self,
        id: PlacementId,
    ) -> AdServeResult<Vec<CandidateRecord>>;
}

/// Authoritative budget state of one campaign.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetSnapshot {
    pub total_budget: f64,
    pub remaining_budget: f64,
    pub daily_budget: Option<f64>,
}

impl BudgetSnapshot {
    /// Daily limit, ignoring non-positive values.
    pub fn daily_limit(&self) -> Option<f64> {
        self.daily_budget.filter(|limit| *limit > 0.0)
    }
}

/// Durable tier of the budget ledger.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn budget(&self, id: CampaignId) -> AdServeResult<Option<BudgetSnapshot>>;

    /// Atomic conditional decrement: subtracts `cost` only while
    /// `remaining_budget >= cost`. Returns whether the row changed.
    async fn decrement_remaining(&self, id: CampaignId, cost: f64) -> AdServeResult<bool>;
}

/// Append-only delivery event storage.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist the event and bump the campaign's delivery counters.
    async fn append(&self, event: &DeliveryEvent) -> AdServeResult<()>;

    async fn event(&self, id: Uuid) -> AdServeResult<Option<DeliveryEvent>>;
}

/// A single backend serving all three roles.
pub trait DurableStore: CatalogStore + LedgerStore + AuditSink {}

impl<T: CatalogStore + LedgerStore + AuditSink> DurableStore for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daily_limit_ignores_non_positive() {
        let snapshot = |daily_budget| BudgetSnapshot {
            total_budget: 10.0,
            remaining_budget: 10.0,
            daily_budget,
        };
        assert_eq!(snapshot(Some(2.5)).daily_limit(), Some(2.5));
        assert_eq!(snapshot(Some(0.0)).daily_limit(), None);
        assert_eq!(snapshot(Some(-1.0)).daily_limit(), None);
        assert_eq!(snapshot(None).daily_limit(), None);
    }
}
