//! Budget ledger: two-tier budget state.
//!
//! The durable store holds the authoritative `remaining_budget`. The cache
//! tier holds per-UTC-day spend counters keyed by campaign and date. When the
//! cache tier is absent or unreachable the daily check is skipped and only
//! the total-budget check runs.
//!
//! `record_spend` uses a conditional decrement (`remaining >= cost`), so two
//! requests that both passed `can_afford` cannot drive the balance negative.
//! The loser gets `false` back. The daily counter remains check-then-act and
//! may overshoot its limit by at most one charge per concurrent request.

use adserve_cache::CacheStore;
use adserve_core::types::CampaignId;
use adserve_core::{AdServeError, AdServeResult};
use adserve_store::LedgerStore;
use chrono::{DateTime, Days, NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_MIN_COUNTER_TTL: Duration = Duration::from_secs(60);

/// Cache key of the daily spend counter for one campaign and UTC day.
pub fn daily_counter_key(campaign_id: CampaignId, day: NaiveDate) -> String {
    format!("budget:daily:{}:{}", campaign_id, day.format("%Y-%m-%d"))
}

/// Time left until the next UTC midnight, never less than `floor`.
pub fn ttl_until_next_midnight(now: DateTime<Utc>, floor: Duration) -> Duration {
    let next_midnight = now
        .date_naive()
        .checked_add_days(Days::new(1))
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc());
    let remaining = next_midnight
        .and_then(|midnight| (midnight - now).to_std().ok())
        .unwrap_or(floor);
    remaining.max(floor)
}

pub struct BudgetLedger {
    store: Arc<dyn LedgerStore>,
    cache: Option<Arc<dyn CacheStore>>,
    min_counter_ttl: Duration,
}

impl BudgetLedger {
    pub fn new(store: Arc<dyn LedgerStore>, cache: Option<Arc<dyn CacheStore>>) -> Self {
        Self {
            store,
            cache,
            min_counter_ttl: DEFAULT_MIN_COUNTER_TTL,
        }
    }

    pub fn with_min_counter_ttl(mut self, ttl: Duration) -> Self {
        self.min_counter_ttl = ttl;
        self
    }

    pub fn has_cache(&self) -> bool {
        self.cache.is_some()
    }

    pub async fn can_afford(&self, campaign_id: CampaignId, cost: f64) -> AdServeResult<bool> {
        self.can_afford_at(campaign_id, cost, Utc::now()).await
    }

    /// Whether `cost` fits the remaining total budget and, in cache mode,
    /// the daily limit for the UTC day of `now`.
    pub async fn can_afford_at(
        &self,
        campaign_id: CampaignId,
        cost: f64,
        now: DateTime<Utc>,
    ) -> AdServeResult<bool> {
        validate_cost(cost)?;
        let budget = self
            .store
            .budget(campaign_id)
            .await?
            .ok_or_else(|| AdServeError::not_found(format!("campaign {campaign_id}")))?;

        if budget.remaining_budget <= 0.0 || budget.remaining_budget < cost {
            debug!(
                campaign_id = campaign_id,
                remaining = budget.remaining_budget,
                cost = cost,
                "Total budget cannot cover cost"
            );
            metrics::counter!("budget.rejected", "check" => "total").increment(1);
            return Ok(false);
        }

        let Some(limit) = budget.daily_limit() else {
            return Ok(true);
        };

        let Some(cache) = &self.cache else {
            debug!(campaign_id = campaign_id, "No cache tier, daily check skipped");
            return Ok(true);
        };

        let key = daily_counter_key(campaign_id, now.date_naive());
        match cache.get_counter(&key).await {
            Ok(spent) => {
                let spent = spent.unwrap_or(0.0);
                let affordable = spent + cost <= limit;
                if !affordable {
                    metrics::counter!("budget.rejected", "check" => "daily").increment(1);
                    debug!(
                        campaign_id = campaign_id,
                        spent = spent,
                        limit = limit,
                        cost = cost,
                        "Daily budget cannot cover cost"
                    );
                }
                Ok(affordable)
            }
            Err(e) => {
                metrics::counter!("budget.cache_fallback").increment(1);
                warn!(
                    campaign_id = campaign_id,
                    error = %e,
                    fallback = "durable_only",
                    "Cache tier unreachable, daily check skipped"
                );
                Ok(true)
            }
        }
    }

    pub async fn record_spend(&self, campaign_id: CampaignId, cost: f64) -> AdServeResult<bool> {
        self.record_spend_at(campaign_id, cost, Utc::now()).await
    }

    /// Charge `cost` against the durable balance, then the daily counter.
    /// Returns `false` when the balance no longer covers `cost`.
    pub async fn record_spend_at(
        &self,
        campaign_id: CampaignId,
        cost: f64,
        now: DateTime<Utc>,
    ) -> AdServeResult<bool> {
        validate_cost(cost)?;
        if cost == 0.0 {
            return Ok(true);
        }

        if !self.store.decrement_remaining(campaign_id, cost).await? {
            metrics::counter!("budget.race_lost").increment(1);
            warn!(
                campaign_id = campaign_id,
                cost = cost,
                "Spend rejected, remaining budget no longer covers cost"
            );
            return Ok(false);
        }
        metrics::counter!("budget.spend_recorded").increment(1);

        if let Some(cache) = &self.cache {
            let key = daily_counter_key(campaign_id, now.date_naive());
            let ttl = ttl_until_next_midnight(now, self.min_counter_ttl);
            if let Err(e) = cache.incr_counter(&key, cost, ttl).await {
                metrics::counter!("budget.cache_write_failed").increment(1);
                warn!(
                    campaign_id = campaign_id,
                    cost = cost,
                    error = %e,
                    "Daily counter update failed after durable decrement"
                );
            }
        }
        Ok(true)
    }
}

fn validate_cost(cost: f64) -> AdServeResult<()> {
    if !cost.is_finite() || cost < 0.0 {
        return Err(AdServeError::invalid(format!("cost must be a non-negative amount, got {cost}")));
    }
    Ok(())
}
