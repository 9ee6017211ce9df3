//! Serving orchestrator.
//!
//! One request walks RESOLVE_CONTEXT → FILTER → SELECT → CHARGE_CHECK →
//! RECORD → RESPOND. An unaffordable pick is dropped from the pool and
//! selection reruns until the pool is empty. Recording and charging run on
//! a spawned task so they finish even when the client goes away; their
//! failures are logged and never fail the response.

use crate::eligibility::{Candidate, EligibilityFilter};
use crate::ledger::BudgetLedger;
use crate::recorder::DeliveryRecorder;
use crate::scorer::{Scorer, ScoringWeights};
use adserve_cache::CacheStore;
use adserve_core::types::{Campaign, CampaignId, Creative, DeliveryEvent, Placement, PlacementId};
use adserve_core::{
    AdServeError, AdServeResult, AppConfig, DeliverySink, GeoResolver, NoGeoResolver, NoOpSink,
    RequestMeta, VisitorContext,
};
use adserve_store::{AuditSink, CatalogStore, DurableStore, LedgerStore};
use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Collaborators the engine is wired from.
#[derive(Clone)]
pub struct EngineParts {
    pub catalog: Arc<dyn CatalogStore>,
    pub ledger_store: Arc<dyn LedgerStore>,
    pub audit: Arc<dyn AuditSink>,
    pub cache: Option<Arc<dyn CacheStore>>,
    pub sink: Arc<dyn DeliverySink>,
    pub geo: Arc<dyn GeoResolver>,
}

impl EngineParts {
    /// One backend for catalog, ledger and audit; no cache tier, no
    /// analytics mirror, no geo database.
    pub fn from_store<S: DurableStore + 'static>(store: Arc<S>) -> Self {
        Self {
            catalog: store.clone(),
            ledger_store: store.clone(),
            audit: store,
            cache: None,
            sink: Arc::new(NoOpSink),
            geo: Arc::new(NoGeoResolver),
        }
    }

    pub fn with_cache(mut self, cache: Option<Arc<dyn CacheStore>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn DeliverySink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_geo(mut self, geo: Arc<dyn GeoResolver>) -> Self {
        self.geo = geo;
        self
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub weights: ScoringWeights,
    /// Base of generated click-through URLs.
    pub click_base_url: String,
    pub daily_counter_min_ttl: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            weights: ScoringWeights::from(&config.scoring),
            click_base_url: config.api.public_base_url.clone(),
            daily_counter_min_ttl: Duration::from_secs(config.budget.daily_counter_min_ttl_secs),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// One serve call: placement plus the raw request facts.
#[derive(Debug, Clone, Default)]
pub struct ServeRequest {
    pub placement_id: PlacementId,
    pub meta: RequestMeta,
    /// Client-supplied context that overrides the derived visitor context.
    pub overrides: HashMap<String, String>,
}

impl ServeRequest {
    pub fn new(placement_id: PlacementId) -> Self {
        Self {
            placement_id,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServedAd {
    pub campaign_id: CampaignId,
    pub impression_id: Uuid,
    pub creative: Creative,
    pub placement: Placement,
    pub click_url: String,
    pub cost: f64,
}

#[derive(Debug, Clone)]
pub enum ServeOutcome {
    Served(ServedAd),
    NoEligibleAd,
}

/// Result of the read-only eligibility query.
#[derive(Debug, Clone)]
pub struct EligibleAd {
    pub campaign_id: CampaignId,
    pub creative: Creative,
    pub placement: Placement,
    pub score: f64,
    pub cost: f64,
}

#[derive(Debug, Clone)]
pub struct ClickOutcome {
    pub destination: Url,
    /// Whether the click made it into the audit trail.
    pub recorded: bool,
}

pub struct ServingEngine {
    catalog: Arc<dyn CatalogStore>,
    filter: EligibilityFilter,
    scorer: Scorer,
    ledger: Arc<BudgetLedger>,
    recorder: Arc<DeliveryRecorder>,
    geo: Arc<dyn GeoResolver>,
    click_base_url: String,
    rng: Mutex<StdRng>,
}

impl ServingEngine {
    pub fn new(parts: EngineParts, settings: EngineSettings) -> Self {
        Self::with_rng(parts, settings, StdRng::from_entropy())
    }

    /// Engine with an explicit random source for tie-breaking.
    pub fn with_rng(parts: EngineParts, settings: EngineSettings, rng: StdRng) -> Self {
        let ledger = BudgetLedger::new(parts.ledger_store, parts.cache)
            .with_min_counter_ttl(settings.daily_counter_min_ttl);
        info!(
            cache_tier = ledger.has_cache(),
            ctr_weight = settings.weights.ctr,
            headroom_weight = settings.weights.headroom,
            targeting_weight = settings.weights.targeting,
            "Serving engine initialized"
        );
        Self {
            filter: EligibilityFilter::new(parts.catalog.clone()),
            catalog: parts.catalog,
            scorer: Scorer::new(settings.weights),
            ledger: Arc::new(ledger),
            recorder: Arc::new(DeliveryRecorder::new(parts.audit, parts.sink)),
            geo: parts.geo,
            click_base_url: settings.click_base_url.trim_end_matches('/').to_string(),
            rng: Mutex::new(rng),
        }
    }

    pub fn ledger(&self) -> &BudgetLedger {
        &self.ledger
    }

    pub fn recorder(&self) -> &DeliveryRecorder {
        &self.recorder
    }

    fn resolve_context(&self, meta: &RequestMeta, overrides: &HashMap<String, String>) -> VisitorContext {
        let mut ctx = VisitorContext::resolve(meta, self.geo.as_ref(), Utc::now());
        ctx.apply_overrides(overrides);
        ctx
    }

    /// Serve one ad for the placement, recording the impression and
    /// charging its cost.
    pub async fn serve(&self, request: &ServeRequest) -> AdServeResult<ServeOutcome> {
        let started = Instant::now();
        metrics::counter!("serve.requests").increment(1);

        let ctx = self.resolve_context(&request.meta, &request.overrides);
        let Some((placement, candidate)) = self.pick(request.placement_id, &ctx).await? else {
            metrics::counter!("serve.no_ad").increment(1);
            debug!(placement_id = request.placement_id, "No eligible ad");
            return Ok(ServeOutcome::NoEligibleAd);
        };

        let campaign_id = candidate.campaign.id;
        let price = candidate.campaign.cost_per_impression;
        let event = DeliveryRecorder::impression_event(campaign_id, placement.id, ctx.digest(), price);
        let impression_id = event.id;

        let cost = self.commit_impression(event).await;

        let served = ServedAd {
            campaign_id,
            impression_id,
            click_url: self.click_url(campaign_id, impression_id),
            creative: candidate.creative,
            placement,
            cost,
        };
        metrics::histogram!("serve.latency_us").record(started.elapsed().as_micros() as f64);
        Ok(ServeOutcome::Served(served))
    }

    /// The ad `serve` would pick right now, without recording or charging.
    pub async fn eligible_ad(&self, request: &ServeRequest) -> AdServeResult<Option<EligibleAd>> {
        let ctx = self.resolve_context(&request.meta, &request.overrides);
        Ok(self
            .pick(request.placement_id, &ctx)
            .await?
            .map(|(placement, candidate)| EligibleAd {
                campaign_id: candidate.campaign.id,
                score: self.scorer.score(&candidate),
                cost: candidate.campaign.cost_per_impression,
                creative: candidate.creative,
                placement,
            }))
    }

    /// FILTER → SELECT → CHARGE_CHECK, retrying selection on the shrinking
    /// pool until an affordable candidate is found or none remain.
    async fn pick(
        &self,
        placement_id: PlacementId,
        ctx: &VisitorContext,
    ) -> AdServeResult<Option<(Placement, Candidate)>> {
        let placement = self
            .catalog
            .placement(placement_id)
            .await?
            .ok_or_else(|| AdServeError::not_found(format!("placement {placement_id}")))?;
        if !placement.is_active() {
            debug!(placement_id = placement_id, "Placement inactive");
            return Ok(None);
        }

        let mut pool = self.filter.eligible_candidates(placement_id, ctx).await?;
        loop {
            let index = {
                let mut rng = self.rng.lock();
                self.scorer.select_index(&pool, &mut *rng)
            };
            let Some(index) = index else {
                return Ok(None);
            };
            let candidate = pool.swap_remove(index);
            let campaign_id = candidate.campaign.id;

            match self
                .ledger
                .can_afford_at(campaign_id, candidate.campaign.cost_per_impression, ctx.now)
                .await
            {
                Ok(true) => return Ok(Some((placement, candidate))),
                Ok(false) => {
                    debug!(campaign_id = campaign_id, remaining = pool.len(), "Unaffordable, reselecting");
                }
                Err(AdServeError::NotFound(_)) => {
                    warn!(campaign_id = campaign_id, "Campaign vanished between filter and charge check");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// RECORD: charge first, then write the audit row with the amount the
    /// ledger actually took. Runs detached from the caller and is awaited;
    /// failures are logged only. Returns the cost charged.
    async fn commit_impression(&self, mut event: DeliveryEvent) -> f64 {
        let recorder = self.recorder.clone();
        let ledger = self.ledger.clone();
        let event_id = event.id;

        let task = tokio::spawn(async move {
            let charged = match ledger.record_spend(event.campaign_id, event.cost).await {
                Ok(true) => true,
                Ok(false) => {
                    warn!(event_id = %event.id, "Impression not charged, recording at zero cost");
                    false
                }
                Err(e) => {
                    warn!(event_id = %event.id, error = %e, "Impression charge failed, recording at zero cost");
                    false
                }
            };
            if !charged {
                event.cost = 0.0;
            }
            recorder.record(&event).await?;
            Ok::<_, AdServeError>(event.cost)
        });

        match task.await {
            Ok(Ok(cost)) => cost,
            Ok(Err(e)) => {
                warn!(event_id = %event_id, error = %e, "Impression accounting failed");
                0.0
            }
            Err(e) => {
                warn!(event_id = %event_id, error = %e, "Impression accounting task aborted");
                0.0
            }
        }
    }

    fn click_url(&self, campaign_id: CampaignId, impression_id: Uuid) -> String {
        format!(
            "{}/v1/track?ad_id={}&impression_id={}&type=click",
            self.click_base_url, campaign_id, impression_id
        )
    }

    async fn campaign(&self, campaign_id: CampaignId) -> AdServeResult<Campaign> {
        self.catalog
            .campaign(campaign_id)
            .await?
            .ok_or_else(|| AdServeError::not_found(format!("campaign {campaign_id}")))
    }

    /// Resolve the click destination and account for the click. The
    /// destination is returned even when accounting fails.
    pub async fn track_click(
        &self,
        campaign_id: CampaignId,
        impression_id: Option<Uuid>,
        meta: &RequestMeta,
    ) -> AdServeResult<ClickOutcome> {
        let campaign = self.campaign(campaign_id).await?;
        let destination = click_destination(&campaign, impression_id)?;

        let Some(impression_id) = impression_id else {
            warn!(campaign_id = campaign_id, "Click without impression id, redirect only");
            return Ok(ClickOutcome {
                destination,
                recorded: false,
            });
        };

        let digest = self.resolve_context(meta, &HashMap::new()).digest();
        let recorder = self.recorder.clone();
        let ledger = self.ledger.clone();
        let cpc = campaign.cost_per_click;
        let task = tokio::spawn(async move {
            account_click(&recorder, &ledger, campaign_id, impression_id, digest, cpc).await
        });

        let recorded = match task.await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(
                    campaign_id = campaign_id,
                    impression_id = %impression_id,
                    error = %e,
                    "Click not recorded"
                );
                false
            }
            Err(e) => {
                warn!(impression_id = %impression_id, error = %e, "Click accounting task aborted");
                false
            }
        };
        Ok(ClickOutcome {
            destination,
            recorded,
        })
    }

    /// Record a conversion against a prior impression. Conversions are free.
    pub async fn track_conversion(
        &self,
        campaign_id: Option<CampaignId>,
        impression_id: Uuid,
        meta: &RequestMeta,
    ) -> AdServeResult<DeliveryEvent> {
        let digest = self.resolve_context(meta, &HashMap::new()).digest();
        let recorder = self.recorder.clone();
        let task = tokio::spawn(async move {
            let impression = recorder.impression(impression_id).await?;
            ensure_same_campaign(campaign_id, &impression)?;
            recorder.record_conversion(impression_id, digest).await
        });
        task.await
            .map_err(|e| AdServeError::Internal(anyhow::Error::from(e)))?
    }

    /// Acknowledge an impression beacon. Impressions are written when the ad
    /// is served, so this only confirms the id refers to that serve.
    pub async fn track_impression(
        &self,
        campaign_id: Option<CampaignId>,
        impression_id: Uuid,
    ) -> AdServeResult<DeliveryEvent> {
        let impression = self.recorder.impression(impression_id).await?;
        ensure_same_campaign(campaign_id, &impression)?;
        Ok(impression)
    }
}

fn ensure_same_campaign(campaign_id: Option<CampaignId>, impression: &DeliveryEvent) -> AdServeResult<()> {
    match campaign_id {
        Some(id) if id != impression.campaign_id => Err(AdServeError::invalid(format!(
            "impression {} does not belong to campaign {id}",
            impression.id
        ))),
        _ => Ok(()),
    }
}

async fn account_click(
    recorder: &DeliveryRecorder,
    ledger: &BudgetLedger,
    campaign_id: CampaignId,
    impression_id: Uuid,
    digest: String,
    cpc: f64,
) -> AdServeResult<()> {
    let impression = recorder.impression(impression_id).await?;
    ensure_same_campaign(Some(campaign_id), &impression)?;

    // An unaffordable click is still audited, just not billed.
    let billable = cpc > 0.0 && ledger.can_afford(campaign_id, cpc).await?;
    let charged = billable
        && match ledger.record_spend(campaign_id, cpc).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(campaign_id = campaign_id, impression_id = %impression_id, "Click not charged, recording at zero cost");
                false
            }
            Err(e) => {
                warn!(campaign_id = campaign_id, impression_id = %impression_id, error = %e, "Click charge failed, recording at zero cost");
                false
            }
        };
    let cost = if charged { cpc } else { 0.0 };
    recorder.record_click(impression_id, digest, cost).await?;
    Ok(())
}

/// Campaign target URL with tracking parameters appended.
fn click_destination(campaign: &Campaign, impression_id: Option<Uuid>) -> AdServeResult<Url> {
    let mut url = Url::parse(campaign.target_url.trim()).map_err(|e| {
        AdServeError::not_found(format!(
            "destination for campaign {}: {e}",
            campaign.id
        ))
    })?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("utm_source", "adserve")
            .append_pair("utm_medium", "display")
            .append_pair("utm_campaign", &campaign.id.to_string());
        if let Some(id) = impression_id {
            query.append_pair("ad_click_id", &id.to_string());
        }
    }
    Ok(url)
}
