//! Eligibility filter: narrows the campaigns linked to a placement to those
//! that may be shown to this visitor right now.

use adserve_core::types::{Campaign, CampaignStatus, CandidateRecord, Creative, PlacementId};
use adserve_core::{AdServeResult, VisitorContext};
use adserve_store::CatalogStore;
use std::sync::Arc;
use tracing::{debug, warn};

/// A campaign that passed every eligibility check, with its parsed creative.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub campaign: Campaign,
    pub creative: Creative,
    pub match_fraction: f64,
}

pub struct EligibilityFilter {
    catalog: Arc<dyn CatalogStore>,
}

impl EligibilityFilter {
    pub fn new(catalog: Arc<dyn CatalogStore>) -> Self {
        Self { catalog }
    }

    /// Candidates for the placement. An empty list is a normal outcome.
    pub async fn eligible_candidates(
        &self,
        placement_id: PlacementId,
        ctx: &VisitorContext,
    ) -> AdServeResult<Vec<Candidate>> {
        let records = self.catalog.candidates_for_placement(placement_id).await?;
        let linked = records.len();

        let candidates: Vec<Candidate> = records
            .into_iter()
            .filter_map(|record| qualify(record, ctx))
            .collect();

        debug!(
            placement_id = placement_id,
            linked = linked,
            eligible = candidates.len(),
            "Eligibility pass complete"
        );
        Ok(candidates)
    }
}

fn qualify(record: CandidateRecord, ctx: &VisitorContext) -> Option<Candidate> {
    let campaign = record.campaign;

    if !record.link_active
        || campaign.status != CampaignStatus::Approved
        || !campaign.is_within_window(ctx.now)
        || campaign.is_exhausted()
    {
        return None;
    }

    let targeting = campaign.targeting.matches(ctx);
    if !targeting.eligible {
        return None;
    }

    let creative = match Creative::parse(&campaign.creative_payload) {
        Ok(creative) => creative,
        Err(e) => {
            metrics::counter!("eligibility.malformed_creative").increment(1);
            warn!(campaign_id = campaign.id, error = %e, "Skipping campaign with malformed creative");
            return None;
        }
    };

    Some(Candidate {
        campaign,
        creative,
        match_fraction: targeting.fraction,
    })
}
