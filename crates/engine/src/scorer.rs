//! Scorer/selector: ranks eligible candidates and picks one.
//!
//! `score = ctr_weight * ctr + headroom_weight * (1 - budget_used_ratio)
//!        + targeting_weight * match_fraction`
//!
//! Ties at the top score are broken uniformly at random with the caller's
//! random source.

use crate::eligibility::Candidate;
use adserve_core::config::ScoringConfig;
use rand::seq::SliceRandom;
use rand::Rng;

/// Scores closer than this are treated as equal.
const SCORE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringWeights {
    pub ctr: f64,
    pub headroom: f64,
    pub targeting: f64,
}

impl ScoringWeights {
    pub const DEFAULT_CTR: f64 = 50.0;
    pub const DEFAULT_HEADROOM: f64 = 20.0;
    pub const DEFAULT_TARGETING: f64 = 30.0;

    /// Rank on targeting alone. With unconstrained candidates every score
    /// ties, which makes selection uniformly random.
    pub fn targeting_only() -> Self {
        Self {
            ctr: 0.0,
            headroom: 0.0,
            targeting: 1.0,
        }
    }
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            ctr: Self::DEFAULT_CTR,
            headroom: Self::DEFAULT_HEADROOM,
            targeting: Self::DEFAULT_TARGETING,
        }
    }
}

impl From<&ScoringConfig> for ScoringWeights {
    fn from(config: &ScoringConfig) -> Self {
        Self {
            ctr: config.ctr_weight,
            headroom: config.headroom_weight,
            targeting: config.targeting_weight,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Scorer {
    weights: ScoringWeights,
}

impl Scorer {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    pub fn score(&self, candidate: &Candidate) -> f64 {
        let campaign = &candidate.campaign;
        self.weights.ctr * campaign.stats.ctr()
            + self.weights.headroom * (1.0 - campaign.budget_used_ratio())
            + self.weights.targeting * candidate.match_fraction
    }

    /// Index of the winning candidate, `None` for an empty pool.
    pub fn select_index<R: Rng + ?Sized>(
        &self,
        candidates: &[Candidate],
        rng: &mut R,
    ) -> Option<usize> {
        let scores: Vec<f64> = candidates.iter().map(|c| self.score(c)).collect();
        let best = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let leaders: Vec<usize> = scores
            .iter()
            .enumerate()
            .filter(|(_, score)| (best - **score).abs() <= SCORE_EPSILON)
            .map(|(index, _)| index)
            .collect();

        leaders.choose(rng).copied()
    }

    pub fn select<'a, R: Rng + ?Sized>(
        &self,
        candidates: &'a [Candidate],
        rng: &mut R,
    ) -> Option<&'a Candidate> {
        self.select_index(candidates, rng)
            .and_then(|index| candidates.get(index))
    }
}
