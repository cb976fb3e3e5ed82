//! Composite scoring and the ML recommender.
//!
//! The score is a fixed-weight sum over raw metrics, optionally enhanced
//! with spider-coverage terms that reward well-rounded shapes (lower is
//! better throughout). The recommender inspects the elite slice of a pool,
//! names the three weakest axes, and weights families by how much they lift
//! those axes, how well they cover overall, and how under-represented they
//! are.

use std::collections::BTreeMap;

use crate::families::FamilyId;
use crate::features::{normalize_metrics, spider_coverage, NormalizedAxes};
use crate::types::{AxisKey, Candidate, Metrics, ScoringMode};

/// Normalized spider axes of an evaluated candidate.
pub fn candidate_axes(c: &Candidate) -> NormalizedAxes {
    normalize_metrics(&c.metrics, c.stability)
}

/// Spider coverage of an evaluated candidate.
pub fn candidate_coverage(c: &Candidate) -> f64 {
    spider_coverage(&candidate_axes(c))
}

/// Composite score, lower is better.
pub fn composite_score(
    m: &Metrics,
    stability: f64,
    axes: &NormalizedAxes,
    mode: ScoringMode,
) -> f64 {
    let mut score = -1.6 * m.total_fees
        + 1.0 * m.total_slippage
        + 1.3 * m.arb_leakage
        - 2.2 * m.liquidity_utilization
        - 4.2 * (m.lp_value_vs_hodl - 1.0)
        + 1.9 * m.max_drawdown
        + 0.9 * m.volatility_of_returns
        + 1.6 * stability;

    if mode == ScoringMode::SpiderCoverage {
        let coverage = spider_coverage(axes);
        let weakest = axes.min();
        let imbalance = axes.std();
        let specialist_edge = (axes.max() - axes.mean()).max(0.0);
        score += -6.5 * coverage
            + 5.5 * (1.0 - weakest)
            + 3.0 * imbalance
            - 1.4 * specialist_edge;
    }

    score
}

// ─── Recommender ──────────────────────────────────────────────────────────────

/// Minimum pool size before the recommender speaks up.
const MIN_POOL: usize = 12;
/// Minimum elite-slice size for axis statistics to mean anything.
const MIN_ELITE: usize = 4;
/// Floor applied to family weights before renormalization.
const MIN_FAMILY_WEIGHT: f64 = 0.02;

#[derive(Clone, Debug)]
pub struct Recommendation {
    /// The three lowest-mean axes among the elite slice.
    pub weakest_axes: Vec<AxisKey>,
    /// Normalized sampling weights over the generative families.
    pub family_weights: BTreeMap<FamilyId, f64>,
    /// Top two families by weight.
    pub prioritized_families: Vec<FamilyId>,
    /// Fraction of the pool retained in the elite slice.
    pub confidence: f64,
    /// Mean spider coverage of the elite slice.
    pub target_coverage: f64,
}

impl Recommendation {
    /// Guidance is actionable once confidence clears this bar and there is
    /// something to remediate.
    pub fn actionable(&self) -> bool {
        self.confidence >= 0.2 && !self.weakest_axes.is_empty()
    }

    /// Sample a family according to the recommended weights.
    pub fn sample_family(&self, u: f64) -> FamilyId {
        let mut acc = 0.0;
        for (&family, &w) in &self.family_weights {
            acc += w;
            if u < acc {
                return family;
            }
        }
        FamilyId::PiecewiseBands
    }
}

/// Analyze a pool and recommend where to push the next generation.
pub fn recommend(pool: &[Candidate]) -> Option<Recommendation> {
    if pool.len() < MIN_POOL {
        return None;
    }

    let mut ranked: Vec<(&Candidate, NormalizedAxes, f64)> = pool
        .iter()
        .map(|c| {
            let axes = candidate_axes(c);
            let cov = spider_coverage(&axes);
            (c, axes, cov)
        })
        .collect();
    ranked.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

    let elite_len = ((pool.len() as f64 * 0.2).floor() as usize).max(1);
    let elite = &ranked[..elite_len];
    if elite.len() < MIN_ELITE {
        return None;
    }

    // Per-axis means over the elite slice; the three lowest are the weak spots.
    let mut axis_means: Vec<(AxisKey, f64)> = AxisKey::ALL
        .iter()
        .map(|&key| {
            let mean =
                elite.iter().map(|(_, axes, _)| axes.get(key)).sum::<f64>() / elite.len() as f64;
            (key, mean)
        })
        .collect();
    axis_means.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    let weakest_axes: Vec<AxisKey> = axis_means.iter().take(3).map(|(k, _)| *k).collect();

    // Family statistics: weak-axis lift and coverage from the elite slice,
    // presence from the whole pool.
    let mut weights = BTreeMap::new();
    let mut lifts = BTreeMap::new();
    for &family in &FamilyId::GENERATIVE {
        let members: Vec<&(&Candidate, NormalizedAxes, f64)> = elite
            .iter()
            .filter(|(c, _, _)| c.family_id == family)
            .collect();
        let lift = if members.is_empty() {
            0.0
        } else {
            members
                .iter()
                .map(|(_, axes, _)| {
                    weakest_axes.iter().map(|&k| axes.get(k)).sum::<f64>()
                        / weakest_axes.len() as f64
                })
                .sum::<f64>()
                / members.len() as f64
        };
        lifts.insert(family, lift);
    }
    let max_lift = lifts.values().copied().fold(0.0, f64::max).max(1e-12);

    for &family in &FamilyId::GENERATIVE {
        let members: Vec<&(&Candidate, NormalizedAxes, f64)> = elite
            .iter()
            .filter(|(c, _, _)| c.family_id == family)
            .collect();
        let avg_coverage = if members.is_empty() {
            0.0
        } else {
            members.iter().map(|(_, _, cov)| cov).sum::<f64>() / members.len() as f64
        };
        let presence = pool.iter().filter(|c| c.family_id == family).count() as f64
            / pool.len() as f64;

        let weight = 0.52 * (lifts[&family] / max_lift)
            + 0.33 * avg_coverage
            + 0.15 * (1.0 - presence);
        weights.insert(family, weight);
    }
    floor_normalize(&mut weights, MIN_FAMILY_WEIGHT);

    let mut by_weight: Vec<(FamilyId, f64)> = weights.iter().map(|(&f, &w)| (f, w)).collect();
    by_weight.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let prioritized_families = by_weight.iter().take(2).map(|(f, _)| *f).collect();

    let target_coverage =
        elite.iter().map(|(_, _, cov)| cov).sum::<f64>() / elite.len() as f64;

    Some(Recommendation {
        weakest_axes,
        family_weights: weights,
        prioritized_families,
        confidence: elite.len() as f64 / pool.len() as f64,
        target_coverage,
    })
}

/// Floor each weight, then renormalize so the total is exactly 1.
fn floor_normalize(weights: &mut BTreeMap<FamilyId, f64>, min_weight: f64) {
    let total: f64 = weights.values().sum();
    if total <= 0.0 {
        let uniform = 1.0 / weights.len().max(1) as f64;
        weights.values_mut().for_each(|w| *w = uniform);
        return;
    }
    weights.values_mut().for_each(|w| *w = (*w / total).max(min_weight));
    let total: f64 = weights.values().sum();
    weights.values_mut().for_each(|w| *w /= total);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScoringMode;

    fn metrics(fees: f64, util: f64, lp: f64) -> Metrics {
        Metrics {
            total_fees: fees,
            total_slippage: 0.02,
            arb_leakage: 1.0,
            liquidity_utilization: util,
            lp_value_vs_hodl: lp,
            max_drawdown: 0.1,
            volatility_of_returns: 0.02,
        }
    }

    #[test]
    fn better_metrics_score_lower() {
        let good = metrics(20.0, 0.8, 1.05);
        let bad = metrics(2.0, 0.2, 0.85);
        let axes_good = normalize_metrics(&good, 0.05);
        let axes_bad = normalize_metrics(&bad, 0.3);
        for mode in [ScoringMode::SpiderCoverage, ScoringMode::Basic] {
            let sg = composite_score(&good, 0.05, &axes_good, mode);
            let sb = composite_score(&bad, 0.3, &axes_bad, mode);
            assert!(sg < sb, "{mode:?}: {sg} !< {sb}");
        }
    }

    #[test]
    fn family_weights_sum_to_one() {
        let mut weights: BTreeMap<FamilyId, f64> = FamilyId::GENERATIVE
            .iter()
            .map(|&f| (f, 0.5))
            .collect();
        weights.insert(FamilyId::PiecewiseBands, 3.0);
        floor_normalize(&mut weights, 0.02);
        let sum: f64 = weights.values().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert!(weights.values().all(|&w| w >= 0.019));
    }
}
