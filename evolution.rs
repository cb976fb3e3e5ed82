//! The per-generation evolution step.
//!
//! One call takes a population snapshot and produces the next: elites carry
//! over, children are bred from them (with optional family switching and
//! ML-guided remediation), exploration slots inject fresh or CMA-sampled
//! shapes, and the union is re-ranked. Candidates failing validation are
//! dropped silently; champions and per-axis records update monotonically.

use std::collections::BTreeMap;

use tracing::debug;

use crate::bins::normalize;
use crate::cma::{compress_from_bins, expand_to_bins, CmaEs};
use crate::evaluator::evaluate_candidate;
use crate::families::{self, FamilyId};
use crate::features::compute_features;
use crate::map_elites::MapElitesGrid;
use crate::mutation::{
    amplify_strengths, blend_toward, crossover_bins, crossover_params, mutate_bins,
    remediate_weaknesses,
};
use crate::paths::RegimeConfig;
use crate::rng::EngineRng;
use crate::scoring::{candidate_coverage, composite_score, Recommendation};
use crate::types::{
    AxisKey, Candidate, CandidateSource, EngineConfig, EngineEvent, EventKind, PoolType,
    PopulationState,
};

/// Chance a child re-rolls its family when guidance is active.
const FAMILY_SWITCH_CHANCE: f64 = 0.35;
/// Chance a child crosses over with a second elite.
const CROSSOVER_CHANCE: f64 = 0.3;
/// Chance an actionable recommendation reshapes a child.
const GUIDANCE_CHANCE: f64 = 0.65;
/// Chance a child's parent comes from the MAP-Elites grid instead of the
/// elite round-robin, once the grid has occupants.
const GRID_PARENT_CHANCE: f64 = 0.15;
/// Chance an exploration slot draws from the CMA sampler when available.
const CMA_SAMPLE_CHANCE: f64 = 0.5;
/// Baseline mutation intensity applied to every bred child.
const CHILD_MUTATION_INTENSITY: f64 = 0.12;
/// Champion score deltas below this count as a plateau.
const PLATEAU_DELTA: f64 = 0.001;

#[derive(Clone, Debug)]
pub struct GenerationOutcome {
    pub population: PopulationState,
    pub events: Vec<EngineEvent>,
}

/// Advance one population by a single generation.
pub fn evolve_generation(
    prev: &PopulationState,
    cfg: &EngineConfig,
    regime_cfg: &RegimeConfig,
    recommendation: Option<&Recommendation>,
    grid: &MapElitesGrid,
    rng: &mut EngineRng,
) -> GenerationOutcome {
    let mut next = PopulationState {
        regime: prev.regime,
        candidates: Vec::new(),
        champion: prev.champion.clone(),
        metric_champions: prev.metric_champions.clone(),
        generation: prev.generation + 1,
        evaluations: prev.evaluations,
        serial: prev.serial,
        archive_buffer: prev.archive_buffer.clone(),
        cma: prev.cma.clone(),
    };

    let mut union: Vec<Candidate> = Vec::with_capacity(cfg.population_size * 2);

    if prev.candidates.is_empty() {
        bootstrap(&mut next, &mut union, cfg, regime_cfg, recommendation, rng);
    } else {
        breed(
            prev,
            &mut next,
            &mut union,
            cfg,
            regime_cfg,
            recommendation,
            grid,
            rng,
        );
    }

    union.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal));
    union.truncate(cfg.population_size);

    let events = finalize(&mut next, union, cfg);

    GenerationOutcome {
        population: next,
        events,
    }
}

/// Draw an initial population of valid random candidates.
fn bootstrap(
    next: &mut PopulationState,
    union: &mut Vec<Candidate>,
    cfg: &EngineConfig,
    regime_cfg: &RegimeConfig,
    recommendation: Option<&Recommendation>,
    rng: &mut EngineRng,
) {
    let mut attempts = 0;
    let max_attempts = cfg.population_size * 10;
    while union.len() < cfg.population_size && attempts < max_attempts {
        attempts += 1;
        let family = pick_family(recommendation, rng);
        let params = family.sample_params(rng);
        let bins = family.generate_bins(&params, rng);
        if let Some(c) = create_candidate(
            next,
            bins,
            family,
            params,
            CandidateSource::Global,
            cfg,
            regime_cfg,
            rng,
        ) {
            union.push(c);
        }
    }
    debug!(
        regime = %next.regime,
        drawn = union.len(),
        attempts,
        "bootstrapped population"
    );
}

/// Elites + bred children + exploration slots.
#[allow(clippy::too_many_arguments)]
fn breed(
    prev: &PopulationState,
    next: &mut PopulationState,
    union: &mut Vec<Candidate>,
    cfg: &EngineConfig,
    regime_cfg: &RegimeConfig,
    recommendation: Option<&Recommendation>,
    grid: &MapElitesGrid,
    rng: &mut EngineRng,
) {
    let mut sorted: Vec<&Candidate> = prev.candidates.iter().collect();
    sorted.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal));

    let elite_count = ((cfg.population_size as f64 * cfg.elite_fraction) as usize).max(2);
    let elites: Vec<Candidate> = sorted.iter().take(elite_count).map(|c| (*c).clone()).collect();
    union.extend(elites.iter().cloned());

    // Exploration widens when the champion's coverage is weak.
    let champion_coverage = next
        .champion
        .as_ref()
        .map(candidate_coverage)
        .unwrap_or(0.5);
    let rate = (cfg.exploration_rate + (0.58 - champion_coverage) * 0.35).clamp(0.14, 0.42);
    let explore_count = (cfg.population_size as f64 * rate) as usize;
    let num_children = cfg.population_size - explore_count;

    let guided = recommendation.map(|r| r.actionable()).unwrap_or(false);

    for k in 0..num_children {
        let parent: Candidate = if grid.occupied() > 0 && rng.chance(GRID_PARENT_CHANCE) {
            grid.select_parent(rng)
                .cloned()
                .unwrap_or_else(|| elites[k % elites.len()].clone())
        } else {
            elites[k % elites.len()].clone()
        };

        let (family, switched) = match recommendation {
            Some(rec) if rng.chance(FAMILY_SWITCH_CHANCE) => {
                let f = rec.sample_family(rng.uniform());
                (f, f != parent.family_id)
            }
            _ => (parent.family_id, false),
        };

        let mut params = if switched || family != parent.family_id {
            family.sample_params(rng)
        } else {
            family.mutate_params(&parent.family_params, rng)
        };

        let do_crossover = elites.len() >= 2 && rng.chance(CROSSOVER_CHANCE);
        let mate = &elites[(k + 1) % elites.len()];
        if do_crossover && mate.family_id == family {
            params = crossover_params(&params, &mate.family_params, family, rng);
        }

        // Custom shapes have no generator; their children start from the
        // parent's own density.
        let mut bins = if family == FamilyId::Custom {
            parent.bins.clone()
        } else {
            family.generate_bins(&params, rng)
        };

        if do_crossover {
            bins = crossover_bins(&bins, &mate.bins, rng);
        }

        mutate_bins(&mut bins, CHILD_MUTATION_INTENSITY, rng);

        if switched {
            blend_toward(&mut bins, &parent.bins, 0.3);
        }

        if let Some(rec) = recommendation.filter(|_| guided && rng.chance(GUIDANCE_CHANCE)) {
            blend_toward(&mut bins, &parent.bins, 0.35);
            remediate_weaknesses(
                &mut bins,
                &rec.weakest_axes,
                0.08 + 0.14 * rec.confidence,
                rng,
            );
            amplify_strengths(
                &mut bins,
                &rec.weakest_axes,
                0.03 + 0.05 * rec.confidence,
                rng,
            );
        }

        if let Some(c) = create_candidate(
            next,
            bins,
            family,
            params,
            CandidateSource::Global,
            cfg,
            regime_cfg,
            rng,
        ) {
            union.push(c);
        }
    }

    // Exploration: fresh shapes, some resampled from the adapted covariance.
    for _ in 0..explore_count {
        let cma_sample = match &next.cma {
            Some(cma) if cfg.cma_enabled && rng.chance(CMA_SAMPLE_CHANCE) => {
                Some(cma.sample_one(rng))
            }
            _ => None,
        };
        let (bins, family, params) = match cma_sample {
            Some(sample) => (expand_to_bins(&sample), FamilyId::Custom, BTreeMap::new()),
            None => {
                let family = pick_family(recommendation, rng);
                let params = family.sample_params(rng);
                let bins = family.generate_bins(&params, rng);
                (bins, family, params)
            }
        };
        if let Some(c) = create_candidate(
            next,
            bins,
            family,
            params,
            CandidateSource::Experiment,
            cfg,
            regime_cfg,
            rng,
        ) {
            union.push(c);
        }
    }
}

/// Rank, record champions, refresh the CMA state, emit events.
fn finalize(
    next: &mut PopulationState,
    union: Vec<Candidate>,
    cfg: &EngineConfig,
) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    let regime = next.regime;
    let generation = next.generation;
    let mut event = |kind: EventKind, detail: String| {
        events.push(EngineEvent {
            kind,
            regime,
            generation,
            detail,
        });
    };

    next.candidates = union;

    if let Some(best) = next.candidates.first().cloned() {
        let previous_score = next.champion.as_ref().map(|c| c.score);
        let improved = previous_score.map(|s| best.score < s).unwrap_or(true);
        if improved {
            let frontier_shift = next
                .champion
                .as_ref()
                .map(|old| old.family_id != best.family_id)
                .unwrap_or(false);
            event(
                EventKind::ChampionReplaced,
                format!(
                    "champion {} scored {:.4} (was {})",
                    best.id,
                    best.score,
                    previous_score
                        .map(|s| format!("{s:.4}"))
                        .unwrap_or_else(|| "none".to_string()),
                ),
            );
            if frontier_shift {
                event(
                    EventKind::FamilyFrontierEntry,
                    format!("{} took the frontier", best.family_id),
                );
            }
            next.champion = Some(best);
        } else if let Some(prev_score) = previous_score {
            let best_score = next.candidates[0].score;
            if (best_score - prev_score).abs() < PLATEAU_DELTA {
                event(
                    EventKind::ConvergencePlateau,
                    format!("best score pinned at {prev_score:.4}"),
                );
            }
        }
    }

    // Per-axis records are monotone: a challenger only lands by beating the
    // incumbent on that axis's raw metric.
    for candidate in next.candidates.clone() {
        for key in AxisKey::ALL {
            match next.metric_champions.get(&key) {
                Some(incumbent) if !key.improves(&candidate, incumbent) => {}
                _ => {
                    next.metric_champions.insert(key, candidate.clone());
                }
            }
        }
    }

    // Feed the covariance sampler the reduced coordinates of the new front.
    if cfg.cma_enabled && !next.candidates.is_empty() {
        let cma = next.cma.get_or_insert_with(CmaEs::for_bins);
        let take = cma.lambda().min(next.candidates.len());
        let ranked: Vec<Vec<f64>> = next.candidates[..take]
            .iter()
            .map(|c| compress_from_bins(&c.bins, cma.dim()))
            .collect();
        cma.update(&ranked);
    }

    if let Some(dominant) = dominant_family(&next.candidates) {
        event(
            EventKind::FamilyRegimeDominance,
            format!("{} dominates {}", dominant.0, regime),
        );
    }

    event(
        EventKind::GenerationComplete,
        format!(
            "generation {} with {} candidates",
            generation,
            next.candidates.len()
        ),
    );

    events
}

fn dominant_family(candidates: &[Candidate]) -> Option<(FamilyId, usize)> {
    let mut counts: BTreeMap<FamilyId, usize> = BTreeMap::new();
    for c in candidates {
        *counts.entry(c.family_id).or_default() += 1;
    }
    counts.into_iter().max_by_key(|(_, n)| *n)
}

fn pick_family(recommendation: Option<&Recommendation>, rng: &mut EngineRng) -> FamilyId {
    match recommendation {
        Some(rec) => rec.sample_family(rng.uniform()),
        None => FamilyId::GENERATIVE[rng.index(FamilyId::GENERATIVE.len())],
    }
}

/// Validate, evaluate, and assemble a candidate. Returns `None` when
/// validation rejects the shape or parameters.
#[allow(clippy::too_many_arguments)]
fn create_candidate(
    next: &mut PopulationState,
    mut bins: Vec<f64>,
    family: FamilyId,
    params: BTreeMap<String, f64>,
    source: CandidateSource,
    cfg: &EngineConfig,
    regime_cfg: &RegimeConfig,
    rng: &mut EngineRng,
) -> Option<Candidate> {
    normalize(&mut bins);
    if !families::validate(family, &params, &bins) {
        return None;
    }

    let evaluation = evaluate_candidate(&bins, regime_cfg, cfg, rng);
    next.evaluations += 1;
    next.serial += 1;

    let features = compute_features(&bins);
    let axes = crate::features::normalize_metrics(&evaluation.metrics, evaluation.stability);
    let score = composite_score(
        &evaluation.metrics,
        evaluation.stability,
        &axes,
        cfg.scoring_mode,
    );
    if !score.is_finite() {
        return None;
    }

    Some(Candidate {
        id: format!("{}-g{}-{}", next.regime, next.generation, next.serial),
        generation: next.generation,
        regime: next.regime,
        bins,
        family_id: family,
        family_params: params,
        metrics: evaluation.metrics,
        features,
        stability: evaluation.stability,
        score,
        pool_type: PoolType::TwoAsset,
        asset_count: 2,
        adaptive_profile: None,
        source,
    })
}
