//! Regime mapper: off-lattice exploration of regime space.
//!
//! A grid of regime parameter vectors is evolved point by point (short
//! evolutionary runs with plateau-based early stopping); queries between
//! lattice points blend the stored champions by inverse-distance k-NN in
//! normalized regime coordinates.

use serde::{Deserialize, Serialize};

use crate::bins::normalize;
use crate::evolution::evolve_generation;
use crate::features::compute_features;
use crate::map_elites::MapElitesGrid;
use crate::paths::RegimeConfig;
use crate::rng::EngineRng;
use crate::types::{EngineConfig, Features, PopulationState, Regime};

pub const VOLATILITY_BOUNDS: (f64, f64) = (0.2, 1.2);
pub const JUMP_INTENSITY_BOUNDS: (f64, f64) = (0.0, 8.0);
pub const JUMP_MEAN_BOUNDS: (f64, f64) = (-0.08, 0.0);
pub const JUMP_STD_BOUNDS: (f64, f64) = (0.02, 0.2);
pub const MEAN_REVERSION_BOUNDS: (f64, f64) = (0.0, 2.0);
pub const ARB_RESPONSIVENESS_BOUNDS: (f64, f64) = (0.05, 1.0);

/// Per-point evolution budget.
pub const MAX_GENERATIONS: u64 = 10;
/// Champion improvement below this counts toward the plateau.
pub const CONVERGENCE_THRESHOLD: f64 = 0.002;
/// Consecutive plateau generations before stopping.
pub const PATIENCE: u32 = 3;

/// Default number of interpolation neighbors.
pub const DEFAULT_K: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegimeVector {
    pub volatility: f64,
    pub jump_intensity: f64,
    pub jump_mean: f64,
    pub jump_std: f64,
    pub mean_reversion: f64,
    pub arb_responsiveness: f64,
}

impl RegimeVector {
    pub fn to_config(&self) -> RegimeConfig {
        RegimeConfig {
            volatility: self.volatility,
            drift: 0.0,
            jump_intensity: self.jump_intensity,
            jump_mean: self.jump_mean,
            jump_std: self.jump_std,
            mean_reversion: self.mean_reversion,
            anchor: 0.0,
            arb_responsiveness: self.arb_responsiveness,
            shift: None,
        }
    }

    /// Nearest canonical regime label for candidates evolved at this point.
    pub fn nearest_regime(&self) -> Regime {
        if self.jump_intensity > 1.0 {
            Regime::JumpDiffusion
        } else if self.volatility > 0.6 {
            Regime::HighVol
        } else {
            Regime::LowVol
        }
    }

    /// Distance in bounds-normalized coordinates.
    fn distance(&self, other: &RegimeVector) -> f64 {
        let d = |a: f64, b: f64, bounds: (f64, f64)| {
            let span = bounds.1 - bounds.0;
            if span > 0.0 {
                ((a - b) / span).powi(2)
            } else {
                0.0
            }
        };
        (d(self.volatility, other.volatility, VOLATILITY_BOUNDS)
            + d(self.jump_intensity, other.jump_intensity, JUMP_INTENSITY_BOUNDS)
            + d(self.jump_mean, other.jump_mean, JUMP_MEAN_BOUNDS)
            + d(self.jump_std, other.jump_std, JUMP_STD_BOUNDS)
            + d(self.mean_reversion, other.mean_reversion, MEAN_REVERSION_BOUNDS)
            + d(
                self.arb_responsiveness,
                other.arb_responsiveness,
                ARB_RESPONSIVENESS_BOUNDS,
            ))
        .sqrt()
    }
}

/// One evolved lattice point.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegimePoint {
    pub vector: RegimeVector,
    pub champion_bins: Vec<f64>,
    pub champion_features: Features,
    pub champion_score: f64,
    pub convergence_delta: f64,
    pub converged: bool,
    pub generations_run: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegimeMap {
    pub levels: usize,
    pub points: Vec<RegimePoint>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EstimateSource {
    Exact,
    Interpolated,
}

/// A blended geometry estimate for an arbitrary regime vector.
#[derive(Clone, Debug)]
pub struct RegimeEstimate {
    pub bins: Vec<f64>,
    pub features: Features,
    pub source: EstimateSource,
    /// Indices into `RegimeMap::points`, strongest contributor first.
    pub contributors: Vec<usize>,
}

impl RegimeMap {
    /// Evolve a `levels × levels` lattice over (volatility, jump intensity),
    /// holding the remaining components at their midpoints.
    pub fn evolve_grid(levels: usize, cfg: &EngineConfig, rng: &mut EngineRng) -> Self {
        let lerp = |bounds: (f64, f64), i: usize| {
            if levels <= 1 {
                (bounds.0 + bounds.1) / 2.0
            } else {
                bounds.0 + (bounds.1 - bounds.0) * i as f64 / (levels - 1) as f64
            }
        };
        let mid = |bounds: (f64, f64)| (bounds.0 + bounds.1) / 2.0;

        let mut points = Vec::with_capacity(levels * levels);
        for i in 0..levels {
            for j in 0..levels {
                let vector = RegimeVector {
                    volatility: lerp(VOLATILITY_BOUNDS, i),
                    jump_intensity: lerp(JUMP_INTENSITY_BOUNDS, j),
                    jump_mean: mid(JUMP_MEAN_BOUNDS),
                    jump_std: mid(JUMP_STD_BOUNDS),
                    mean_reversion: mid(MEAN_REVERSION_BOUNDS),
                    arb_responsiveness: mid(ARB_RESPONSIVENESS_BOUNDS),
                };
                points.push(evolve_regime_point(&vector, cfg, rng));
            }
        }

        Self { levels, points }
    }

    /// Estimate the champion geometry at `target`. Exact lattice hits return
    /// the stored champion; anything else blends the k nearest champions by
    /// inverse distance and renormalizes.
    pub fn estimate_regime_geometry(&self, target: &RegimeVector) -> Option<RegimeEstimate> {
        if self.points.is_empty() {
            return None;
        }

        if let Some(idx) = self
            .points
            .iter()
            .position(|p| p.vector.distance(target) < 1e-9)
        {
            let p = &self.points[idx];
            return Some(RegimeEstimate {
                bins: p.champion_bins.clone(),
                features: p.champion_features,
                source: EstimateSource::Exact,
                contributors: vec![idx],
            });
        }

        let mut ranked: Vec<(usize, f64)> = self
            .points
            .iter()
            .enumerate()
            .map(|(i, p)| (i, p.vector.distance(target)))
            .collect();
        ranked.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(DEFAULT_K.min(self.points.len()));

        let mut bins = vec![0.0; crate::types::N_BINS];
        let mut weight_sum = 0.0;
        for &(idx, dist) in &ranked {
            let w = 1.0 / (dist + 1e-9);
            weight_sum += w;
            for (b, &v) in bins.iter_mut().zip(self.points[idx].champion_bins.iter()) {
                *b += w * v;
            }
        }
        if weight_sum > 0.0 {
            bins.iter_mut().for_each(|b| *b /= weight_sum);
        }
        normalize(&mut bins);

        let features = compute_features(&bins);
        Some(RegimeEstimate {
            bins,
            features,
            source: EstimateSource::Interpolated,
            contributors: ranked.into_iter().map(|(i, _)| i).collect(),
        })
    }

    /// Occupancy of a 5×5 grid over (volatility, jump intensity).
    pub fn coverage(&self) -> f64 {
        const CELLS: usize = 5;
        let mut occupied = vec![false; CELLS * CELLS];
        for p in &self.points {
            let b = |v: f64, bounds: (f64, f64)| {
                let t = (v - bounds.0) / (bounds.1 - bounds.0);
                ((t * CELLS as f64).floor().max(0.0) as usize).min(CELLS - 1)
            };
            let row = b(p.vector.volatility, VOLATILITY_BOUNDS);
            let col = b(p.vector.jump_intensity, JUMP_INTENSITY_BOUNDS);
            occupied[row * CELLS + col] = true;
        }
        occupied.iter().filter(|o| **o).count() as f64 / (CELLS * CELLS) as f64
    }
}

/// Evolve one lattice point until the champion plateaus or the generation
/// budget runs out. Always returns the best champion seen, converged or not.
pub fn evolve_regime_point(
    vector: &RegimeVector,
    cfg: &EngineConfig,
    rng: &mut EngineRng,
) -> RegimePoint {
    let regime_cfg = vector.to_config();
    let grid = MapElitesGrid::default();
    let mut pop = PopulationState::empty(vector.nearest_regime());

    let mut best_score = f64::INFINITY;
    let mut last_delta = f64::INFINITY;
    let mut plateau = 0u32;
    let mut generations_run = 0u64;
    let mut converged = false;

    for _ in 0..MAX_GENERATIONS {
        let out = evolve_generation(&pop, cfg, &regime_cfg, None, &grid, rng);
        pop = out.population;
        generations_run += 1;

        let score = pop
            .champion
            .as_ref()
            .map(|c| c.score)
            .unwrap_or(f64::INFINITY);
        last_delta = (best_score - score).max(0.0);
        if score < best_score {
            best_score = score;
        }
        if last_delta < CONVERGENCE_THRESHOLD && generations_run > 1 {
            plateau += 1;
            if plateau >= PATIENCE {
                converged = true;
                break;
            }
        } else {
            plateau = 0;
        }
    }

    let (champion_bins, champion_features, champion_score) = match &pop.champion {
        Some(c) => (c.bins.clone(), c.features, c.score),
        None => {
            // Pathological: nothing valid ever evaluated. Fall back to the
            // uniform density so callers still get a usable shape.
            let bins = vec![
                crate::types::TOTAL_LIQUIDITY / crate::types::N_BINS as f64;
                crate::types::N_BINS
            ];
            let features = compute_features(&bins);
            (bins, features, f64::INFINITY)
        }
    };

    RegimePoint {
        vector: *vector,
        champion_bins,
        champion_features,
        champion_score,
        convergence_delta: if last_delta.is_finite() { last_delta } else { 0.0 },
        converged,
        generations_run,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TOTAL_LIQUIDITY;

    fn tiny_cfg() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.population_size = 10;
        cfg.train_paths = 1;
        cfg.eval_paths = 1;
        cfg.path_steps = 32;
        cfg.cma_enabled = false;
        cfg
    }

    #[test]
    fn evolved_point_carries_a_champion() {
        let cfg = tiny_cfg();
        let mut rng = EngineRng::seed_from_u64(42);
        let vector = RegimeVector {
            volatility: 0.4,
            jump_intensity: 0.0,
            jump_mean: -0.04,
            jump_std: 0.1,
            mean_reversion: 0.5,
            arb_responsiveness: 0.8,
        };
        let point = evolve_regime_point(&vector, &cfg, &mut rng);
        assert!(point.generations_run >= 1);
        assert!(point.champion_score.is_finite());
        let sum: f64 = point.champion_bins.iter().sum();
        assert!((sum - TOTAL_LIQUIDITY).abs() < 1e-6);
    }

    #[test]
    fn interpolation_blends_multiple_contributors() {
        let cfg = tiny_cfg();
        let mut rng = EngineRng::seed_from_u64(7);
        let map = RegimeMap::evolve_grid(2, &cfg, &mut rng);
        assert_eq!(map.points.len(), 4);

        let target = RegimeVector {
            volatility: 0.7,
            jump_intensity: 2.0,
            jump_mean: -0.04,
            jump_std: 0.1,
            mean_reversion: 0.0,
            arb_responsiveness: 1.0,
        };
        let est = map
            .estimate_regime_geometry(&target)
            .expect("populated map");
        assert_eq!(est.source, EstimateSource::Interpolated);
        assert!(est.contributors.len() >= 2);
        let sum: f64 = est.bins.iter().sum();
        assert!((sum - TOTAL_LIQUIDITY).abs() < 1e-6);
    }

    #[test]
    fn exact_lattice_hit_returns_stored_champion() {
        let cfg = tiny_cfg();
        let mut rng = EngineRng::seed_from_u64(3);
        let map = RegimeMap::evolve_grid(2, &cfg, &mut rng);
        let est = map
            .estimate_regime_geometry(&map.points[0].vector)
            .expect("populated map");
        assert_eq!(est.source, EstimateSource::Exact);
        assert_eq!(est.contributors, vec![0]);
        assert_eq!(est.bins, map.points[0].champion_bins);
    }

    #[test]
    fn full_grid_covers_behavior_space() {
        let cfg = tiny_cfg();
        let mut rng = EngineRng::seed_from_u64(5);
        let map = RegimeMap::evolve_grid(2, &cfg, &mut rng);
        // Corner lattice: 4 of 25 coarse cells.
        assert!((map.coverage() - 4.0 / 25.0).abs() < 1e-12);
    }
}
