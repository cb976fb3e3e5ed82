//! Invariant families.
//!
//! Each family is a parameterized generator of liquidity shapes: it declares
//! parameter ranges and knows how to sample, perturb, and render parameters
//! into a 64-bin density. `Custom` is the escape hatch for user-designed
//! shapes and validates only the universal bin invariants.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::bins::{halves_balanced, normalize};
use crate::rng::EngineRng;
use crate::types::N_BINS;

#[derive(Clone, Copy, Debug)]
pub struct ParamRange {
    pub name: &'static str,
    pub min: f64,
    pub max: f64,
}

const PIECEWISE_BANDS_RANGES: &[ParamRange] = &[
    ParamRange { name: "skew", min: -1.0, max: 1.0 },
    ParamRange { name: "width", min: 0.06, max: 0.55 },
    ParamRange { name: "shoulder", min: 0.0, max: 0.9 },
];

const AMPLIFIED_HYBRID_RANGES: &[ParamRange] = &[
    ParamRange { name: "skew", min: -1.0, max: 1.0 },
    ParamRange { name: "amplification", min: 1.0, max: 10.0 },
    ParamRange { name: "decay", min: 1.0, max: 40.0 },
];

const TAIL_SHIELDED_RANGES: &[ParamRange] = &[
    ParamRange { name: "width", min: 0.05, max: 0.45 },
    ParamRange { name: "tail_weight", min: 0.0, max: 0.8 },
    ParamRange { name: "moat_width", min: 0.15, max: 0.9 },
];

/// Relative scale of the Gaussian perturbation applied by `mutate_params`.
const PARAM_MUTATION_SCALE: f64 = 0.12;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum FamilyId {
    PiecewiseBands,
    AmplifiedHybrid,
    TailShielded,
    Custom,
}

impl FamilyId {
    /// Families the evolution step samples from. `Custom` only enters through
    /// user-designed candidates.
    pub const GENERATIVE: [FamilyId; 3] = [
        FamilyId::PiecewiseBands,
        FamilyId::AmplifiedHybrid,
        FamilyId::TailShielded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FamilyId::PiecewiseBands => "piecewise-bands",
            FamilyId::AmplifiedHybrid => "amplified-hybrid",
            FamilyId::TailShielded => "tail-shielded",
            FamilyId::Custom => "custom",
        }
    }

    pub fn parameter_ranges(&self) -> &'static [ParamRange] {
        match self {
            FamilyId::PiecewiseBands => PIECEWISE_BANDS_RANGES,
            FamilyId::AmplifiedHybrid => AMPLIFIED_HYBRID_RANGES,
            FamilyId::TailShielded => TAIL_SHIELDED_RANGES,
            FamilyId::Custom => &[],
        }
    }

    /// Uniform sample within every declared range.
    pub fn sample_params(&self, rng: &mut EngineRng) -> BTreeMap<String, f64> {
        self.parameter_ranges()
            .iter()
            .map(|r| (r.name.to_string(), rng.range(r.min, r.max)))
            .collect()
    }

    /// Gaussian perturbation per parameter, reflected once at the range edge
    /// and clamped.
    pub fn mutate_params(
        &self,
        params: &BTreeMap<String, f64>,
        rng: &mut EngineRng,
    ) -> BTreeMap<String, f64> {
        self.parameter_ranges()
            .iter()
            .map(|r| {
                let base = params.get(r.name).copied().unwrap_or((r.min + r.max) / 2.0);
                let mut v = base + rng.gaussian() * PARAM_MUTATION_SCALE * (r.max - r.min);
                if v < r.min {
                    v = r.min + (r.min - v);
                }
                if v > r.max {
                    v = r.max - (v - r.max);
                }
                (r.name.to_string(), v.clamp(r.min, r.max))
            })
            .collect()
    }

    /// Render parameters into a normalized bin density.
    pub fn generate_bins(
        &self,
        params: &BTreeMap<String, f64>,
        rng: &mut EngineRng,
    ) -> Vec<f64> {
        let mut bins = match self {
            FamilyId::PiecewiseBands => piecewise_bands(params, rng),
            FamilyId::AmplifiedHybrid => amplified_hybrid(params),
            FamilyId::TailShielded => tail_shielded(params),
            FamilyId::Custom => vec![1.0; N_BINS],
        };
        normalize(&mut bins);
        bins
    }
}

impl std::fmt::Display for FamilyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[inline]
fn param(params: &BTreeMap<String, f64>, name: &str, default: f64) -> f64 {
    params.get(name).copied().unwrap_or(default)
}

/// Skewed center index: half the axis plus up to ±22% of the bin count.
#[inline]
fn skewed_center(skew: f64) -> f64 {
    (N_BINS / 2) as f64 + skew * N_BINS as f64 * 0.22
}

/// Central band with an exponential shoulder and small multiplicative noise.
fn piecewise_bands(params: &BTreeMap<String, f64>, rng: &mut EngineRng) -> Vec<f64> {
    let skew = param(params, "skew", 0.0);
    let width = param(params, "width", 0.25);
    let shoulder = param(params, "shoulder", 0.3);
    let center = skewed_center(skew);
    let half = (N_BINS / 2) as f64;

    (0..N_BINS)
        .map(|i| {
            let dist = (i as f64 - center).abs() / half;
            let band = (-0.5 * (dist / width).powi(2)).exp();
            let shoulder_term = shoulder * (-12.0 * dist).exp();
            let noise = 0.8 + 0.4 * rng.uniform();
            (band + shoulder_term) * noise
        })
        .collect()
}

/// `1 / (1 + decay·x²)^(amplification/3)`, a generalized-Cauchy hump.
fn amplified_hybrid(params: &BTreeMap<String, f64>) -> Vec<f64> {
    let skew = param(params, "skew", 0.0);
    let amplification = param(params, "amplification", 4.0);
    let decay = param(params, "decay", 10.0);
    let center = skewed_center(skew);
    let half = (N_BINS / 2) as f64;

    (0..N_BINS)
        .map(|i| {
            let x = (i as f64 - center).abs() / half;
            (1.0 + decay * x * x).powf(-amplification / 3.0)
        })
        .collect()
}

/// Center mass plus rising tails, with a moat carved between them.
fn tail_shielded(params: &BTreeMap<String, f64>) -> Vec<f64> {
    let width = param(params, "width", 0.2);
    let tail_weight = param(params, "tail_weight", 0.3);
    let moat_width = param(params, "moat_width", 0.4);
    let center = (N_BINS / 2) as f64;
    let half = (N_BINS / 2) as f64;

    (0..N_BINS)
        .map(|i| {
            let x = (i as f64 - center).abs() / half;
            let core = (-0.5 * (x / width).powi(2)).exp();
            let tail = tail_weight * x.powf(1.4);
            let moat = 0.15 * (-((x - moat_width) * 6.0).powi(2)).exp();
            (core + tail - moat).max(0.0)
        })
        .collect()
}

/// Family-level validation: every declared parameter present, finite and
/// in-range, positive total mass, and no half of the axis hoarding more than
/// 95% of it.
pub fn validate(family: FamilyId, params: &BTreeMap<String, f64>, bins: &[f64]) -> bool {
    for r in family.parameter_ranges() {
        match params.get(r.name) {
            Some(v) if v.is_finite() && *v >= r.min && *v <= r.max => {}
            _ => return false,
        }
    }
    let sum: f64 = bins.iter().sum();
    if !sum.is_finite() || sum <= 0.0 {
        return false;
    }
    if bins.iter().any(|b| !b.is_finite() || *b < 0.0) {
        return false;
    }
    halves_balanced(bins)
}
