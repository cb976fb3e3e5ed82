//! Mutation, crossover, and targeted shape edits.
//!
//! Every operator ends by clamping bins at zero and renormalizing, so any
//! output is a legal density regardless of how aggressive the edit was.

use std::collections::BTreeMap;

use crate::bins::normalize;
use crate::families::FamilyId;
use crate::rng::EngineRng;
use crate::types::{AxisKey, N_BINS, TOTAL_LIQUIDITY};

// ─── Generic mutation ─────────────────────────────────────────────────────────

/// Apply one uniformly chosen mutation operator in place.
pub fn mutate_bins(bins: &mut Vec<f64>, intensity: f64, rng: &mut EngineRng) {
    match rng.index(3) {
        0 => local_perturbation(bins, intensity, rng),
        1 => smoothing(bins, rng),
        _ => redistribution(bins, intensity, rng),
    }
    finish(bins);
}

/// Add Gaussian noise to a random subset of 1..=N/4 bins.
fn local_perturbation(bins: &mut [f64], intensity: f64, rng: &mut EngineRng) {
    let count = 1 + rng.index(N_BINS / 4);
    let unit = intensity * TOTAL_LIQUIDITY / N_BINS as f64;
    for _ in 0..count {
        let i = rng.index(bins.len());
        bins[i] += rng.gaussian() * unit;
    }
}

/// Moving-average filter with radius 1..=3, blended back at 0.2..0.5.
fn smoothing(bins: &mut [f64], rng: &mut EngineRng) {
    let radius = 1 + rng.index(3);
    let ratio = rng.range(0.2, 0.5);
    let smoothed = moving_average(bins, radius);
    for (b, s) in bins.iter_mut().zip(smoothed) {
        *b = (1.0 - ratio) * *b + ratio * s;
    }
}

/// Shift mass from a source region to a destination region, taking at most
/// 30% of each source bin.
fn redistribution(bins: &mut [f64], intensity: f64, rng: &mut EngineRng) {
    let n = bins.len();
    let src_width = 4 + rng.index(8);
    let dst_width = 4 + rng.index(8);
    let src_start = rng.index(n.saturating_sub(src_width).max(1));
    let dst_start = rng.index(n.saturating_sub(dst_width).max(1));

    let amount = intensity * TOTAL_LIQUIDITY * 0.5;
    let per_bin = amount / src_width as f64;

    let mut moved = 0.0;
    for i in src_start..(src_start + src_width).min(n) {
        let take = per_bin.min(bins[i] * 0.3);
        bins[i] -= take;
        moved += take;
    }
    let share = moved / dst_width as f64;
    for i in dst_start..(dst_start + dst_width).min(n) {
        bins[i] += share;
    }
}

pub(crate) fn moving_average(bins: &[f64], radius: usize) -> Vec<f64> {
    let n = bins.len();
    (0..n)
        .map(|i| {
            let lo = i.saturating_sub(radius);
            let hi = (i + radius).min(n - 1);
            bins[lo..=hi].iter().sum::<f64>() / (hi - lo + 1) as f64
        })
        .collect()
}

// ─── Crossover ────────────────────────────────────────────────────────────────

/// Combine two parent densities with a uniformly chosen crossover operator.
pub fn crossover_bins(a: &[f64], b: &[f64], rng: &mut EngineRng) -> Vec<f64> {
    let mut child = match rng.index(3) {
        0 => {
            // Uniform per-bin swap.
            a.iter()
                .zip(b.iter())
                .map(|(&x, &y)| if rng.coin() { x } else { y })
                .collect::<Vec<f64>>()
        }
        1 => {
            // Segment crossover with a linear blend around the cut point.
            let n = a.len();
            let point = rng.range(0.3 * n as f64, 0.7 * n as f64) as usize;
            let width = 4 + rng.index(6);
            (0..n)
                .map(|i| {
                    if i + width / 2 < point {
                        a[i]
                    } else if i >= point + width / 2 {
                        b[i]
                    } else {
                        let t = (i + width / 2 - point) as f64 / width.max(1) as f64;
                        let t = t.clamp(0.0, 1.0);
                        (1.0 - t) * a[i] + t * b[i]
                    }
                })
                .collect()
        }
        _ => {
            let ratio = rng.range(0.3, 0.7);
            blend(a, b, ratio)
        }
    };
    finish(&mut child);
    child
}

/// Arithmetic blend: `ratio` of `a` plus the rest of `b`.
pub fn blend(a: &[f64], b: &[f64], ratio: f64) -> Vec<f64> {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| ratio * x + (1.0 - ratio) * y)
        .collect()
}

/// Pull `child` toward `parent` by `ratio`, renormalizing afterwards.
pub fn blend_toward(child: &mut Vec<f64>, parent: &[f64], ratio: f64) {
    for (c, &p) in child.iter_mut().zip(parent.iter()) {
        *c = (1.0 - ratio) * *c + ratio * p;
    }
    finish(child);
}

/// Interpolate parameters per key with a random bias and a touch of
/// range-scaled noise, clamped into the family's declared ranges.
pub fn crossover_params(
    pa: &BTreeMap<String, f64>,
    pb: &BTreeMap<String, f64>,
    family: FamilyId,
    rng: &mut EngineRng,
) -> BTreeMap<String, f64> {
    family
        .parameter_ranges()
        .iter()
        .map(|r| {
            let mid = (r.min + r.max) / 2.0;
            let va = pa.get(r.name).copied().unwrap_or(mid);
            let vb = pb.get(r.name).copied().unwrap_or(mid);
            let bias = rng.range(0.3, 0.7);
            let noise = rng.gaussian() * 0.02 * (r.max - r.min);
            let v = (va + bias * (vb - va) + noise).clamp(r.min, r.max);
            (r.name.to_string(), v)
        })
        .collect()
}

// ─── Targeted edits ───────────────────────────────────────────────────────────

/// Reshape toward fixing the named weak axes.
pub fn remediate_weaknesses(
    bins: &mut Vec<f64>,
    axes: &[AxisKey],
    intensity: f64,
    rng: &mut EngineRng,
) {
    for &axis in axes {
        apply_axis_edit(bins, axis, intensity, rng);
    }
    finish(bins);
}

/// Gentler pass over the same axes, reinforcing whatever the remediation
/// pushed toward instead of overwriting it.
pub fn amplify_strengths(
    bins: &mut Vec<f64>,
    axes: &[AxisKey],
    intensity: f64,
    rng: &mut EngineRng,
) {
    for &axis in axes {
        apply_axis_edit(bins, axis, intensity * 0.5, rng);
    }
    finish(bins);
}

fn apply_axis_edit(bins: &mut [f64], axis: AxisKey, intensity: f64, rng: &mut EngineRng) {
    let n = bins.len();
    let center = n as f64 / 2.0;
    match axis {
        // More mass where the price actually trades.
        AxisKey::Utilization => {
            gaussian_bump(bins, center, n as f64 / 8.0, intensity * TOTAL_LIQUIDITY);
        }
        // Smoother shapes quote tighter.
        AxisKey::LowSlippage => {
            let ratio = (intensity * 4.0).min(1.0);
            let smoothed = moving_average(bins, 2);
            for (b, s) in bins.iter_mut().zip(smoothed) {
                *b = (1.0 - ratio) * *b + ratio * s;
            }
        }
        // A floor keeps every bin quoting and earning.
        AxisKey::Fees => {
            let floor = 0.3 * TOTAL_LIQUIDITY / N_BINS as f64;
            bins.iter_mut().for_each(|b| *b = b.max(floor));
        }
        // Taper the wings so stale quotes far from the reference shrink.
        AxisKey::LowArbLeak => {
            for (i, b) in bins.iter_mut().enumerate() {
                let dist = (i as f64 - center).abs() / center;
                *b *= 1.0 - (intensity * dist).min(0.9);
            }
        }
        // Flatter is steadier.
        AxisKey::Stability | AxisKey::LowDrawdown => {
            let t = (intensity * 2.0).min(1.0);
            let uniform = TOTAL_LIQUIDITY / n as f64;
            bins.iter_mut().for_each(|b| *b = (1.0 - t) * *b + t * uniform);
        }
        // A right-shifted bump rides appreciation.
        AxisKey::LpValue => {
            let shift = center + rng.range(0.05, 0.2) * n as f64;
            gaussian_bump(bins, shift, n as f64 / 10.0, intensity * TOTAL_LIQUIDITY);
        }
    }
}

fn gaussian_bump(bins: &mut [f64], center: f64, sigma: f64, mass: f64) {
    let weights: Vec<f64> = (0..bins.len())
        .map(|i| (-0.5 * ((i as f64 - center) / sigma).powi(2)).exp())
        .collect();
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return;
    }
    for (b, w) in bins.iter_mut().zip(weights) {
        *b += mass * w / total;
    }
}

fn finish(bins: &mut [f64]) {
    bins.iter_mut().for_each(|b| *b = b.max(0.0));
    normalize(bins);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::families::FamilyId;

    fn sample_bins(rng: &mut EngineRng) -> Vec<f64> {
        let family = FamilyId::PiecewiseBands;
        let params = family.sample_params(rng);
        family.generate_bins(&params, rng)
    }

    #[test]
    fn mutation_preserves_density_invariants() {
        let mut rng = EngineRng::seed_from_u64(21);
        for _ in 0..100 {
            let mut bins = sample_bins(&mut rng);
            mutate_bins(&mut bins, 0.2, &mut rng);
            let sum: f64 = bins.iter().sum();
            assert!((sum - TOTAL_LIQUIDITY).abs() < 1e-6, "sum = {sum}");
            assert!(bins.iter().all(|&b| b >= 0.0));
        }
    }

    #[test]
    fn crossover_preserves_density_invariants() {
        let mut rng = EngineRng::seed_from_u64(34);
        for _ in 0..60 {
            let a = sample_bins(&mut rng);
            let b = sample_bins(&mut rng);
            let child = crossover_bins(&a, &b, &mut rng);
            let sum: f64 = child.iter().sum();
            assert!((sum - TOTAL_LIQUIDITY).abs() < 1e-6);
            assert!(child.iter().all(|&v| v >= 0.0));
        }
    }

    #[test]
    fn remediation_edits_every_axis_cleanly() {
        let mut rng = EngineRng::seed_from_u64(55);
        for &axis in &AxisKey::ALL {
            let mut bins = sample_bins(&mut rng);
            remediate_weaknesses(&mut bins, &[axis], 0.15, &mut rng);
            amplify_strengths(&mut bins, &[axis], 0.06, &mut rng);
            let sum: f64 = bins.iter().sum();
            assert!((sum - TOTAL_LIQUIDITY).abs() < 1e-6, "{axis:?}: sum = {sum}");
            assert!(bins.iter().all(|&b| b >= 0.0), "{axis:?}: negative bin");
        }
    }

    #[test]
    fn param_crossover_stays_in_range() {
        let mut rng = EngineRng::seed_from_u64(77);
        let family = FamilyId::AmplifiedHybrid;
        let pa = family.sample_params(&mut rng);
        let pb = family.sample_params(&mut rng);
        for _ in 0..50 {
            let child = crossover_params(&pa, &pb, family, &mut rng);
            for r in family.parameter_ranges() {
                let v = child[r.name];
                assert!(v >= r.min && v <= r.max, "{} = {v}", r.name);
            }
        }
    }
}
