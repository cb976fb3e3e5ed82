//! Shape features and metric normalization.
//!
//! Features describe the geometry of a density (used by the MAP-Elites grid
//! and the regime mapper); normalized axes map raw metrics into [0, 1] with
//! higher-is-better orientation for the spider composite.

use crate::types::{AxisKey, Features, Metrics, N_BINS};

/// Compute shape features on the probability vector `p = bins / Σbins`.
pub fn compute_features(bins: &[f64]) -> Features {
    let n = bins.len();
    let sum: f64 = bins.iter().sum();
    let p: Vec<f64> = if sum > 0.0 {
        bins.iter().map(|b| b / sum).collect()
    } else {
        vec![1.0 / n as f64; n]
    };

    // Discrete second differences.
    let second: Vec<f64> = (1..n - 1)
        .map(|i| p[i - 1] - 2.0 * p[i] + p[i + 1])
        .collect();
    let curvature: f64 = second.iter().map(|c| c * c).sum();
    let curvature_gradient: f64 = second
        .windows(2)
        .map(|w| (w[1].abs() - w[0].abs()).abs())
        .sum();

    let entropy: f64 = -p
        .iter()
        .filter(|&&v| v > 0.0)
        .map(|&v| v * v.log2())
        .sum::<f64>();

    let mid = n / 2;
    let left = &p[..mid];
    let right_rev: Vec<f64> = p[mid..].iter().rev().copied().collect();
    let symmetry = pearson(left, &right_rev);

    let quarter = n / 4;
    let outer: f64 = p[..quarter / 2].iter().sum::<f64>()
        + p[n - quarter / 2..].iter().sum::<f64>();
    let inner: f64 = p[quarter..n - quarter].iter().sum();
    let tail_density_ratio = if inner > 0.0 { outer / inner } else { 0.0 };

    let peak = p.iter().copied().fold(0.0, f64::max);
    let peak_concentration = peak * n as f64;

    let center = (n as f64 - 1.0) / 2.0;
    let spread: f64 = p
        .iter()
        .enumerate()
        .map(|(i, &v)| v * (i as f64 - center).powi(2))
        .sum();
    let concentration_width = spread.sqrt() / n as f64;

    Features {
        curvature,
        curvature_gradient,
        entropy,
        symmetry,
        tail_density_ratio,
        peak_concentration,
        concentration_width,
    }
}

fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len()) as f64;
    if n < 2.0 {
        return 0.0;
    }
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (&x, &y) in a.iter().zip(b.iter()) {
        cov += (x - mean_a) * (y - mean_b);
        var_a += (x - mean_a).powi(2);
        var_b += (y - mean_b).powi(2);
    }
    let flat_a = var_a < 1e-18;
    let flat_b = var_b < 1e-18;
    if flat_a && flat_b {
        // Two flat halves mirror each other perfectly.
        return 1.0;
    }
    if flat_a || flat_b {
        return 0.0;
    }
    cov / (var_a.sqrt() * var_b.sqrt())
}

// ─── Normalized axes ──────────────────────────────────────────────────────────

/// The seven spider axes, each in [0, 1], higher is better.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NormalizedAxes([f64; 7]);

impl NormalizedAxes {
    #[inline]
    pub fn get(&self, key: AxisKey) -> f64 {
        self.0[axis_slot(key)]
    }

    pub fn iter(&self) -> impl Iterator<Item = (AxisKey, f64)> + '_ {
        AxisKey::ALL.iter().map(move |&k| (k, self.get(k)))
    }

    pub fn values(&self) -> &[f64; 7] {
        &self.0
    }

    pub fn min(&self) -> f64 {
        self.0.iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn max(&self) -> f64 {
        self.0.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn mean(&self) -> f64 {
        self.0.iter().sum::<f64>() / 7.0
    }

    pub fn std(&self) -> f64 {
        let mean = self.mean();
        (self.0.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / 7.0).sqrt()
    }
}

#[inline]
fn axis_slot(key: AxisKey) -> usize {
    AxisKey::ALL.iter().position(|&k| k == key).unwrap_or(0)
}

/// Map raw metrics onto the [0, 1] spider axes.
pub fn normalize_metrics(m: &Metrics, stability: f64) -> NormalizedAxes {
    let mut axes = [0.0; 7];
    for (slot, key) in AxisKey::ALL.iter().enumerate() {
        axes[slot] = match key {
            AxisKey::Fees => (m.total_fees / 50.0).min(1.0),
            AxisKey::Utilization => m.liquidity_utilization.clamp(0.0, 1.0),
            AxisKey::LpValue => m.lp_value_vs_hodl.min(1.2) / 1.2,
            AxisKey::LowSlippage => (1.0 - 10.0 * m.total_slippage).max(0.0),
            AxisKey::LowArbLeak => (1.0 - m.arb_leakage / 50.0).max(0.0),
            AxisKey::Stability => (1.0 - 5.0 * stability).max(0.0),
            AxisKey::LowDrawdown => (1.0 - 5.0 * m.max_drawdown).max(0.0),
        }
        .clamp(0.0, 1.0);
    }
    NormalizedAxes(axes)
}

/// Aggregate axis quality rewarding well-rounded shapes: a geometric mean
/// with a floor, blended with the weakest axis.
pub fn spider_coverage(axes: &NormalizedAxes) -> f64 {
    let log_sum: f64 = axes.values().iter().map(|v| v.max(0.01).ln()).sum();
    let geomean = (log_sum / 7.0).exp();
    0.7 * geomean + 0.3 * axes.min()
}
