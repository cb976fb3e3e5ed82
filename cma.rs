//! Low-dimensional CMA-ES sampler.
//!
//! The optimizer works in a reduced space (default 16 dims) and maps to and
//! from 64-bin densities: expansion is Catmull–Rom interpolation through the
//! reduced vector, compression averages contiguous bin segments. Matrices
//! are dense row-major; at n ≤ 16 the O(n³) Cholesky is noise.

use serde::{Deserialize, Serialize};

use crate::bins::normalize;
use crate::rng::EngineRng;
use crate::types::N_BINS;

/// Default reduced dimensionality.
pub const REDUCED_DIM: usize = 16;

const SIGMA_MIN: f64 = 0.01;
const SIGMA_MAX: f64 = 2.0;
const CHOL_FLOOR: f64 = 1e-10;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CmaEs {
    n: usize,
    mean: Vec<f64>,
    sigma: f64,
    cov: Vec<Vec<f64>>,
    p_sigma: Vec<f64>,
    p_c: Vec<f64>,
    weights: Vec<f64>,
    lambda: usize,
    mu: usize,
    mu_eff: f64,
    c_sigma: f64,
    d_sigma: f64,
    c_c: f64,
    c1: f64,
    c_mu: f64,
    chi_n: f64,
    generation: u64,
}

impl CmaEs {
    pub fn new(n: usize, initial_mean: Vec<f64>, initial_sigma: f64) -> Self {
        assert!(n >= 2 && initial_mean.len() == n);
        let nf = n as f64;
        let lambda = ((4.0 + 3.0 * nf.ln()).floor() as usize).max(8);
        let mu = lambda / 2;

        let raw: Vec<f64> = (0..mu)
            .map(|i| (mu as f64 + 0.5).ln() - ((i + 1) as f64).ln())
            .collect();
        let raw_sum: f64 = raw.iter().sum();
        let weights: Vec<f64> = raw.iter().map(|w| w / raw_sum).collect();
        let mu_eff = 1.0 / weights.iter().map(|w| w * w).sum::<f64>();

        let c_sigma = (mu_eff + 2.0) / (nf + mu_eff + 5.0);
        let d_sigma =
            1.0 + 2.0 * (((mu_eff - 1.0) / (nf + 1.0)).sqrt() - 1.0).max(0.0) + c_sigma;
        let c_c = (4.0 + mu_eff / nf) / (nf + 4.0 + 2.0 * mu_eff / nf);
        let c1 = 2.0 / ((nf + 1.3).powi(2) + mu_eff);
        let c_mu = (1.0 - c1)
            .min(2.0 * (mu_eff - 2.0 + 1.0 / mu_eff) / ((nf + 2.0).powi(2) + mu_eff));
        let chi_n = nf.sqrt() * (1.0 - 1.0 / (4.0 * nf) + 1.0 / (21.0 * nf * nf));

        let mut cov = vec![vec![0.0; n]; n];
        for (i, row) in cov.iter_mut().enumerate() {
            row[i] = 1.0;
        }

        Self {
            n,
            mean: initial_mean,
            sigma: initial_sigma.clamp(SIGMA_MIN, SIGMA_MAX),
            cov,
            p_sigma: vec![0.0; n],
            p_c: vec![0.0; n],
            weights,
            lambda,
            mu,
            mu_eff,
            c_sigma,
            d_sigma,
            c_c,
            c1,
            c_mu,
            chi_n,
            generation: 0,
        }
    }

    /// Default sampler over the reduced bin space, centered on the uniform
    /// density's per-bin mass.
    pub fn for_bins() -> Self {
        let uniform = crate::types::TOTAL_LIQUIDITY / N_BINS as f64;
        Self::new(REDUCED_DIM, vec![uniform; REDUCED_DIM], 1.5)
    }

    pub fn dim(&self) -> usize {
        self.n
    }

    pub fn lambda(&self) -> usize {
        self.lambda
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    /// Draw `count` solutions `max(0, m + σ·A·z)` with `A·Aᵀ = C`.
    pub fn sample(&self, count: usize, rng: &mut EngineRng) -> Vec<Vec<f64>> {
        let a = cholesky(&self.cov);
        (0..count).map(|_| self.sample_with(&a, rng)).collect()
    }

    /// Draw a single solution.
    pub fn sample_one(&self, rng: &mut EngineRng) -> Vec<f64> {
        let a = cholesky(&self.cov);
        self.sample_with(&a, rng)
    }

    fn sample_with(&self, a: &[Vec<f64>], rng: &mut EngineRng) -> Vec<f64> {
        let z: Vec<f64> = (0..self.n).map(|_| rng.gaussian()).collect();
        (0..self.n)
            .map(|i| {
                let az: f64 = (0..=i).map(|j| a[i][j] * z[j]).sum();
                (self.mean[i] + self.sigma * az).max(0.0)
            })
            .collect()
    }

    /// Standard rank-one + rank-μ update from solutions ranked best-first.
    pub fn update(&mut self, ranked: &[Vec<f64>]) {
        let take = ranked.len().min(self.mu);
        if take == 0 {
            return;
        }
        let old_mean = self.mean.clone();

        // Selection-weighted displacement in step-size units.
        let ys: Vec<Vec<f64>> = ranked[..take]
            .iter()
            .map(|x| {
                (0..self.n)
                    .map(|i| (x[i] - old_mean[i]) / self.sigma)
                    .collect()
            })
            .collect();
        let mut y_w = vec![0.0; self.n];
        for (w, y) in self.weights.iter().zip(ys.iter()) {
            for i in 0..self.n {
                y_w[i] += w * y[i];
            }
        }

        for i in 0..self.n {
            self.mean[i] = old_mean[i] + self.sigma * y_w[i];
        }

        // Whitened displacement drives the step-size path.
        let a = cholesky(&self.cov);
        let u = forward_solve(&a, &y_w);
        let cs_scale = (self.c_sigma * (2.0 - self.c_sigma) * self.mu_eff).sqrt();
        for i in 0..self.n {
            self.p_sigma[i] = (1.0 - self.c_sigma) * self.p_sigma[i] + cs_scale * u[i];
        }

        self.generation += 1;
        let ps_norm = norm(&self.p_sigma);
        let damp = (1.0 - (1.0 - self.c_sigma).powi(2 * self.generation as i32)).sqrt();
        let h_sigma = if damp > 0.0 {
            ps_norm / damp < (1.4 + 2.0 / (self.n as f64 + 1.0)) * self.chi_n
        } else {
            true
        };

        let cc_scale = (self.c_c * (2.0 - self.c_c) * self.mu_eff).sqrt();
        for i in 0..self.n {
            self.p_c[i] = (1.0 - self.c_c) * self.p_c[i]
                + if h_sigma { cc_scale * y_w[i] } else { 0.0 };
        }

        // Covariance: decay, rank-one (with stall correction), rank-μ.
        let decay = 1.0 - self.c1 - self.c_mu;
        let stall = if h_sigma {
            0.0
        } else {
            self.c1 * self.c_c * (2.0 - self.c_c)
        };
        for i in 0..self.n {
            for j in 0..self.n {
                let mut v = (decay + stall) * self.cov[i][j];
                v += self.c1 * self.p_c[i] * self.p_c[j];
                let mut rank_mu = 0.0;
                for (w, y) in self.weights.iter().zip(ys.iter()) {
                    rank_mu += w * y[i] * y[j];
                }
                v += self.c_mu * rank_mu;
                self.cov[i][j] = v;
            }
        }

        self.sigma = (self.sigma
            * ((self.c_sigma / self.d_sigma) * (ps_norm / self.chi_n - 1.0)).exp())
        .clamp(SIGMA_MIN, SIGMA_MAX);
    }
}

fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Lower-triangular Cholesky factor with a floored diagonal.
fn cholesky(cov: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let n = cov.len();
    let mut a = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..=i {
            let mut s = cov[i][j];
            for k in 0..j {
                s -= a[i][k] * a[j][k];
            }
            if i == j {
                a[i][j] = s.max(CHOL_FLOOR).sqrt();
            } else {
                a[i][j] = s / a[j][j];
            }
        }
    }
    a
}

/// Solve `A·x = b` for lower-triangular `A`.
fn forward_solve(a: &[Vec<f64>], b: &[f64]) -> Vec<f64> {
    let n = a.len();
    let mut x = vec![0.0; n];
    for i in 0..n {
        let mut s = b[i];
        for j in 0..i {
            s -= a[i][j] * x[j];
        }
        x[i] = s / a[i][i].max(CHOL_FLOOR);
    }
    x
}

// ─── Dimension mapping ────────────────────────────────────────────────────────

/// Expand a reduced vector to a 64-bin density via Catmull–Rom interpolation,
/// clamped at zero and normalized.
pub fn expand_to_bins(reduced: &[f64]) -> Vec<f64> {
    let n = reduced.len();
    let mut bins: Vec<f64> = (0..N_BINS)
        .map(|t| {
            let u = t as f64 / (N_BINS - 1) as f64 * (n - 1) as f64;
            let i = (u.floor() as usize).min(n - 2);
            let t_local = u - i as f64;
            let p0 = reduced[i.saturating_sub(1)];
            let p1 = reduced[i];
            let p2 = reduced[i + 1];
            let p3 = reduced[(i + 2).min(n - 1)];
            catmull_rom(p0, p1, p2, p3, t_local).max(0.0)
        })
        .collect();
    normalize(&mut bins);
    bins
}

#[inline]
fn catmull_rom(p0: f64, p1: f64, p2: f64, p3: f64, t: f64) -> f64 {
    0.5 * ((2.0 * p1)
        + (-p0 + p2) * t
        + (2.0 * p0 - 5.0 * p1 + 4.0 * p2 - p3) * t * t
        + (-p0 + 3.0 * p1 - 3.0 * p2 + p3) * t * t * t)
}

/// Compress a 64-bin density to `n` values by averaging contiguous segments.
pub fn compress_from_bins(bins: &[f64], n: usize) -> Vec<f64> {
    let len = bins.len();
    (0..n)
        .map(|j| {
            let lo = j * len / n;
            let hi = ((j + 1) * len / n).max(lo + 1);
            bins[lo..hi].iter().sum::<f64>() / (hi - lo) as f64
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TOTAL_LIQUIDITY;

    #[test]
    fn lambda_follows_dimension() {
        let cma = CmaEs::for_bins();
        assert_eq!(cma.lambda(), 12); // floor(4 + 3 ln 16)
        assert_eq!(cma.dim(), REDUCED_DIM);
    }

    #[test]
    fn samples_are_nonnegative_and_finite() {
        let cma = CmaEs::for_bins();
        let mut rng = EngineRng::seed_from_u64(17);
        for x in cma.sample(cma.lambda(), &mut rng) {
            assert_eq!(x.len(), REDUCED_DIM);
            assert!(x.iter().all(|v| v.is_finite() && *v >= 0.0));
        }
    }

    #[test]
    fn expansion_yields_a_legal_density() {
        let reduced: Vec<f64> = (0..REDUCED_DIM)
            .map(|i| 1.0 + (i as f64 / 3.0).sin().abs())
            .collect();
        let bins = expand_to_bins(&reduced);
        assert_eq!(bins.len(), N_BINS);
        let sum: f64 = bins.iter().sum();
        assert!((sum - TOTAL_LIQUIDITY).abs() < 1e-6);
        assert!(bins.iter().all(|&b| b >= 0.0));
    }

    #[test]
    fn compress_of_expand_preserves_shape() {
        // A smooth hump survives the round trip up to interpolation error.
        let reduced: Vec<f64> = (0..REDUCED_DIM)
            .map(|i| {
                let x = (i as f64 - 7.5) / 4.0;
                (-0.5 * x * x).exp() + 0.1
            })
            .collect();
        let back = compress_from_bins(&expand_to_bins(&reduced), REDUCED_DIM);

        let norm1 = |v: &[f64]| {
            let s: f64 = v.iter().sum();
            v.iter().map(|x| x / s).collect::<Vec<f64>>()
        };
        let a = norm1(&reduced);
        let b = norm1(&back);
        for (x, y) in a.iter().zip(b.iter()) {
            assert!(
                (x - y).abs() <= 0.25 * x + 0.01,
                "round trip drifted: {x} vs {y}"
            );
        }
    }
}
