//! Deterministic RNG capability.
//!
//! Every stochastic draw in the engine flows through one `EngineRng` so a
//! seeded run can be replayed exactly. The generator is ChaCha8; Gaussians
//! come from Box–Muller over the uniform stream rather than a separate
//! distribution object, which keeps the stream layout independent of
//! distribution-crate internals.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

#[derive(Clone, Debug)]
pub struct EngineRng {
    inner: ChaCha8Rng,
}

impl EngineRng {
    pub fn seed_from_u64(seed: u64) -> Self {
        Self {
            inner: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Uniform draw in (0, 1).
    #[inline]
    pub fn uniform(&mut self) -> f64 {
        self.inner.gen::<f64>()
    }

    /// Standard normal via Box–Muller. `u1` is clamped away from zero so the
    /// log stays finite.
    #[inline]
    pub fn gaussian(&mut self) -> f64 {
        let u1 = self.uniform().max(1e-15);
        let u2 = self.uniform();
        (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
    }

    /// Bernoulli event with probability `rate_dt` (a Poisson arrival over one
    /// small step), clamped to [0, 1].
    #[inline]
    pub fn poisson_event(&mut self, rate_dt: f64) -> bool {
        self.uniform() < rate_dt.clamp(0.0, 1.0)
    }

    /// Uniform draw in [lo, hi).
    #[inline]
    pub fn range(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.uniform()
    }

    /// Uniform index in 0..n. `n` must be nonzero.
    #[inline]
    pub fn index(&mut self, n: usize) -> usize {
        ((self.uniform() * n as f64) as usize).min(n - 1)
    }

    /// Fair coin.
    #[inline]
    pub fn coin(&mut self) -> bool {
        self.uniform() < 0.5
    }

    /// Biased coin with probability `p`.
    #[inline]
    pub fn chance(&mut self, p: f64) -> bool {
        self.uniform() < p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_replays_identically() {
        let mut a = EngineRng::seed_from_u64(7);
        let mut b = EngineRng::seed_from_u64(7);
        for _ in 0..1000 {
            assert_eq!(a.uniform(), b.uniform());
            assert_eq!(a.gaussian(), b.gaussian());
        }
    }

    #[test]
    fn gaussian_moments_are_sane() {
        let mut rng = EngineRng::seed_from_u64(42);
        let n = 50_000;
        let draws: Vec<f64> = (0..n).map(|_| rng.gaussian()).collect();
        let mean = draws.iter().sum::<f64>() / n as f64;
        let var = draws.iter().map(|z| (z - mean).powi(2)).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.02, "mean = {mean}");
        assert!((var - 1.0).abs() < 0.05, "var = {var}");
    }

    #[test]
    fn poisson_event_rate_matches() {
        let mut rng = EngineRng::seed_from_u64(99);
        let rate_dt = 0.2;
        let n = 50_000;
        let hits = (0..n).filter(|_| rng.poisson_event(rate_dt)).count();
        let freq = hits as f64 / n as f64;
        assert!((freq - rate_dt).abs() < 0.01, "freq = {freq}");
    }
}
