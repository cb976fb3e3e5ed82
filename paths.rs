//! Stochastic price-path generation.
//!
//! Log-price paths follow a jump-diffusion with optional mean reversion:
//!
//!   d log S = (μ − σ²/2)·dt + σ·√dt·Z + J + κ·(anchor − log S)·dt
//!
//! where J fires with probability λ·dt and equals jump_mean + jump_std·Z'.
//! The `regime-shift` configuration starts calm and switches to a turbulent
//! parameter set at a uniformly drawn point in the middle of the path.

use serde::{Deserialize, Serialize};

use crate::rng::EngineRng;
use crate::types::Regime;

/// Post-switch parameters for the `regime-shift` process.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegimeShift {
    pub volatility: f64,
    pub jump_intensity: f64,
    pub jump_mean: f64,
    pub jump_std: f64,
}

/// Parameters of one stochastic price regime. Volatility and jump intensity
/// are annualized; the simulator steps with `dt = 1/365`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegimeConfig {
    pub volatility: f64,
    pub drift: f64,
    pub jump_intensity: f64,
    pub jump_mean: f64,
    pub jump_std: f64,
    pub mean_reversion: f64,
    pub anchor: f64,
    /// How fully the pool price tracks an arbitrage correction, in [0.05, 1].
    pub arb_responsiveness: f64,
    pub shift: Option<RegimeShift>,
}

impl RegimeConfig {
    pub fn for_regime(regime: Regime) -> Self {
        match regime {
            Regime::LowVol => Self {
                volatility: 0.3,
                drift: 0.0,
                jump_intensity: 0.0,
                jump_mean: 0.0,
                jump_std: 0.0,
                mean_reversion: 0.5,
                anchor: 0.0,
                arb_responsiveness: 0.9,
                shift: None,
            },
            Regime::HighVol => Self {
                volatility: 0.9,
                drift: 0.0,
                jump_intensity: 0.0,
                jump_mean: 0.0,
                jump_std: 0.0,
                mean_reversion: 0.2,
                anchor: 0.0,
                arb_responsiveness: 0.75,
                shift: None,
            },
            Regime::JumpDiffusion => Self {
                volatility: 0.5,
                drift: 0.0,
                jump_intensity: 6.0,
                jump_mean: -0.04,
                jump_std: 0.1,
                mean_reversion: 0.3,
                anchor: 0.0,
                arb_responsiveness: 0.7,
                shift: None,
            },
            Regime::RegimeShift => Self {
                volatility: 0.2,
                drift: 0.0,
                jump_intensity: 0.0,
                jump_mean: 0.0,
                jump_std: 0.0,
                mean_reversion: 0.4,
                anchor: 0.0,
                arb_responsiveness: 0.8,
                shift: Some(RegimeShift {
                    volatility: 1.0,
                    jump_intensity: 6.0,
                    jump_mean: -0.05,
                    jump_std: 0.12,
                }),
            },
        }
    }
}

/// Generate `steps + 1` log-prices starting at 0.
pub fn generate_path(
    cfg: &RegimeConfig,
    steps: usize,
    dt: f64,
    rng: &mut EngineRng,
) -> Vec<f64> {
    // The shift point is drawn up front so the path is a pure function of the
    // RNG stream.
    let switch_step = cfg
        .shift
        .map(|_| rng.range(0.3 * steps as f64, 0.7 * steps as f64) as usize);

    let mut path = Vec::with_capacity(steps + 1);
    let mut log_s = 0.0;
    path.push(log_s);

    let mut vol = cfg.volatility;
    let mut jump_intensity = cfg.jump_intensity;
    let mut jump_mean = cfg.jump_mean;
    let mut jump_std = cfg.jump_std;

    for step in 0..steps {
        if let (Some(at), Some(shift)) = (switch_step, cfg.shift) {
            if step == at {
                vol = shift.volatility;
                jump_intensity = shift.jump_intensity;
                jump_mean = shift.jump_mean;
                jump_std = shift.jump_std;
            }
        }

        let z = rng.gaussian();
        let mut d = (cfg.drift - 0.5 * vol * vol) * dt + vol * dt.sqrt() * z;
        if jump_intensity > 0.0 && rng.poisson_event(jump_intensity * dt) {
            d += jump_mean + jump_std * rng.gaussian();
        }
        d += cfg.mean_reversion * (cfg.anchor - log_s) * dt;

        log_s += d;
        path.push(log_s);
    }

    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DT, FAST_PATH_STEPS};

    #[test]
    fn path_has_expected_length_and_start() {
        let cfg = RegimeConfig::for_regime(Regime::LowVol);
        let mut rng = EngineRng::seed_from_u64(42);
        let path = generate_path(&cfg, FAST_PATH_STEPS, DT, &mut rng);
        assert_eq!(path.len(), FAST_PATH_STEPS + 1);
        assert_eq!(path[0], 0.0);
        assert!(path.iter().all(|p| p.is_finite()));
    }

    #[test]
    fn jumpless_regime_moves_smoothly() {
        let cfg = RegimeConfig::for_regime(Regime::LowVol);
        let mut rng = EngineRng::seed_from_u64(7);
        let path = generate_path(&cfg, 365, DT, &mut rng);
        let max_step = path
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .fold(0.0, f64::max);
        // 0.3 annual vol is ~1.6% daily; 6 sigma is a safe ceiling.
        assert!(max_step < 0.1, "max step = {max_step}");
    }

    #[test]
    fn extreme_regime_stays_finite() {
        let cfg = RegimeConfig {
            volatility: 1.2,
            drift: 0.0,
            jump_intensity: 8.0,
            jump_mean: -0.08,
            jump_std: 0.2,
            mean_reversion: 0.0,
            anchor: 0.0,
            arb_responsiveness: 1.0,
            shift: None,
        };
        let mut rng = EngineRng::seed_from_u64(1);
        for _ in 0..20 {
            let path = generate_path(&cfg, FAST_PATH_STEPS, DT, &mut rng);
            assert!(path.iter().all(|p| p.is_finite()));
        }
    }

    #[test]
    fn regime_shift_raises_late_path_variance() {
        let cfg = RegimeConfig::for_regime(Regime::RegimeShift);
        let mut rng = EngineRng::seed_from_u64(13);
        let steps = 200;
        let mut early = Vec::new();
        let mut late = Vec::new();
        for _ in 0..50 {
            let path = generate_path(&cfg, steps, DT, &mut rng);
            for w in path[..steps / 4].windows(2) {
                early.push((w[1] - w[0]).abs());
            }
            for w in path[3 * steps / 4..].windows(2) {
                late.push((w[1] - w[0]).abs());
            }
        }
        let mean = |v: &[f64]| v.iter().sum::<f64>() / v.len() as f64;
        assert!(
            mean(&late) > mean(&early) * 1.5,
            "late moves should dominate: early {} late {}",
            mean(&early),
            mean(&late)
        );
    }
}
