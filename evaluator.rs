//! Multi-path evaluator.
//!
//! Runs a candidate through several fresh stochastic paths and aggregates:
//! metrics are averaged over the eval paths only, while stability is the
//! spread of `lp_value_vs_hodl` across every path simulated (train + eval).
//! One extra path produces a normalized equity curve for display.

use crate::paths::{generate_path, RegimeConfig};
use crate::rng::EngineRng;
use crate::simulator::simulate_path;
use crate::types::{EngineConfig, Metrics, MAX_PATHS_PER_EVAL};

#[derive(Clone, Debug)]
pub struct Evaluation {
    pub metrics: Metrics,
    pub stability: f64,
    pub equity_curve: Vec<f64>,
    /// Paths simulated, excluding the display path.
    pub paths_run: usize,
}

/// Evaluate a bin density against one regime.
pub fn evaluate_candidate(
    bins: &[f64],
    regime_cfg: &RegimeConfig,
    cfg: &EngineConfig,
    rng: &mut EngineRng,
) -> Evaluation {
    let n_train = cfg.train_paths.min(MAX_PATHS_PER_EVAL);
    let n_eval = cfg.eval_paths.min(MAX_PATHS_PER_EVAL).max(1);

    let mut lp_values = Vec::with_capacity(n_train + n_eval);

    for _ in 0..n_train {
        let path = generate_path(regime_cfg, cfg.path_steps, cfg.dt, rng);
        let outcome = simulate_path(bins, &path, regime_cfg, rng);
        lp_values.push(outcome.metrics.lp_value_vs_hodl);
    }

    let mut acc = Metrics::default();
    for _ in 0..n_eval {
        let path = generate_path(regime_cfg, cfg.path_steps, cfg.dt, rng);
        let outcome = simulate_path(bins, &path, regime_cfg, rng);
        let m = outcome.metrics;
        acc.total_fees += m.total_fees;
        acc.total_slippage += m.total_slippage;
        acc.arb_leakage += m.arb_leakage;
        acc.liquidity_utilization += m.liquidity_utilization;
        acc.lp_value_vs_hodl += m.lp_value_vs_hodl;
        acc.max_drawdown += m.max_drawdown;
        acc.volatility_of_returns += m.volatility_of_returns;
        lp_values.push(m.lp_value_vs_hodl);
    }

    let k = n_eval as f64;
    let metrics = Metrics {
        total_fees: acc.total_fees / k,
        total_slippage: acc.total_slippage / k,
        arb_leakage: acc.arb_leakage / k,
        liquidity_utilization: acc.liquidity_utilization / k,
        lp_value_vs_hodl: acc.lp_value_vs_hodl / k,
        max_drawdown: acc.max_drawdown / k,
        volatility_of_returns: acc.volatility_of_returns / k,
    };

    let stability = {
        let n = lp_values.len() as f64;
        let mean = lp_values.iter().sum::<f64>() / n;
        (lp_values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
    };

    let display_path = generate_path(regime_cfg, cfg.path_steps, cfg.dt, rng);
    let equity_curve = simulate_path(bins, &display_path, regime_cfg, rng).equity;

    Evaluation {
        metrics,
        stability,
        equity_curve,
        paths_run: n_train + n_eval,
    }
}
