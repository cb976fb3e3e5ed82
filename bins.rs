//! Bin density model.
//!
//! A liquidity shape is `N_BINS` non-negative masses tiling the log-price
//! axis `[LOG_PRICE_MIN, LOG_PRICE_MAX]` uniformly, always summing to
//! `TOTAL_LIQUIDITY`. Mass below the reference price backs the Y reserve,
//! mass above backs X; trades walk bins outward from the reference bin.

use crate::types::{
    BIN_WIDTH, LOG_PRICE_MAX, LOG_PRICE_MIN, N_BINS, TOTAL_LIQUIDITY,
};

const MIN_RESERVE: f64 = 1e-12;

/// Center of bin `i` on the log-price axis.
#[inline]
pub fn bin_center(i: usize) -> f64 {
    LOG_PRICE_MIN + (i as f64 + 0.5) * BIN_WIDTH
}

/// Bin containing `log_price`, clamped to the tiled range.
#[inline]
pub fn bin_index(log_price: f64) -> usize {
    let raw = (log_price - LOG_PRICE_MIN) / BIN_WIDTH;
    (raw.floor().max(0.0) as usize).min(N_BINS - 1)
}

/// Rescale `bins` in place so the total mass equals `TOTAL_LIQUIDITY`.
///
/// A degenerate input (non-positive or non-finite sum) becomes the uniform
/// density. Already-normalized input is left untouched, which makes the
/// operation exactly idempotent.
pub fn normalize(bins: &mut [f64]) {
    let sum: f64 = bins.iter().sum();
    if !sum.is_finite() || sum <= 0.0 {
        let uniform = TOTAL_LIQUIDITY / bins.len() as f64;
        bins.iter_mut().for_each(|b| *b = uniform);
        return;
    }
    if (sum - TOTAL_LIQUIDITY).abs() < 1e-9 {
        return;
    }
    let scale = TOTAL_LIQUIDITY / sum;
    bins.iter_mut().for_each(|b| *b *= scale);
}

/// True when neither half of the bins carries more than 95% of the mass.
pub fn halves_balanced(bins: &[f64]) -> bool {
    let mid = bins.len() / 2;
    let left: f64 = bins[..mid].iter().sum();
    let right: f64 = bins[mid..].iter().sum();
    let total = left + right;
    if total <= 0.0 {
        return false;
    }
    (left - right).abs() / total <= 0.9
}

/// Split the density into reserves around `ref_log_price`.
///
/// Bins entirely below the reference contribute to `reserve_y`, bins entirely
/// above to `reserve_x`; the straddling bin splits by the linear fraction of
/// its interval below the reference. Both reserves are floored at 1e-12.
pub fn derive_reserves(bins: &[f64], ref_log_price: f64) -> (f64, f64) {
    let mut reserve_x = 0.0;
    let mut reserve_y = 0.0;
    for (i, &mass) in bins.iter().enumerate() {
        let lo = LOG_PRICE_MIN + i as f64 * BIN_WIDTH;
        let hi = lo + BIN_WIDTH;
        if hi <= ref_log_price {
            reserve_y += mass;
        } else if lo >= ref_log_price {
            reserve_x += mass;
        } else {
            let frac_below = (ref_log_price - lo) / BIN_WIDTH;
            reserve_y += mass * frac_below;
            reserve_x += mass * (1.0 - frac_below);
        }
    }
    (reserve_x.max(MIN_RESERVE), reserve_y.max(MIN_RESERVE))
}

// ─── Price impact ─────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TradeDirection {
    Buy,
    Sell,
}

#[derive(Clone, Copy, Debug)]
pub struct PriceImpact {
    /// Amount received by the trader, in the output asset.
    pub output: f64,
    /// |1 - output / ideal_output|, clamped to [0, 1].
    pub slippage: f64,
    /// Pool log-price after the trade, clamped to the tiled range.
    pub new_log_price: f64,
}

/// Quote a trade of `size` against the density without mutating it.
pub fn price_impact(
    bins: &[f64],
    ref_log_price: f64,
    size: f64,
    direction: TradeDirection,
) -> PriceImpact {
    let mut working = bins.to_vec();
    consume(&mut working, ref_log_price, size, direction)
}

/// Execute a trade against a working copy of the density, consuming mass from
/// the bins it walks. Buys walk from the reference bin downward and convert
/// consumed mass to X output at each bin's center price, pushing the pool
/// price up; sells walk upward, convert to Y output and push the price down.
/// An empty bin is walked through with a full bin-width price move.
pub(crate) fn consume(
    bins: &mut [f64],
    ref_log_price: f64,
    size: f64,
    direction: TradeDirection,
) -> PriceImpact {
    let start = bin_index(ref_log_price);
    let mut remaining = size.max(0.0);
    let mut output = 0.0;
    let mut shift = 0.0;

    match direction {
        TradeDirection::Buy => {
            let mut i = start as isize;
            while i >= 0 && remaining > MIN_RESERVE {
                let idx = i as usize;
                let mass = bins[idx];
                if mass <= MIN_RESERVE {
                    shift += BIN_WIDTH;
                    i -= 1;
                    continue;
                }
                let take = mass.min(remaining);
                output += take / bin_center(idx).exp();
                bins[idx] -= take;
                remaining -= take;
                shift += BIN_WIDTH * (take / mass);
                i -= 1;
            }
        }
        TradeDirection::Sell => {
            let mut i = start;
            while i < bins.len() && remaining > MIN_RESERVE {
                let mass = bins[i];
                if mass <= MIN_RESERVE {
                    shift += BIN_WIDTH;
                    i += 1;
                    continue;
                }
                let take = mass.min(remaining);
                output += take * bin_center(i).exp();
                bins[i] -= take;
                remaining -= take;
                shift += BIN_WIDTH * (take / mass);
                i += 1;
            }
        }
    }

    let new_log_price = match direction {
        TradeDirection::Buy => (ref_log_price + shift).min(LOG_PRICE_MAX),
        TradeDirection::Sell => (ref_log_price - shift).max(LOG_PRICE_MIN),
    };

    let ideal_output = match direction {
        TradeDirection::Buy => size / ref_log_price.exp(),
        TradeDirection::Sell => size * ref_log_price.exp(),
    };
    let slippage = if ideal_output > 0.0 {
        (1.0 - output / ideal_output).abs().clamp(0.0, 1.0)
    } else {
        0.0
    };

    PriceImpact {
        output,
        slippage,
        new_log_price,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_bins() -> Vec<f64> {
        vec![TOTAL_LIQUIDITY / N_BINS as f64; N_BINS]
    }

    #[test]
    fn normalize_recovers_degenerate_input() {
        let mut bins = vec![0.0; N_BINS];
        normalize(&mut bins);
        let sum: f64 = bins.iter().sum();
        assert!((sum - TOTAL_LIQUIDITY).abs() < 1e-9);
        assert!(bins.iter().all(|&b| b > 0.0));
    }

    #[test]
    fn reserves_split_sums_to_total() {
        let bins = uniform_bins();
        for ref_lp in [-1.7, -0.3, 0.0, 0.013, 0.9, 1.99] {
            let (x, y) = derive_reserves(&bins, ref_lp);
            assert!(
                (x + y - TOTAL_LIQUIDITY).abs() < 1e-6,
                "x+y = {} at ref {ref_lp}",
                x + y
            );
        }
    }

    #[test]
    fn straddling_bin_splits_linearly() {
        let bins = uniform_bins();
        let per_bin = TOTAL_LIQUIDITY / N_BINS as f64;
        // Quarter of the way into bin 32.
        let ref_lp = LOG_PRICE_MIN + 32.0 * BIN_WIDTH + 0.25 * BIN_WIDTH;
        let (_, y) = derive_reserves(&bins, ref_lp);
        let expect_y = 32.0 * per_bin + 0.25 * per_bin;
        assert!((y - expect_y).abs() < 1e-9, "y = {y}, expected {expect_y}");
    }

    #[test]
    fn buy_impact_is_finite_and_bounded() {
        let bins = uniform_bins();
        for size in [0.1, 5.0, 100.0, 5000.0] {
            let pi = price_impact(&bins, 0.0, size, TradeDirection::Buy);
            assert!(pi.output.is_finite());
            assert!((0.0..=1.0).contains(&pi.slippage), "slippage = {}", pi.slippage);
            assert!((LOG_PRICE_MIN..=LOG_PRICE_MAX).contains(&pi.new_log_price));
        }
    }

    #[test]
    fn oversized_trade_clamps_at_range_boundary() {
        let bins = uniform_bins();
        let pi = price_impact(&bins, 0.0, TOTAL_LIQUIDITY * 2.0, TradeDirection::Sell);
        assert_eq!(pi.new_log_price, LOG_PRICE_MIN);
        assert!(pi.slippage <= 1.0);
    }
}
