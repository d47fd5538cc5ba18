// =============================================================================
// Relative Strength Index (RSI) — Wilder's Smoothing
// =============================================================================
//
// Step 1 — Compute price changes (deltas) from consecutive closes.
// Step 2 — Seed average gain / average loss with the mean of the first
//          `period` gains / losses.
// Step 3 — Apply Wilder's smoothing:
//            avg_gain = (prev_avg_gain * (period - 1) + current_gain) / period
//            avg_loss = (prev_avg_loss * (period - 1) + current_loss) / period
// Step 4 — RSI = 100 - 100 / (1 + avg_gain / avg_loss), or 100 when there
//          were no losses at all.
//
// The first value sits at index `period` (it needs `period` deltas).
// =============================================================================

use super::finite;

/// RSI aligned with `closes`; `None` for the first `period` entries.
pub fn rsi(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if period == 0 || closes.len() < period + 1 {
        return out;
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let gain = |d: f64| d.max(0.0);
    let loss = |d: f64| (-d).max(0.0);

    let period_f = period as f64;
    let mut avg_gain = deltas[..period].iter().copied().map(gain).sum::<f64>() / period_f;
    let mut avg_loss = deltas[..period].iter().copied().map(loss).sum::<f64>() / period_f;
    out[period] = rsi_from_averages(avg_gain, avg_loss);

    for (i, &d) in deltas.iter().enumerate().skip(period) {
        avg_gain = (avg_gain * (period_f - 1.0) + gain(d)) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss(d)) / period_f;
        // delta i sits between close i and close i+1
        out[i + 1] = rsi_from_averages(avg_gain, avg_loss);
    }
    out
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    if avg_loss == 0.0 {
        return avg_gain.is_finite().then_some(100.0);
    }
    finite(100.0 - 100.0 / (1.0 + avg_gain / avg_loss))
}
