// =============================================================================
// Moving Averages (SMA / EMA)
// =============================================================================
//
// SMA_t = mean(close_{t-period+1} ..= close_t), defined from index period-1.
//
// EMA is seeded with the first close and updated on every bar:
//   multiplier = 2 / (period + 1)
//   EMA_t      = EMA_{t-1} + (close_t - EMA_{t-1}) * multiplier
// Indices before period-1 are reported as None even though the recursion
// already runs there.
// =============================================================================

use super::finite;

/// Simple moving average, aligned with `values`.
///
/// A period longer than the input yields all `None` (same length as input).
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }

    for i in period - 1..values.len() {
        let window = &values[i + 1 - period..=i];
        out[i] = finite(window.iter().sum::<f64>() / period as f64);
    }
    out
}

/// The raw EMA recursion over every index, seeded with `values[0]`.
pub(crate) fn ema_raw(values: &[f64], period: usize) -> Vec<f64> {
    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut prev = match values.first() {
        Some(&v) => v,
        None => return out,
    };
    out.push(prev);
    for &v in &values[1..] {
        prev += (v - prev) * multiplier;
        out.push(prev);
    }
    out
}

/// Exponential moving average, aligned with `values`; `None` before
/// index `period - 1`.
pub fn ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if period == 0 {
        return vec![None; values.len()];
    }
    ema_raw(values, period)
        .into_iter()
        .enumerate()
        .map(|(i, v)| if i + 1 >= period { finite(v) } else { None })
        .collect()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: Option<f64>, b: f64) -> bool {
        a.is_some_and(|a| (a - b).abs() < 1e-10)
    }

    // ---- sma -------------------------------------------------------------

    #[test]
    fn sma_known_values() {
        let out = sma(&[10.0, 20.0, 30.0, 40.0, 50.0], 3);
        assert_eq!(out, vec![None, None, Some(20.0), Some(30.0), Some(40.0)]);
    }

    #[test]
    fn sma_period_longer_than_input() {
        assert_eq!(sma(&[1.0, 2.0], 5), vec![None, None]);
        assert!(sma(&[], 3).is_empty());
    }

    #[test]
    fn sma_period_one_is_identity() {
        assert_eq!(sma(&[3.0, 4.0], 1), vec![Some(3.0), Some(4.0)]);
    }

    #[test]
    fn sma_non_finite_window_is_none() {
        let out = sma(&[1.0, f64::NAN, 3.0, 4.0, 5.0], 2);
        assert_eq!(out[1], None);
        assert_eq!(out[2], None);
        assert_eq!(out[3], Some(3.5));
    }

    // ---- ema -------------------------------------------------------------

    #[test]
    fn ema_seeded_with_first_close() {
        let closes: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        let out = ema(&closes, 5);
        assert_eq!(out.len(), 10);
        assert!(out[..4].iter().all(Option::is_none));

        let mult = 2.0 / 6.0;
        let mut expected = 1.0;
        for (i, &c) in closes.iter().enumerate().skip(1) {
            expected += (c - expected) * mult;
            if i >= 4 {
                assert!(approx(out[i], expected), "index {i}: {:?} vs {expected}", out[i]);
            }
        }
    }

    #[test]
    fn ema_of_flat_series_is_flat() {
        let out = ema(&[7.0; 6], 3);
        assert_eq!(out, vec![None, None, Some(7.0), Some(7.0), Some(7.0), Some(7.0)]);
    }

    #[test]
    fn ema_empty_and_long_period() {
        assert!(ema(&[], 3).is_empty());
        assert_eq!(ema(&[1.0, 2.0], 10), vec![None, None]);
    }
}
