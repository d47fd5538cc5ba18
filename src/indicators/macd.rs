// =============================================================================
// MACD — Moving Average Convergence / Divergence
// =============================================================================
//
//   DIF       = EMA(short) - EMA(long)          defined from max(short,long)-1
//   DEA       = EMA(signal) of the defined DIF values, seeded with the first
//   HISTOGRAM = DIF - DEA
// =============================================================================

use super::{finite, ma};

#[derive(Debug, Clone, PartialEq)]
pub struct Macd {
    pub dif: Vec<Option<f64>>,
    pub dea: Vec<Option<f64>>,
    pub histogram: Vec<Option<f64>>,
}

pub fn macd(closes: &[f64], short: usize, long: usize, signal: usize) -> Macd {
    let len = closes.len();
    let mut out = Macd {
        dif: vec![None; len],
        dea: vec![None; len],
        histogram: vec![None; len],
    };

    let start = short.max(long).saturating_sub(1);
    if signal == 0 || len <= start {
        return out;
    }

    let fast = ma::ema_raw(closes, short);
    let slow = ma::ema_raw(closes, long);
    let dif_tail: Vec<f64> = (start..len).map(|i| fast[i] - slow[i]).collect();
    let dea_tail = ma::ema_raw(&dif_tail, signal);

    for (j, (&dif, &dea)) in dif_tail.iter().zip(&dea_tail).enumerate() {
        let i = start + j;
        out.dif[i] = finite(dif);
        if j + 1 >= signal {
            out.dea[i] = finite(dea);
            out.histogram[i] = finite(dif - dea);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_warm_up_boundaries() {
        let closes: Vec<f64> = (0..60).map(|x| 100.0 + x as f64 * 0.5).collect();
        let m = macd(&closes, 12, 26, 9);

        assert_eq!(m.dif.len(), 60);
        assert!(m.dif[..25].iter().all(Option::is_none));
        assert!(m.dif[25..].iter().all(Option::is_some));
        // DEA needs 9 defined DIF values: first at 25 + 8
        assert!(m.dea[..33].iter().all(Option::is_none));
        assert!(m.dea[33..].iter().all(Option::is_some));
        assert_eq!(
            m.histogram.iter().position(Option::is_some),
            m.dea.iter().position(Option::is_some)
        );
    }

    #[test]
    fn macd_histogram_is_dif_minus_dea() {
        let closes: Vec<f64> = (0..50).map(|x| (x as f64 / 3.0).sin() * 10.0 + 100.0).collect();
        let m = macd(&closes, 5, 10, 4);
        for i in 0..closes.len() {
            if let (Some(dif), Some(dea), Some(h)) = (m.dif[i], m.dea[i], m.histogram[i]) {
                assert!((dif - dea - h).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn macd_rising_series_has_positive_dif() {
        let closes: Vec<f64> = (0..40).map(|x| x as f64).collect();
        let m = macd(&closes, 3, 6, 3);
        assert!(m.dif[5..].iter().all(|v| v.unwrap() > 0.0));
    }

    #[test]
    fn macd_short_input() {
        let m = macd(&[1.0, 2.0, 3.0], 12, 26, 9);
        assert_eq!(m.dif, vec![None; 3]);
        assert_eq!(m.histogram, vec![None; 3]);
    }
}
