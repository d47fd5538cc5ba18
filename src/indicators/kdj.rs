// =============================================================================
// KDJ — Stochastic oscillator with a J line
// =============================================================================
//
//   RSV = (close - lowest low) / (highest high - lowest low) * 100
//   K   = ((k - 1) * K_prev + RSV) / k       seeded with the first RSV
//   D   = ((d - 1) * D_prev + K) / d         seeded with the first K
//   J   = 3K - 2D
//
// A window whose high equals its low has no RSV: K/D/J are None there and the
// next defined bar continues from the last defined K/D.
// =============================================================================

use crate::market_data::candle_series::Candle;

use super::finite;

#[derive(Debug, Clone, PartialEq)]
pub struct Kdj {
    pub k: Vec<Option<f64>>,
    pub d: Vec<Option<f64>>,
    pub j: Vec<Option<f64>>,
}

pub fn kdj(candles: &[Candle], period: usize, k_smooth: usize, d_smooth: usize) -> Kdj {
    let len = candles.len();
    let mut out = Kdj {
        k: vec![None; len],
        d: vec![None; len],
        j: vec![None; len],
    };
    if period == 0 || len < period {
        return out;
    }

    let ks = k_smooth.max(1) as f64;
    let ds = d_smooth.max(1) as f64;
    let mut prev: Option<(f64, f64)> = None;

    for i in period - 1..len {
        let window = &candles[i + 1 - period..=i];
        let high = window.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
        let low = window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
        let range = high - low;
        if range == 0.0 || !range.is_finite() {
            continue;
        }

        let rsv = (candles[i].close - low) / range * 100.0;
        let (k, d) = match prev {
            Some((pk, pd)) => {
                let k = ((ks - 1.0) * pk + rsv) / ks;
                (k, ((ds - 1.0) * pd + k) / ds)
            }
            None => (rsv, rsv),
        };
        if !k.is_finite() || !d.is_finite() {
            continue;
        }
        prev = Some((k, d));

        out.k[i] = Some(k);
        out.d[i] = Some(d);
        out.j[i] = finite(3.0 * k - 2.0 * d);
    }
    out
}
