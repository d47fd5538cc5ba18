// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Bollinger Bands consist of a middle band (SMA), an upper band (SMA + k*σ),
// and a lower band (SMA - k*σ), where σ is the population standard deviation
// of the trailing `period` closes.
// =============================================================================

use super::{finite, ma};

/// The three band lines, each aligned with the input closes.
#[derive(Debug, Clone, PartialEq)]
pub struct BollingerBands {
    pub upper: Vec<Option<f64>>,
    pub mid: Vec<Option<f64>>,
    pub lower: Vec<Option<f64>>,
}

/// Compute the bands for every index; `None` until `period` closes exist.
pub fn bollinger(closes: &[f64], period: usize, multiplier: f64) -> BollingerBands {
    let mid = ma::sma(closes, period);
    let mut upper = vec![None; closes.len()];
    let mut lower = vec![None; closes.len()];

    for (i, avg) in mid.iter().enumerate() {
        let Some(avg) = *avg else { continue };
        let window = &closes[i + 1 - period..=i];
        let variance = window.iter().map(|x| (x - avg).powi(2)).sum::<f64>() / period as f64;
        let std_dev = variance.sqrt();

        upper[i] = finite(avg + multiplier * std_dev);
        lower[i] = finite(avg - multiplier * std_dev);
    }

    BollingerBands { upper, mid, lower }
}
