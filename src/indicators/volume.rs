// Volume bars with a moving average of volume.

use crate::market_data::candle_series::Candle;

use super::{finite, ma};

#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub volume: Vec<Option<f64>>,
    pub ma: Vec<Option<f64>>,
}

pub fn volume(candles: &[Candle], period: usize) -> Volume {
    let raw: Vec<f64> = candles.iter().map(|c| c.volume).collect();
    Volume {
        volume: raw.iter().copied().map(finite).collect(),
        ma: ma::sma(&raw, period),
    }
}
