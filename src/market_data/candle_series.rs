use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::market_data::history::HistoryRow;
use crate::types::{PriceUpdate, Timeframe};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// One OHLCV bucket. `time` is the bucket start in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Build the candle an inbound update contributes to its bucket.
    pub fn from_update(update: &PriceUpdate, timeframe: Timeframe) -> Self {
        Self {
            time: timeframe.bucket_start(update.timestamp),
            open: update.open,
            high: update.high,
            low: update.low,
            close: update.close,
            volume: update.volume,
        }
    }

    /// `low <= min(open, close) <= max(open, close) <= high`, all values
    /// finite and volume non-negative.
    pub fn is_consistent(&self) -> bool {
        let finite = [self.open, self.high, self.low, self.close, self.volume]
            .iter()
            .all(|v| v.is_finite());
        finite
            && self.volume >= 0.0
            && self.low <= self.open.min(self.close)
            && self.open.max(self.close) <= self.high
    }

    /// Fold a later tick of the same bucket into this candle.
    fn absorb(&mut self, update: &Candle) {
        self.close = update.close;
        self.high = self.high.max(update.high);
        self.low = self.low.min(update.low);
        self.volume += update.volume;
    }
}

/// What a merge did to the series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A new bucket was appended (possibly evicting the oldest one).
    Appended,
    /// The update refined the open bucket.
    Merged,
    /// The update belongs to a bucket older than the last one; ignored.
    Stale,
    /// The update broke the OHLC invariant; ignored.
    Rejected,
}

impl MergeOutcome {
    pub fn mutated(&self) -> bool {
        matches!(self, Self::Appended | Self::Merged)
    }
}

// ---------------------------------------------------------------------------
// CandleSeries -- bounded, strictly ascending ring of candles
// ---------------------------------------------------------------------------

/// Ring buffer of the most recent `max_len` buckets of one subscription.
///
/// Times are strictly increasing. Every mutation bumps `version`, which the
/// indicator cache uses as its invalidation tag.
#[derive(Debug, Clone)]
pub struct CandleSeries {
    candles: VecDeque<Candle>,
    max_len: usize,
    version: u64,
}

impl CandleSeries {
    /// Create an empty series that retains at most `max_len` candles
    /// (at least one).
    pub fn new(max_len: usize) -> Self {
        let max_len = max_len.max(1);
        Self {
            candles: VecDeque::with_capacity(max_len + 1),
            max_len,
            version: 0,
        }
    }

    /// Build a series from positional backfill rows
    /// (`[time, open, close, low, high, volume]`).
    ///
    /// Rows are sorted by time, inconsistent rows are skipped, rows sharing a
    /// time are folded together and only the newest `max_len` buckets are
    /// kept.
    pub fn from_rows(rows: &[HistoryRow], max_len: usize) -> Self {
        let mut candles: Vec<Candle> = rows.iter().map(HistoryRow::to_candle).collect();
        candles.sort_by_key(|c| c.time);

        let mut series = Self::new(max_len);
        let mut skipped = 0usize;
        for candle in candles {
            if !series.merge(candle).mutated() {
                skipped += 1;
            }
        }
        if skipped > 0 {
            warn!(skipped, kept = series.len(), "dropped inconsistent backfill rows");
        }
        series
    }

    /// Merge one candle into the series.
    ///
    /// * empty series, or a newer bucket: append, evicting from the front
    ///   while over `max_len`.
    /// * same bucket as the last candle: keep its open, take the new close,
    ///   widen high/low and add the volume.
    /// * older bucket: stale, the series is left untouched.
    pub fn merge(&mut self, candle: Candle) -> MergeOutcome {
        if !candle.is_consistent() {
            debug!(time = candle.time, "rejecting inconsistent candle");
            return MergeOutcome::Rejected;
        }

        let outcome = match self.candles.back().map(|c| c.time) {
            None => {
                self.candles.push_back(candle);
                MergeOutcome::Appended
            }
            Some(last_time) if candle.time == last_time => {
                if let Some(last) = self.candles.back_mut() {
                    last.absorb(&candle);
                }
                MergeOutcome::Merged
            }
            Some(last_time) if candle.time > last_time => {
                self.candles.push_back(candle);
                while self.candles.len() > self.max_len {
                    self.candles.pop_front();
                }
                MergeOutcome::Appended
            }
            Some(last_time) => {
                debug!(time = candle.time, last_time, "discarding out-of-order candle");
                MergeOutcome::Stale
            }
        };

        if outcome.mutated() {
            self.version += 1;
        }
        outcome
    }

    /// Monotonic mutation counter.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candle> {
        self.candles.iter()
    }

    /// Contiguous copy of the series, oldest first.
    pub fn to_vec(&self) -> Vec<Candle> {
        self.candles.iter().copied().collect()
    }

    /// The most recent `count` candles (oldest-first order).
    pub fn tail(&self, count: usize) -> Vec<Candle> {
        let start = self.candles.len().saturating_sub(count);
        self.candles.range(start..).copied().collect()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
