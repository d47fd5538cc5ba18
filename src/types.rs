// =============================================================================
// Shared types used across the Aurora chart feed
// =============================================================================

use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// Candle interval of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
}

impl Default for Timeframe {
    fn default() -> Self {
        Self::D1
    }
}

impl Timeframe {
    pub const ALL: [Timeframe; 8] = [
        Self::M1,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H4,
        Self::D1,
        Self::W1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
            Self::W1 => "1w",
        }
    }

    /// Length of one bucket in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        match self {
            Self::M1 => 60_000,
            Self::M5 => 300_000,
            Self::M15 => 900_000,
            Self::M30 => 1_800_000,
            Self::H1 => 3_600_000,
            Self::H4 => 14_400_000,
            Self::D1 => 86_400_000,
            Self::W1 => 604_800_000,
        }
    }

    /// Align a millisecond timestamp to the start of the bucket containing it.
    ///
    /// Intraday and daily buckets sit on the UTC epoch grid. Weekly buckets
    /// start on Monday 00:00 UTC (the epoch itself was a Thursday, so a plain
    /// modulo would be off by three days).
    pub fn bucket_start(&self, timestamp_ms: i64) -> i64 {
        match self {
            Self::W1 => {
                let day_start = timestamp_ms.div_euclid(Self::D1.duration_ms()) * Self::D1.duration_ms();
                match DateTime::<Utc>::from_timestamp_millis(day_start) {
                    Some(day) => {
                        let back = i64::from(day.weekday().num_days_from_monday());
                        (day - ChronoDuration::days(back)).timestamp_millis()
                    }
                    None => day_start,
                }
            }
            other => {
                let width = other.duration_ms();
                timestamp_ms.div_euclid(width) * width
            }
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|tf| tf.as_str() == wanted)
            .ok_or_else(|| format!("unsupported timeframe: {s}"))
    }
}

/// Identifies one live chart: a symbol at a given interval.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl SubscriptionKey {
    /// Build a key, normalising the symbol to upper case.
    pub fn new(symbol: impl AsRef<str>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.as_ref().trim().to_uppercase(),
            timeframe,
        }
    }
}

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

/// Lifecycle state of a streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Reconnecting => write!(f, "Reconnecting"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Outbound control frame: `{ "type": ..., "symbol": ..., "timeframe": ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Subscribe { symbol: String, timeframe: Timeframe },
    Unsubscribe { symbol: String, timeframe: Timeframe },
    Ping { symbol: String, timeframe: Timeframe },
}

impl ControlMessage {
    pub fn subscribe(key: &SubscriptionKey) -> Self {
        Self::Subscribe {
            symbol: key.symbol.clone(),
            timeframe: key.timeframe,
        }
    }

    pub fn unsubscribe(key: &SubscriptionKey) -> Self {
        Self::Unsubscribe {
            symbol: key.symbol.clone(),
            timeframe: key.timeframe,
        }
    }

    pub fn ping(key: &SubscriptionKey) -> Self {
        Self::Ping {
            symbol: key.symbol.clone(),
            timeframe: key.timeframe,
        }
    }
}

/// A validated inbound price update, as decoded from the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub symbol: String,
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_parse_and_display() {
        assert_eq!("4H".parse::<Timeframe>().unwrap(), Timeframe::H4);
        assert_eq!(Timeframe::M15.to_string(), "15m");
        assert!("2m".parse::<Timeframe>().is_err());
    }

    #[test]
    fn intraday_bucket_alignment() {
        // 2023-11-14T22:13:20Z
        let ts = 1_700_000_000_000;
        assert_eq!(Timeframe::M1.bucket_start(ts), 1_699_999_980_000);
        assert_eq!(Timeframe::H1.bucket_start(ts), 1_699_999_200_000);
        assert_eq!(Timeframe::D1.bucket_start(ts), 1_699_920_000_000);
        assert_eq!(Timeframe::M5.bucket_start(1_699_999_980_000), 1_699_999_800_000);
    }

    #[test]
    fn weekly_bucket_starts_on_monday() {
        // 2023-11-14 is a Tuesday; the week began Monday 2023-11-13.
        let ts = 1_700_000_000_000;
        assert_eq!(Timeframe::W1.bucket_start(ts), 1_699_833_600_000);
        // A Monday midnight is already aligned.
        assert_eq!(Timeframe::W1.bucket_start(1_699_833_600_000), 1_699_833_600_000);
    }

    #[test]
    fn key_normalises_symbol() {
        let key = SubscriptionKey::new(" btcusdt ", Timeframe::M1);
        assert_eq!(key.symbol, "BTCUSDT");
        assert_eq!(key.to_string(), "BTCUSDT@1m");
    }

    #[test]
    fn control_message_wire_shape() {
        let key = SubscriptionKey::new("ethusdt", Timeframe::H1);
        let json = serde_json::to_value(ControlMessage::subscribe(&key)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "type": "subscribe", "symbol": "ETHUSDT", "timeframe": "1h" })
        );
        let ping = serde_json::to_value(ControlMessage::ping(&key)).unwrap();
        assert_eq!(ping["type"], "ping");
    }
}
