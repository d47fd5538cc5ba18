// =============================================================================
// Runtime Configuration — Feed settings with atomic save
// =============================================================================
//
// Every tunable of the chart feed lives here: which chart is opened at
// startup, where the stream and history endpoints are, how much history is
// retained, and the streaming client's reconnect / heartbeat policy.
//
// All fields carry `#[serde(default)]` so that adding new fields never breaks
// loading an older config file. Persistence uses the tmp + rename pattern.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::Timeframe;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_reconnect_interval_ms() -> u64 {
    5_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_max_queued_messages() -> usize {
    256
}

fn default_event_buffer() -> usize {
    1024
}

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_ws_url() -> String {
    "ws://127.0.0.1:9001/ws?symbol={symbol}&interval={timeframe}".to_string()
}

fn default_history_url() -> String {
    "http://127.0.0.1:9000/api/v1".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_retention() -> usize {
    1000
}

fn default_backfill_limit() -> usize {
    1000
}

fn default_indicators() -> Vec<String> {
    vec!["MA(5)".to_string(), "BOLL(20,2)".to_string()]
}

// =============================================================================
// StreamConfig
// =============================================================================

/// Connection policy of a single streaming client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Retry after an abnormal closure. Clean closes never retry.
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Fixed delay between reconnect attempts.
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Consecutive failed attempts before the client gives up.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Keep-alive period while connected.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Outbound messages held while disconnected; the oldest is dropped on
    /// overflow.
    #[serde(default = "default_max_queued_messages")]
    pub max_queued_messages: usize,

    /// Capacity of the event channel towards the owner. A full channel stops
    /// the client from reading the socket.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_interval_ms: default_reconnect_interval_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_queued_messages: default_max_queued_messages(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl StreamConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// Heartbeat period, floored at 1 ms so a zero never spins the loop.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration of the feed service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Initial chart ------------------------------------------------------

    /// Symbol opened at startup.
    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// Timeframe opened at startup.
    #[serde(default)]
    pub timeframe: Timeframe,

    /// Indicators logged for the active chart, in `NAME(a,b)` notation.
    #[serde(default = "default_indicators")]
    pub indicators: Vec<String>,

    // --- Endpoints ----------------------------------------------------------

    /// Stream URL template; `{symbol}` and `{timeframe}` are substituted.
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    /// Base URL of the historical klines endpoint.
    #[serde(default = "default_history_url")]
    pub history_url: String,

    /// Address of the chart API.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // --- Series -------------------------------------------------------------

    /// Candles kept per series; older buckets are evicted from the front.
    #[serde(default = "default_retention")]
    pub retention: usize,

    /// Rows requested from the history endpoint on every subscription change.
    #[serde(default = "default_backfill_limit")]
    pub backfill_limit: usize,

    // --- Streaming client ---------------------------------------------------

    #[serde(default)]
    pub stream: StreamConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            timeframe: Timeframe::default(),
            indicators: default_indicators(),
            ws_url: default_ws_url(),
            history_url: default_history_url(),
            bind_addr: default_bind_addr(),
            retention: default_retention(),
            backfill_limit: default_backfill_limit(),
            stream: StreamConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.symbol,
            timeframe = %config.timeframe,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply `FEED_*` environment overrides on top of the file values.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(symbol) = std::env::var("FEED_SYMBOL") {
            let symbol = symbol.trim().to_uppercase();
            if !symbol.is_empty() {
                self.symbol = symbol;
            }
        }
        if let Ok(tf) = std::env::var("FEED_TIMEFRAME") {
            self.timeframe = tf
                .parse()
                .map_err(anyhow::Error::msg)
                .context("invalid FEED_TIMEFRAME")?;
        }
        if let Ok(url) = std::env::var("FEED_WS_URL") {
            self.ws_url = url;
        }
        if let Ok(url) = std::env::var("FEED_HISTORY_URL") {
            self.history_url = url;
        }
        if let Ok(addr) = std::env::var("FEED_BIND_ADDR") {
            self.bind_addr = addr;
        }
        Ok(())
    }
}
