// =============================================================================
// Historical backfill — positional kline rows from a REST endpoint
// =============================================================================
//
// The coordinator only depends on the `HistoryFetcher` trait; the HTTP
// client below is the default collaborator used by the binary.
// =============================================================================

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::market_data::candle_series::Candle;
use crate::types::SubscriptionKey;

/// One backfill row in positional form: `[time, open, close, low, high, volume]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow(pub i64, pub f64, pub f64, pub f64, pub f64, pub f64);

impl HistoryRow {
    pub fn to_candle(&self) -> Candle {
        let HistoryRow(time, open, close, low, high, volume) = *self;
        Candle::new(time, open, high, low, close, volume)
    }
}

/// Source of the initial candle batch for a subscription.
pub trait HistoryFetcher: Send + Sync + 'static {
    fn fetch(
        &self,
        key: &SubscriptionKey,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<HistoryRow>>> + Send;
}

// ---------------------------------------------------------------------------
// REST implementation
// ---------------------------------------------------------------------------

/// `GET {base}/klines?symbol=S&interval=TF&limit=N`, answered with a JSON
/// array of positional rows. Numeric cells may be numbers or strings.
#[derive(Clone)]
pub struct RestHistoryClient {
    base_url: String,
    client: reqwest::Client,
}

impl RestHistoryClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client")?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(base_url = %base_url, "RestHistoryClient initialised");

        Ok(Self { base_url, client })
    }

    fn klines_url(&self, key: &SubscriptionKey, limit: usize) -> String {
        format!(
            "{}/klines?symbol={}&interval={}&limit={}",
            self.base_url, key.symbol, key.timeframe, limit
        )
    }
}

impl HistoryFetcher for RestHistoryClient {
    #[instrument(skip(self, key), fields(key = %key), name = "history::fetch")]
    async fn fetch(&self, key: &SubscriptionKey, limit: usize) -> Result<Vec<HistoryRow>> {
        let url = self.klines_url(key, limit);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /klines request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!("GET /klines returned {}: {}", status, body);
        }

        let rows = parse_rows(&body)?;
        debug!(count = rows.len(), "klines fetched");
        Ok(rows)
    }
}

/// Parse a JSON array of positional rows. Rows with fewer than six cells are
/// skipped; a cell that is neither a number nor a numeric string fails the
/// whole batch.
pub fn parse_rows(body: &serde_json::Value) -> Result<Vec<HistoryRow>> {
    let raw = body.as_array().context("klines response is not an array")?;

    let mut rows = Vec::with_capacity(raw.len());
    for entry in raw {
        let arr = entry.as_array().context("kline entry is not an array")?;

        if arr.len() < 6 {
            warn!("skipping malformed kline entry with {} elements", arr.len());
            continue;
        }

        let time = parse_f64(&arr[0], "time")? as i64;
        rows.push(HistoryRow(
            time,
            parse_f64(&arr[1], "open")?,
            parse_f64(&arr[2], "close")?,
            parse_f64(&arr[3], "low")?,
            parse_f64(&arr[4], "high")?,
            parse_f64(&arr[5], "volume")?,
        ));
    }
    Ok(rows)
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

impl std::fmt::Debug for RestHistoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestHistoryClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Scripted history for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::HashMap;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::sync::Notify;

    use super::*;

    /// Serves canned rows per symbol. A symbol can be gated (the fetch waits
    /// for a notification) or made to fail a number of times.
    #[derive(Default)]
    pub struct MockHistory {
        rows: Mutex<HashMap<String, Vec<HistoryRow>>>,
        gates: Mutex<HashMap<String, Arc<Notify>>>,
        failures: Mutex<HashMap<String, u32>>,
    }

    impl MockHistory {
        pub fn with_rows(self, symbol: &str, rows: Vec<HistoryRow>) -> Self {
            self.rows.lock().insert(symbol.to_string(), rows);
            self
        }

        pub fn gate(&self, symbol: &str) -> Arc<Notify> {
            let gate = Arc::new(Notify::new());
            self.gates.lock().insert(symbol.to_string(), Arc::clone(&gate));
            gate
        }

        pub fn fail_times(&self, symbol: &str, times: u32) {
            self.failures.lock().insert(symbol.to_string(), times);
        }
    }

    impl HistoryFetcher for MockHistory {
        async fn fetch(&self, key: &SubscriptionKey, limit: usize) -> Result<Vec<HistoryRow>> {
            let gate = self.gates.lock().get(&key.symbol).cloned();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            let fail = {
                let mut failures = self.failures.lock();
                match failures.get_mut(&key.symbol) {
                    Some(n) if *n > 0 => {
                        *n -= 1;
                        true
                    }
                    _ => false,
                }
            };
            if fail {
                anyhow::bail!("history service unavailable");
            }
            let rows = self.rows.lock().get(&key.symbol).cloned().unwrap_or_default();
            let start = rows.len().saturating_sub(limit);
            Ok(rows[start..].to_vec())
        }
    }
}
