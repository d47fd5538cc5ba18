// =============================================================================
// Subscription Coordinator — one live chart at a time
// =============================================================================
//
// Owns the active subscription: its candle series, indicator cache and
// streaming client. A subscription change runs in four steps:
//
//   1. bump the epoch, unsubscribe and close the current client
//   2. clear the series and cache, status -> Loading
//   3. backfill from the history collaborator
//   4. open a new client and spawn the pump that merges its updates
//
// Every deferred effect (backfill result, client installation, pumped
// update, status change) carries the epoch it was started under and is
// dropped if a newer selection has begun since.
//
// Thread safety:
//   - AtomicU64 epoch, compared before applying any deferred effect.
//   - parking_lot::RwLock around the chart state, never held across .await.
//   - parking_lot::Mutex around the active stream slot; clients are taken out
//     of the slot before being closed.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::{CoordinatorError, ValidationError};
use crate::indicators::{IndicatorCache, IndicatorOutput, IndicatorRequest};
use crate::market_data::candle_series::{Candle, CandleSeries};
use crate::market_data::history::HistoryFetcher;
use crate::market_data::stream_client::{StreamClient, StreamEvent};
use crate::market_data::transport::Connector;
use crate::runtime_config::{RuntimeConfig, StreamConfig};
use crate::types::{ConnectionState, SubscriptionKey};

// =============================================================================
// Public types
// =============================================================================

/// Feed-level status, the retry affordance for consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FeedStatus {
    Idle,
    Loading,
    Live,
    Failed { reason: String },
}

/// Result of a `select` that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectOutcome {
    /// The subscription is live with `candles` backfilled buckets.
    Applied { candles: usize },
    /// A newer selection started while this one was in flight.
    Superseded,
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub retention: usize,
    pub backfill_limit: usize,
    pub stream: StreamConfig,
}

impl From<&RuntimeConfig> for CoordinatorSettings {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            retention: config.retention,
            backfill_limit: config.backfill_limit,
            stream: config.stream.clone(),
        }
    }
}

/// Read-only view of the active chart.
#[derive(Debug, Clone, Serialize)]
pub struct ChartSnapshot {
    pub key: Option<SubscriptionKey>,
    pub status: FeedStatus,
    pub connection: ConnectionState,
    pub version: u64,
    pub candles: Vec<Candle>,
}

// =============================================================================
// Shared chart state
// =============================================================================

struct ChartState {
    key: Option<SubscriptionKey>,
    epoch: u64,
    series: CandleSeries,
    cache: IndicatorCache,
    connection: ConnectionState,
}

struct Shared {
    epoch: AtomicU64,
    chart: RwLock<ChartState>,
    status: watch::Sender<FeedStatus>,
}

impl Shared {
    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Publish `status` unless a newer selection owns the chart.
    fn set_status(&self, epoch: u64, status: FeedStatus) {
        let chart = self.chart.read();
        if chart.epoch == epoch && self.is_current(epoch) {
            self.status.send_replace(status);
        }
    }

    /// Loading/Live -> Failed once the stream has ended for good.
    fn stream_ended(&self, epoch: u64, reason: &str) -> bool {
        let chart = self.chart.read();
        chart.epoch == epoch
            && self.is_current(epoch)
            && self.status.send_if_modified(|status| {
                let active = matches!(status, FeedStatus::Loading | FeedStatus::Live);
                if active {
                    *status = FeedStatus::Failed {
                        reason: reason.to_string(),
                    };
                }
                active
            })
    }

    /// Loading -> Live, unless the stream already failed.
    fn go_live(&self, epoch: u64) {
        let chart = self.chart.read();
        if chart.epoch == epoch && self.is_current(epoch) {
            self.status.send_if_modified(|status| {
                let loading = *status == FeedStatus::Loading;
                if loading {
                    *status = FeedStatus::Live;
                }
                loading
            });
        }
    }
}

struct ActiveStream {
    client: StreamClient,
    pump: JoinHandle<()>,
}

impl ActiveStream {
    async fn shutdown(self) {
        let key = self.client.key().clone();
        if let Err(e) = self.client.unsubscribe() {
            debug!(key = %key, error = %e, "unsubscribe on closed client");
        }
        self.client.close().await;
        if let Err(e) = self.pump.await {
            warn!(key = %key, error = %e, "event pump ended abnormally");
        }
        info!(key = %key, "stream shut down");
    }
}

// =============================================================================
// Coordinator
// =============================================================================

pub struct Coordinator<H: HistoryFetcher, C: Connector> {
    history: Arc<H>,
    connector: Arc<C>,
    settings: CoordinatorSettings,
    shared: Arc<Shared>,
    active: Mutex<Option<ActiveStream>>,
}

impl<H: HistoryFetcher, C: Connector> Coordinator<H, C> {
    pub fn new(history: Arc<H>, connector: Arc<C>, settings: CoordinatorSettings) -> Self {
        let (status, _) = watch::channel(FeedStatus::Idle);
        let chart = ChartState {
            key: None,
            epoch: 0,
            series: CandleSeries::new(settings.retention),
            cache: IndicatorCache::new(),
            connection: ConnectionState::Disconnected,
        };
        Self {
            history,
            connector,
            settings,
            shared: Arc::new(Shared {
                epoch: AtomicU64::new(0),
                chart: RwLock::new(chart),
                status,
            }),
            active: Mutex::new(None),
        }
    }

    /// Switch the chart to `key`.
    ///
    /// Returns `Superseded` when a newer `select` started before this one
    /// finished; nothing from this call is applied in that case.
    pub async fn select(&self, key: SubscriptionKey) -> Result<SelectOutcome, CoordinatorError> {
        let key = SubscriptionKey::new(&key.symbol, key.timeframe);
        if key.symbol.is_empty() || !key.symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(CoordinatorError::InvalidSymbol(key.symbol));
        }

        // ── 1. New epoch, tear down the previous stream ─────────────────
        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        info!(key = %key, epoch, "selecting subscription");

        let previous = self.active.lock().take();
        if let Some(previous) = previous {
            previous.shutdown().await;
        }

        // ── 2. Reset chart ──────────────────────────────────────────────
        {
            let mut chart = self.shared.chart.write();
            if !self.shared.is_current(epoch) {
                return Ok(self.superseded(&key, epoch, "reset"));
            }
            chart.key = Some(key.clone());
            chart.epoch = epoch;
            chart.series = CandleSeries::new(self.settings.retention);
            chart.cache = IndicatorCache::new();
            chart.connection = ConnectionState::Disconnected;
            self.shared.status.send_replace(FeedStatus::Loading);
        }

        // ── 3. Backfill ─────────────────────────────────────────────────
        let fetched = self.history.fetch(&key, self.settings.backfill_limit).await;
        if !self.shared.is_current(epoch) {
            return Ok(self.superseded(&key, epoch, "backfill"));
        }

        let rows = match fetched {
            Ok(rows) => rows,
            Err(e) => {
                let reason = format!("{e:#}");
                error!(key = %key, error = %reason, "historical backfill failed");
                self.shared.set_status(
                    epoch,
                    FeedStatus::Failed {
                        reason: reason.clone(),
                    },
                );
                return Err(CoordinatorError::Backfill {
                    key: key.to_string(),
                    reason,
                });
            }
        };

        let series = CandleSeries::from_rows(&rows, self.settings.retention);
        let candles = series.len();
        {
            let mut chart = self.shared.chart.write();
            if chart.epoch != epoch || !self.shared.is_current(epoch) {
                return Ok(self.superseded(&key, epoch, "backfill"));
            }
            chart.series = series;
        }
        info!(key = %key, candles, rows = rows.len(), "backfill applied");

        // ── 4. Stream ───────────────────────────────────────────────────
        let (client, events) = StreamClient::open(
            Arc::clone(&self.connector),
            key.clone(),
            self.settings.stream.clone(),
        );
        let pump = tokio::spawn(pump(Arc::clone(&self.shared), epoch, key.clone(), events));
        let stream = ActiveStream { client, pump };

        let rejected = {
            let mut slot = self.active.lock();
            if self.shared.is_current(epoch) {
                *slot = Some(stream);
                None
            } else {
                Some(stream)
            }
        };
        if let Some(stream) = rejected {
            stream.shutdown().await;
            return Ok(self.superseded(&key, epoch, "install"));
        }

        self.shared.go_live(epoch);
        Ok(SelectOutcome::Applied { candles })
    }

    /// Select the current key again (after a failure, for instance).
    pub async fn retry(&self) -> Result<SelectOutcome, CoordinatorError> {
        let key = self.current_key().ok_or(CoordinatorError::NoSubscription)?;
        info!(key = %key, "retrying subscription");
        self.select(key).await
    }

    /// Close the active stream. The chart keeps its last state.
    pub async fn shutdown(&self) {
        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self.active.lock().take();
        if let Some(previous) = previous {
            previous.shutdown().await;
        }

        let mut chart = self.shared.chart.write();
        chart.epoch = epoch;
        chart.connection = ConnectionState::Closed;
        self.shared.status.send_replace(FeedStatus::Idle);
    }

    pub fn snapshot(&self) -> ChartSnapshot {
        let chart = self.shared.chart.read();
        ChartSnapshot {
            key: chart.key.clone(),
            status: self.shared.status.borrow().clone(),
            connection: chart.connection,
            version: chart.series.version(),
            candles: chart.series.to_vec(),
        }
    }

    pub fn indicator(
        &self,
        request: &IndicatorRequest,
    ) -> Result<Arc<IndicatorOutput>, ValidationError> {
        let mut chart = self.shared.chart.write();
        let ChartState { series, cache, .. } = &mut *chart;
        cache.get(request, series)
    }

    pub fn indicator_str(&self, config: &str) -> Result<Arc<IndicatorOutput>, ValidationError> {
        let mut chart = self.shared.chart.write();
        let ChartState { series, cache, .. } = &mut *chart;
        cache.get_str(config, series)
    }

    pub fn status(&self) -> watch::Receiver<FeedStatus> {
        self.shared.status.subscribe()
    }

    pub fn current_key(&self) -> Option<SubscriptionKey> {
        self.shared.chart.read().key.clone()
    }

    /// Indicator computations performed for the current subscription.
    pub fn indicator_computations(&self) -> u64 {
        self.shared.chart.read().cache.computations()
    }

    fn superseded(&self, key: &SubscriptionKey, epoch: u64, stage: &str) -> SelectOutcome {
        debug!(
            key = %key,
            epoch,
            current = self.shared.epoch.load(Ordering::SeqCst),
            stage,
            "discarding superseded selection"
        );
        SelectOutcome::Superseded
    }
}

// =============================================================================
// Event pump
// =============================================================================

/// Route client events into the chart until the client finishes.
async fn pump(
    shared: Arc<Shared>,
    epoch: u64,
    key: SubscriptionKey,
    mut events: mpsc::Receiver<StreamEvent>,
) {
    while let Some(event) = events.recv().await {
        apply_event(&shared, epoch, &key, event);
    }
    debug!(key = %key, epoch, "event pump finished");
}

fn apply_event(shared: &Shared, epoch: u64, key: &SubscriptionKey, event: StreamEvent) {
    match event {
        StreamEvent::Data(update) => {
            if update.symbol != key.symbol {
                debug!(expected = %key.symbol, got = %update.symbol, "ignoring update for another symbol");
                return;
            }
            let candle = Candle::from_update(&update, key.timeframe);
            let mut chart = shared.chart.write();
            if chart.epoch != epoch {
                return;
            }
            let outcome = chart.series.merge(candle);
            trace!(time = candle.time, ?outcome, "update merged");
        }
        StreamEvent::StateChanged(state) => {
            {
                let mut chart = shared.chart.write();
                if chart.epoch != epoch {
                    return;
                }
                chart.connection = state;
            }
            if state == ConnectionState::Closed && shared.stream_ended(epoch, "stream closed by server") {
                warn!(key = %key, "stream closed, feed will not update until retried");
            }
        }
        StreamEvent::Error(e) if e.is_fatal() => {
            error!(key = %key, error = %e, "stream failed permanently");
            shared.set_status(epoch, FeedStatus::Failed { reason: e.to_string() });
        }
        StreamEvent::Error(e) => {
            debug!(key = %key, error = %e, "recoverable stream error");
        }
    }
}
