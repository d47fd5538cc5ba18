// =============================================================================
// Streaming Client — connection lifecycle, heartbeat, reconnect and decode
// =============================================================================
//
// One client owns one logical subscription. A spawned driver task owns the
// connection, the heartbeat and reconnect timers and the outbound queue; the
// handle talks to it over a command channel and the owner receives
// `StreamEvent`s over a bounded channel. A full event channel stops the
// driver from reading the socket until the owner catches up.
//
// State machine:
//
//   Disconnected -> Connecting -> Connected -(abnormal)-> Reconnecting
//   Reconnecting -(retry ok)-> Connected
//   Reconnecting -(max attempts)-> Closed   (ExhaustedRetries)
//   Connected -(clean close / close())-> Closed
//
// With auto-reconnect disabled an abnormal closure parks the client in
// Disconnected until `reconnect()` or `close()`.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

use crate::error::{DecodeError, StreamError};
use crate::market_data::transport::{Connection, Connector, Frame};
use crate::runtime_config::StreamConfig;
use crate::types::{ConnectionState, ControlMessage, PriceUpdate, SubscriptionKey};

/// What the client reports to its owner, in receipt order.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Data(PriceUpdate),
    Error(StreamError),
    StateChanged(ConnectionState),
}

enum Command {
    Send(ControlMessage),
    Reconnect,
    Close,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Handle to a running client. Dropping it aborts the driver; `close()` shuts
/// it down deterministically.
pub struct StreamClient {
    key: SubscriptionKey,
    session_id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    attempts: Arc<AtomicU32>,
    task: Option<JoinHandle<()>>,
}

impl StreamClient {
    /// Spawn the driver and start connecting. Returns the handle and the
    /// event receiver; keep draining events while awaiting `close()`.
    pub fn open<C: Connector>(
        connector: Arc<C>,
        key: SubscriptionKey,
        config: StreamConfig,
    ) -> (Self, mpsc::Receiver<StreamEvent>) {
        let session_id = Uuid::new_v4();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let attempts = Arc::new(AtomicU32::new(0));

        let driver = Driver {
            connector,
            key: key.clone(),
            config,
            commands: cmd_rx,
            events: event_tx,
            state: state_tx,
            attempts: Arc::clone(&attempts),
            queue: VecDeque::new(),
        };
        let span = info_span!("stream", key = %key, session = %session_id);
        let task = tokio::spawn(driver.run().instrument(span));

        let client = Self {
            key,
            session_id,
            commands: cmd_tx,
            state: state_rx,
            attempts,
            task: Some(task),
        };
        (client, event_rx)
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Consecutive failed attempts since the last successful connection.
    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Transmit now if connected, otherwise queue until the next connection.
    pub fn send(&self, message: ControlMessage) -> Result<(), StreamError> {
        self.command(Command::Send(message))
    }

    pub fn subscribe(&self) -> Result<(), StreamError> {
        self.send(ControlMessage::subscribe(&self.key))
    }

    pub fn unsubscribe(&self) -> Result<(), StreamError> {
        self.send(ControlMessage::unsubscribe(&self.key))
    }

    /// Reset the attempt counter and connect immediately, dropping the
    /// current connection if there is one.
    pub fn reconnect(&self) -> Result<(), StreamError> {
        self.command(Command::Reconnect)
    }

    /// Stop the driver and wait for it to finish.
    pub async fn close(mut self) {
        let _ = self.commands.send(Command::Close);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(session = %self.session_id, error = %e, "stream driver ended abnormally");
            }
        }
    }

    fn command(&self, command: Command) -> Result<(), StreamError> {
        self.commands
            .send(command)
            .map_err(|_| StreamError::Connection("stream client is closed".into()))
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("key", &self.key)
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Driver task
// ---------------------------------------------------------------------------

enum Phase<T> {
    Connect,
    Connected(T),
    Retry,
    Idle,
    Closed,
}

/// One wake-up of the connected loop.
enum Step {
    Frame(Result<Frame, StreamError>),
    Command(Option<Command>),
    Heartbeat,
    OwnerGone,
}

struct Driver<C: Connector> {
    connector: Arc<C>,
    key: SubscriptionKey,
    config: StreamConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<StreamEvent>,
    state: watch::Sender<ConnectionState>,
    attempts: Arc<AtomicU32>,
    /// Serialized outbound messages waiting for a connection.
    queue: VecDeque<String>,
}

impl<C: Connector> Driver<C> {
    async fn run(mut self) {
        let mut phase = Phase::Connect;
        loop {
            phase = match phase {
                Phase::Connect => self.connect().await,
                Phase::Connected(conn) => self.connected(conn).await,
                Phase::Retry => self.retry().await,
                Phase::Idle => self.idle().await,
                Phase::Closed => break,
            };
        }
        self.set_state(ConnectionState::Closed).await;
        info!(dropped = self.queue.len(), "stream client closed");
    }

    async fn connect(&mut self) -> Phase<C::Conn> {
        let current = *self.state.borrow();
        if current != ConnectionState::Reconnecting {
            self.set_state(ConnectionState::Connecting).await;
        }

        let connector = Arc::clone(&self.connector);
        let key = self.key.clone();
        let connecting = connector.connect(&key);
        tokio::pin!(connecting);

        loop {
            let outcome = tokio::select! {
                biased;
                cmd = self.commands.recv() => Err(cmd),
                result = &mut connecting => Ok(result),
            };
            match outcome {
                Ok(Ok(conn)) => return Phase::Connected(conn),
                Ok(Err(e)) => return self.after_abnormal(e).await,
                Err(Some(Command::Send(message))) => self.enqueue(message),
                Err(Some(Command::Reconnect)) => self.attempts.store(0, Ordering::SeqCst),
                Err(Some(Command::Close)) | Err(None) => return Phase::Closed,
            }
        }
    }

    async fn connected(&mut self, mut conn: C::Conn) -> Phase<C::Conn> {
        self.attempts.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected).await;

        // Queued messages go out first, then the subscription.
        if let Err(e) = self.flush(&mut conn).await {
            conn.close().await;
            return self.after_abnormal(e).await;
        }
        if let Some(text) = serialize(&ControlMessage::subscribe(&self.key)) {
            if let Err(e) = conn.send(text).await {
                conn.close().await;
                return self.after_abnormal(e).await;
            }
        }
        info!("subscribed");

        let period = self.config.heartbeat_interval();
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                frame = conn.recv() => Step::Frame(frame),
                cmd = self.commands.recv() => Step::Command(cmd),
                _ = heartbeat.tick() => Step::Heartbeat,
                _ = self.events.closed() => Step::OwnerGone,
            };

            match step {
                Step::Frame(Ok(Frame::Text(text))) => self.handle_text(&text).await,
                Step::Frame(Ok(Frame::Closed { clean: true })) => {
                    info!("server closed the connection cleanly");
                    return Phase::Closed;
                }
                Step::Frame(Ok(Frame::Closed { clean: false })) => {
                    let err = StreamError::Connection("connection closed abnormally".into());
                    return self.after_abnormal(err).await;
                }
                Step::Frame(Err(e)) => {
                    conn.close().await;
                    return self.after_abnormal(e).await;
                }
                Step::Command(Some(Command::Send(message))) => {
                    let Some(text) = serialize(&message) else { continue };
                    if let Err(e) = conn.send(text.clone()).await {
                        self.queue.push_front(text);
                        conn.close().await;
                        return self.after_abnormal(e).await;
                    }
                }
                Step::Command(Some(Command::Reconnect)) => {
                    info!("manual reconnect requested");
                    conn.close().await;
                    self.attempts.store(0, Ordering::SeqCst);
                    return Phase::Connect;
                }
                Step::Command(Some(Command::Close)) | Step::Command(None) | Step::OwnerGone => {
                    conn.close().await;
                    return Phase::Closed;
                }
                Step::Heartbeat => {
                    let Some(ping) = serialize(&ControlMessage::ping(&self.key)) else { continue };
                    trace!("heartbeat");
                    if let Err(e) = conn.send(ping).await {
                        conn.close().await;
                        return self.after_abnormal(e).await;
                    }
                }
            }
        }
    }

    async fn retry(&mut self) -> Phase<C::Conn> {
        let delay = sleep(self.config.reconnect_interval());
        tokio::pin!(delay);

        loop {
            let wake = tokio::select! {
                _ = &mut delay => None,
                cmd = self.commands.recv() => Some(cmd),
            };
            match wake {
                None => return Phase::Connect,
                Some(Some(Command::Send(message))) => self.enqueue(message),
                Some(Some(Command::Reconnect)) => {
                    self.attempts.store(0, Ordering::SeqCst);
                    return Phase::Connect;
                }
                Some(Some(Command::Close)) | Some(None) => return Phase::Closed,
            }
        }
    }

    async fn idle(&mut self) -> Phase<C::Conn> {
        loop {
            match self.commands.recv().await {
                Some(Command::Send(message)) => self.enqueue(message),
                Some(Command::Reconnect) => {
                    self.attempts.store(0, Ordering::SeqCst);
                    return Phase::Connect;
                }
                Some(Command::Close) | None => return Phase::Closed,
            }
        }
    }

    /// Reconnection policy after a failed handshake or an abnormal closure.
    async fn after_abnormal(&mut self, err: StreamError) -> Phase<C::Conn> {
        warn!(error = %err, "stream connection lost");
        self.emit(StreamEvent::Error(err)).await;

        if !self.config.auto_reconnect {
            self.set_state(ConnectionState::Disconnected).await;
            return Phase::Idle;
        }

        let attempts = self.attempts.load(Ordering::SeqCst);
        if attempts >= self.config.max_reconnect_attempts {
            warn!(attempts, "giving up on stream");
            self.emit(StreamEvent::Error(StreamError::ExhaustedRetries { attempts }))
                .await;
            return Phase::Closed;
        }

        self.attempts.store(attempts + 1, Ordering::SeqCst);
        info!(
            attempt = attempts + 1,
            max = self.config.max_reconnect_attempts,
            delay_ms = self.config.reconnect_interval_ms,
            "scheduling reconnect"
        );
        self.set_state(ConnectionState::Reconnecting).await;
        Phase::Retry
    }

    async fn handle_text(&self, text: &str) {
        match decode(text) {
            Ok(Some(update)) => self.emit(StreamEvent::Data(update)).await,
            Ok(None) => trace!("control acknowledgement"),
            Err(e) => {
                warn!(error = %e, "dropping undecodable stream message");
                self.emit(StreamEvent::Error(e.into())).await;
            }
        }
    }

    async fn flush(&mut self, conn: &mut C::Conn) -> Result<(), StreamError> {
        let pending = self.queue.len();
        while let Some(text) = self.queue.pop_front() {
            if let Err(e) = conn.send(text.clone()).await {
                self.queue.push_front(text);
                return Err(e);
            }
        }
        if pending > 0 {
            debug!(pending, "flushed queued messages");
        }
        Ok(())
    }

    fn enqueue(&mut self, message: ControlMessage) {
        let Some(text) = serialize(&message) else { return };
        if self.queue.len() >= self.config.max_queued_messages.max(1) {
            if let Some(dropped) = self.queue.pop_front() {
                warn!(dropped = %dropped, "outbound queue full, dropping oldest message");
            }
        }
        self.queue.push_back(text);
    }

    async fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "connection state");
            self.emit(StreamEvent::StateChanged(next)).await;
        }
    }

    async fn emit(&self, event: StreamEvent) {
        if self.events.send(event).await.is_err() {
            debug!("event receiver dropped");
        }
    }
}

fn serialize(message: &ControlMessage) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(error = %e, "failed to serialise control message");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound decoding
// ---------------------------------------------------------------------------

/// Decode one inbound text payload.
///
/// Returns `Ok(None)` for control acknowledgements (`pong`, `subscribed`,
/// `unsubscribed`). Numeric fields may be JSON numbers or numeric strings.
pub fn decode(text: &str) -> Result<Option<PriceUpdate>, DecodeError> {
    let root: Value =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let obj = root
        .as_object()
        .ok_or_else(|| DecodeError::Malformed("expected a JSON object".into()))?;

    if let Some(kind) = obj.get("type").and_then(Value::as_str) {
        if matches!(kind, "pong" | "subscribed" | "unsubscribed") {
            return Ok(None);
        }
    }

    let symbol = match obj.get("symbol") {
        None | Some(Value::Null) => return Err(DecodeError::MissingField("symbol")),
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_uppercase(),
        Some(other) => {
            return Err(DecodeError::InvalidField {
                field: "symbol",
                value: other.to_string(),
            })
        }
    };

    Ok(Some(PriceUpdate {
        symbol,
        timestamp: timestamp(obj)?,
        open: number(obj, "open")?,
        high: number(obj, "high")?,
        low: number(obj, "low")?,
        close: number(obj, "close")?,
        volume: number(obj, "volume")?,
    }))
}

/// Epoch milliseconds: a non-negative integer that chrono can represent.
fn timestamp(obj: &Map<String, Value>) -> Result<i64, DecodeError> {
    let raw = number(obj, "timestamp")?;
    let invalid = || DecodeError::InvalidField {
        field: "timestamp",
        value: raw.to_string(),
    };
    if raw < 0.0 || raw.fract() != 0.0 || raw >= i64::MAX as f64 {
        return Err(invalid());
    }
    let millis = raw as i64;
    if DateTime::<Utc>::from_timestamp_millis(millis).is_none() {
        return Err(invalid());
    }
    Ok(millis)
}

fn number(obj: &Map<String, Value>, field: &'static str) -> Result<f64, DecodeError> {
    let invalid = |value: String| DecodeError::InvalidField { field, value };
    match obj.get(field) {
        None | Some(Value::Null) => Err(DecodeError::MissingField(field)),
        Some(Value::Number(n)) => n
            .as_f64()
            .filter(|v| v.is_finite())
            .ok_or_else(|| invalid(n.to_string())),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| invalid(s.clone())),
        Some(other) => Err(invalid(other.to_string())),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::market_data::transport::mock::{MockConnector, MockSession};
    use crate::types::Timeframe;

    fn key() -> SubscriptionKey {
        SubscriptionKey::new("btcusdt", Timeframe::M1)
    }

    fn config(max_reconnect_attempts: u32) -> StreamConfig {
        StreamConfig {
            max_reconnect_attempts,
            ..StreamConfig::default()
        }
    }

    fn tick(ts: i64, close: f64) -> String {
        json!({
            "symbol": "BTCUSDT", "timestamp": ts,
            "open": close, "high": close + 1.0, "low": close - 1.0, "close": close, "volume": 1.0
        })
        .to_string()
    }

    /// Receive events until `want` is reported; returns everything seen before.
    async fn until_state(
        events: &mut mpsc::Receiver<StreamEvent>,
        want: ConnectionState,
    ) -> Vec<StreamEvent> {
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            if event == StreamEvent::StateChanged(want) {
                return seen;
            }
            seen.push(event);
        }
        panic!("event stream ended before {want}; saw {seen:?}");
    }

    async fn accept(sessions: &mut mpsc::UnboundedReceiver<MockSession>) -> MockSession {
        sessions.recv().await.expect("no connection accepted")
    }

    // ---- decode ----------------------------------------------------------

    #[test]
    fn decode_accepts_numbers_and_numeric_strings() {
        let text = r#"{"symbol":"btcusdt","timestamp":"1700000000000","open":"1.5","high":2,"low":1,"close":1.75,"volume":"10"}"#;
        let update = decode(text).unwrap().unwrap();
        assert_eq!(update.symbol, "BTCUSDT");
        assert_eq!(update.timestamp, 1_700_000_000_000);
        assert_eq!(update.open, 1.5);
        assert_eq!(update.volume, 10.0);
    }

    #[test]
    fn decode_reports_missing_and_invalid_fields() {
        assert_eq!(
            decode(r#"{"symbol":"X","timestamp":1,"open":1,"high":1,"low":1,"close":1}"#),
            Err(DecodeError::MissingField("volume"))
        );
        assert_eq!(
            decode(r#"{"timestamp":1}"#),
            Err(DecodeError::MissingField("symbol"))
        );
        assert!(matches!(
            decode(r#"{"symbol":"X","timestamp":1,"open":"abc","high":1,"low":1,"close":1,"volume":1}"#),
            Err(DecodeError::InvalidField { field: "open", .. })
        ));
        assert!(matches!(decode("not json"), Err(DecodeError::Malformed(_))));
        assert!(matches!(decode("[1,2,3]"), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn decode_rejects_unusable_timestamps() {
        let payload = |ts: &str| {
            format!(
                r#"{{"symbol":"X","timestamp":{ts},"open":1,"high":1,"low":1,"close":1,"volume":1}}"#
            )
        };
        for ts in ["1e30", "-60000", "1500.5", r#""12.25""#, "9223372036854775807"] {
            assert!(
                matches!(
                    decode(&payload(ts)),
                    Err(DecodeError::InvalidField { field: "timestamp", .. })
                ),
                "timestamp {ts} should be rejected"
            );
        }
        assert_eq!(decode(&payload(r#""120000""#)).unwrap().unwrap().timestamp, 120_000);
        assert_eq!(decode(&payload("1.7e12")).unwrap().unwrap().timestamp, 1_700_000_000_000);
    }

    #[test]
    fn decode_ignores_acknowledgements() {
        assert_eq!(decode(r#"{"type":"pong"}"#), Ok(None));
        assert_eq!(decode(r#"{"type":"subscribed","symbol":"BTCUSDT"}"#), Ok(None));
    }

    // ---- lifecycle -------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn connects_subscribes_and_delivers_updates() {
        let (connector, mut sessions) = MockConnector::new(&[true]);
        let (client, mut events) = StreamClient::open(Arc::new(connector), key(), config(5));

        let seen = until_state(&mut events, ConnectionState::Connected).await;
        assert_eq!(seen, vec![StreamEvent::StateChanged(ConnectionState::Connecting)]);

        let mut session = accept(&mut sessions).await;
        assert_eq!(session.key, key());
        assert_eq!(
            session.next_sent().await,
            json!({ "type": "subscribe", "symbol": "BTCUSDT", "timeframe": "1m" })
        );

        session.push_text(r#"{"type":"subscribed"}"#);
        session.push_text("garbage");
        session.push_text(tick(60_000, 100.0));

        assert!(matches!(
            events.recv().await,
            Some(StreamEvent::Error(StreamError::Decode(DecodeError::Malformed(_))))
        ));
        match events.recv().await {
            Some(StreamEvent::Data(update)) => assert_eq!(update.close, 100.0),
            other => panic!("expected data, got {other:?}"),
        }
        assert_eq!(client.state(), ConnectionState::Connected);

        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_only_while_connected() {
        let (connector, mut sessions) = MockConnector::new(&[true]);
        let cfg = StreamConfig {
            auto_reconnect: false,
            ..config(5)
        };
        let (client, mut events) = StreamClient::open(Arc::new(connector), key(), cfg);
        let mut session = accept(&mut sessions).await;
        let start = Instant::now();

        assert_eq!(session.next_sent().await["type"], "subscribe");
        assert_eq!(session.next_sent().await["type"], "ping");
        assert!(start.elapsed() >= Duration::from_secs(30));

        session.close(false);
        until_state(&mut events, ConnectionState::Disconnected).await;

        // The connection is gone and no further pings were produced.
        sleep(Duration::from_secs(120)).await;
        assert!(matches!(
            session.from_client.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_attempts() {
        let connector = Arc::new(MockConnector::new(&[]).0);
        let (client, mut events) = StreamClient::open(Arc::clone(&connector), key(), config(3));
        let start = Instant::now();

        let mut all = Vec::new();
        while let Some(event) = events.recv().await {
            all.push(event);
        }

        // one initial attempt plus three retries
        assert_eq!(connector.attempts(), 4);
        let connection_errors = all
            .iter()
            .filter(|e| matches!(e, StreamEvent::Error(StreamError::Connection(_))))
            .count();
        assert_eq!(connection_errors, 4);
        assert!(all.contains(&StreamEvent::Error(StreamError::ExhaustedRetries { attempts: 3 })));
        assert_eq!(all.last(), Some(&StreamEvent::StateChanged(ConnectionState::Closed)));
        assert!(start.elapsed() >= Duration::from_secs(15));
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_reconnect_resets_attempts() {
        let (connector, mut sessions) = MockConnector::new(&[true, false, true]);
        let (client, mut events) = StreamClient::open(Arc::new(connector), key(), config(3));

        let first = accept(&mut sessions).await;
        until_state(&mut events, ConnectionState::Connected).await;
        first.close(false);

        let seen = until_state(&mut events, ConnectionState::Connected).await;
        let errors = seen
            .iter()
            .filter(|e| matches!(e, StreamEvent::Error(_)))
            .count();
        assert_eq!(errors, 2);
        assert!(seen.contains(&StreamEvent::StateChanged(ConnectionState::Reconnecting)));
        assert_eq!(client.reconnect_attempts(), 0);

        let mut second = accept(&mut sessions).await;
        assert_eq!(second.next_sent().await["type"], "subscribe");
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn queued_messages_flush_before_subscribe() {
        let (connector, mut sessions) = MockConnector::new(&[false, true]);
        let cfg = StreamConfig {
            max_queued_messages: 2,
            ..config(5)
        };
        let (client, mut events) = StreamClient::open(Arc::new(connector), key(), cfg);
        until_state(&mut events, ConnectionState::Reconnecting).await;

        let other = SubscriptionKey::new("ethusdt", Timeframe::H1);
        client.send(ControlMessage::ping(&other)).unwrap();
        client.send(ControlMessage::subscribe(&other)).unwrap();
        client.send(ControlMessage::unsubscribe(&other)).unwrap();

        let mut session = accept(&mut sessions).await;
        // The oldest queued message was dropped on overflow.
        let first = session.next_sent().await;
        assert_eq!(first["type"], "subscribe");
        assert_eq!(first["symbol"], "ETHUSDT");
        let unsub = session.next_sent().await;
        assert_eq!(unsub["type"], "unsubscribe");
        let own = session.next_sent().await;
        assert_eq!(own["type"], "subscribe");
        assert_eq!(own["symbol"], "BTCUSDT");

        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn server_clean_close_does_not_retry() {
        let (connector, mut sessions) = MockConnector::new(&[true, true]);
        let connector = Arc::new(connector);
        let (client, mut events) = StreamClient::open(Arc::clone(&connector), key(), config(5));

        let session = accept(&mut sessions).await;
        until_state(&mut events, ConnectionState::Connected).await;
        session.close(true);

        until_state(&mut events, ConnectionState::Closed).await;
        sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 1);
        assert!(client.send(ControlMessage::ping(&key())).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn manual_reconnect_from_disconnected() {
        let (connector, mut sessions) = MockConnector::new(&[true, true]);
        let connector = Arc::new(connector);
        let cfg = StreamConfig {
            auto_reconnect: false,
            ..config(5)
        };
        let (client, mut events) = StreamClient::open(Arc::clone(&connector), key(), cfg);

        let first = accept(&mut sessions).await;
        first.close(false);
        until_state(&mut events, ConnectionState::Disconnected).await;
        assert_eq!(connector.attempts(), 1);

        client.reconnect().unwrap();
        let mut second = accept(&mut sessions).await;
        assert_eq!(second.next_sent().await["type"], "subscribe");
        until_state(&mut events, ConnectionState::Connected).await;
        assert_eq!(connector.attempts(), 2);

        client.unsubscribe().unwrap();
        assert_eq!(
            second.next_sent().await,
            json!({ "type": "unsubscribe", "symbol": "BTCUSDT", "timeframe": "1m" })
        );
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_deterministic() {
        let (connector, _sessions) = MockConnector::new(&[true]);
        let (client, mut events) = StreamClient::open(Arc::new(connector), key(), config(5));
        until_state(&mut events, ConnectionState::Connected).await;

        let state = client.watch_state();
        client.close().await;
        assert_eq!(*state.borrow(), ConnectionState::Closed);
        until_state(&mut events, ConnectionState::Closed).await;
        assert!(events.recv().await.is_none());
    }
}
