// =============================================================================
// Stream transport — WebSocket connections behind a small async seam
// =============================================================================
//
// The stream client drives any `Connector`; production uses tokio-tungstenite
// while tests script connections through in-memory channels.
// =============================================================================

use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::error::StreamError;
use crate::types::SubscriptionKey;

/// What a connection yields to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A text payload (binary payloads are passed on as lossy UTF-8).
    Text(String),
    /// The peer closed the connection. `clean` is true for a normal close
    /// handshake; anything else is treated as an abnormal closure.
    Closed { clean: bool },
}

/// Opens connections for a subscription.
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection;

    fn connect(
        &self,
        key: &SubscriptionKey,
    ) -> impl Future<Output = Result<Self::Conn, StreamError>> + Send;
}

/// One established connection. `recv` must be cancel-safe: the client polls
/// it inside `tokio::select!`.
pub trait Connection: Send + 'static {
    fn send(&mut self, text: String) -> impl Future<Output = Result<(), StreamError>> + Send;

    fn recv(&mut self) -> impl Future<Output = Result<Frame, StreamError>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

// ---------------------------------------------------------------------------
// tokio-tungstenite implementation
// ---------------------------------------------------------------------------

/// Connects to a URL template in which `{symbol}` and `{timeframe}` are
/// replaced by the subscription key.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url_template: String,
}

impl WsConnector {
    pub fn new(url_template: impl Into<String>) -> Self {
        Self {
            url_template: url_template.into(),
        }
    }

    pub fn url_for(&self, key: &SubscriptionKey) -> String {
        self.url_template
            .replace("{symbol}", &key.symbol)
            .replace("{timeframe}", key.timeframe.as_str())
    }
}

impl Connector for WsConnector {
    type Conn = WsConnection;

    async fn connect(&self, key: &SubscriptionKey) -> Result<WsConnection, StreamError> {
        let url = self.url_for(key);
        info!(url = %url, key = %key, "connecting to stream WebSocket");

        let (ws_stream, _response) = connect_async(&url)
            .await
            .map_err(|e| StreamError::Connection(format!("failed to connect to {url}: {e}")))?;

        info!(key = %key, "stream WebSocket connected");
        Ok(WsConnection { inner: ws_stream })
    }
}

pub struct WsConnection {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Connection for WsConnection {
    async fn send(&mut self, text: String) -> Result<(), StreamError> {
        self.inner
            .send(Message::Text(text))
            .await
            .map_err(|e| StreamError::Connection(format!("WebSocket send failed: {e}")))
    }

    async fn recv(&mut self) -> Result<Frame, StreamError> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Frame::Text(text)),
                Some(Ok(Message::Binary(bytes))) => {
                    return Ok(Frame::Text(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Some(Ok(Message::Close(frame))) => {
                    let clean = frame.as_ref().map_or(true, |f| f.code == CloseCode::Normal);
                    debug!(?frame, clean, "WebSocket close frame received");
                    return Ok(Frame::Closed { clean });
                }
                // tungstenite answers pings on the next read/flush.
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(StreamError::Connection(format!("WebSocket read error: {e}")))
                }
                None => return Ok(Frame::Closed { clean: false }),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.inner.close(None).await {
            debug!(error = %e, "WebSocket close handshake failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Scripted in-memory transport for tests
// ---------------------------------------------------------------------------
