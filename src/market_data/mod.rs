pub mod candle_series;
pub mod history;
pub mod stream_client;
pub mod transport;

// Re-exports for convenient access (e.g. `use crate::market_data::Candle`).
pub use candle_series::{Candle, CandleSeries, MergeOutcome};
pub use history::{HistoryFetcher, HistoryRow, RestHistoryClient};
pub use stream_client::{StreamClient, StreamEvent};
pub use transport::{Connection, Connector, Frame, WsConnector};
