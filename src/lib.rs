//! Live candlestick chart feed: historical backfill, a resilient streaming
//! client, per-subscription candle series and cached technical indicators,
//! exposed over a small REST API.

pub mod api;
pub mod coordinator;
pub mod error;
pub mod indicators;
pub mod market_data;
pub mod runtime_config;
pub mod types;
