//! Binance WebSocket adapters feeding the tick aggregator.
//!
//! Each `run_*` function returns when its connection ends; reconnection is
//! the caller's job.

pub mod kline_stream;
pub mod trade_stream;

pub use kline_stream::{parse_kline_message, run_kline_stream, KlineEvent};
pub use trade_stream::{parse_agg_trade, run_trade_stream, AggTrade};

/// Public Binance stream endpoint.
pub const BINANCE_WS_BASE: &str = "wss://stream.binance.com:9443/ws";
