// =============================================================================
// Candle Pipeline - market data cache and live tick aggregation
// =============================================================================

pub mod aggregator;
pub mod api;
pub mod app_state;
pub mod cache;
pub mod config;
pub mod market_data;
pub mod provider;
pub mod stream;
