pub mod binance;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::market_data::BaseCandle;

pub use binance::BinanceProvider;

/// Size of a provider request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchOptions {
    /// Bars the caller wants back.
    pub out_bars: usize,
    /// Extra leading bars for warm-up, fetched in the same request.
    pub base_cushion: usize,
}

impl FetchOptions {
    pub fn new(out_bars: usize, base_cushion: usize) -> Self {
        Self {
            out_bars,
            base_cushion,
        }
    }

    pub fn total_bars(&self) -> usize {
        self.out_bars + self.base_cushion
    }
}

/// Upstream source of historical candles.
///
/// Implementations return candles sorted ascending by `time`.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        options: FetchOptions,
    ) -> Result<Vec<BaseCandle>>;
}
