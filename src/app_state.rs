// =============================================================================
// Central Application State - Candle Pipeline
// =============================================================================
//
// Ties the two services together for the API layer and the background loops.
// Both services manage their own interior mutability; AppState only holds
// shared handles plus a few connection counters.
// =============================================================================

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::aggregator::{AggregatorStats, TickAggregator};
use crate::cache::{CacheStats, CandleCacheManager, CandleStorage};
use crate::config::PipelineConfig;
use crate::market_data::Clock;
use crate::provider::MarketDataProvider;

/// Combined diagnostics served by `/api/v1/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub uptime_secs: u64,
    pub symbols: Vec<String>,
    pub ws_clients: usize,
    pub ws_messages_sent: u64,
    pub cache: CacheStats,
    pub aggregator: AggregatorStats,
}

/// Shared state handed to every API handler and background task.
pub struct AppState {
    pub config: PipelineConfig,
    pub cache: CandleCacheManager,
    pub aggregator: Arc<TickAggregator>,
    pub clock: Arc<dyn Clock>,

    /// Currently connected WebSocket clients.
    pub ws_clients: AtomicUsize,
    /// Candle events pushed over WebSocket since startup.
    pub ws_messages_sent: AtomicU64,

    pub start_time: std::time::Instant,
}

impl AppState {
    /// Build both services from `config` around the given seams.
    pub fn new(
        config: PipelineConfig,
        provider: Arc<dyn MarketDataProvider>,
        storage: Arc<dyn CandleStorage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = CandleCacheManager::new(
            config.cache.clone(),
            provider,
            storage,
            Arc::clone(&clock),
        );
        let aggregator = Arc::new(TickAggregator::new(
            config.aggregator.clone(),
            Arc::clone(&clock),
        ));

        Self {
            config,
            cache,
            aggregator,
            clock,
            ws_clients: AtomicUsize::new(0),
            ws_messages_sent: AtomicU64::new(0),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn build_stats(&self) -> PipelineStats {
        PipelineStats {
            uptime_secs: self.uptime_secs(),
            symbols: self.config.symbols.clone(),
            ws_clients: self.ws_clients.load(Ordering::Relaxed),
            ws_messages_sent: self.ws_messages_sent.load(Ordering::Relaxed),
            cache: self.cache.get_stats(),
            aggregator: self.aggregator.get_stats(),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use anyhow::Result;
    use async_trait::async_trait;

    use super::AppState;
    use crate::cache::MemoryStorage;
    use crate::config::PipelineConfig;
    use crate::market_data::timeframe::{bucket_start, timeframe_ms};
    use crate::market_data::{BaseCandle, Clock, ManualClock};
    use crate::provider::{FetchOptions, MarketDataProvider};

    pub const START: i64 = 1_699_999_200_000;

    /// Provider returning a flat series ending at the clock's current bucket.
    pub struct FlatProvider {
        pub clock: Arc<ManualClock>,
    }

    #[async_trait]
    impl MarketDataProvider for FlatProvider {
        async fn fetch_candles(
            &self,
            _symbol: &str,
            timeframe: &str,
            options: FetchOptions,
        ) -> Result<Vec<BaseCandle>> {
            let tf = timeframe_ms(timeframe).unwrap_or(60_000);
            let end = bucket_start(self.clock.now_ms(), tf);
            let n = options.total_bars() as i64;
            Ok((0..n)
                .map(|i| {
                    let t = end - (n - 1 - i) * tf;
                    BaseCandle::new(t, 100.0, 101.0, 99.0, 100.5, 10.0)
                })
                .collect())
        }
    }

    pub fn state() -> (Arc<AppState>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START));
        let provider = Arc::new(FlatProvider {
            clock: Arc::clone(&clock),
        });
        let state = AppState::new(
            PipelineConfig::default(),
            provider,
            Arc::new(MemoryStorage::new()),
            clock.clone(),
        );
        (Arc::new(state), clock)
    }
}
