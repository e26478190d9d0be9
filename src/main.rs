// =============================================================================
// Candle Pipeline - Main Entry Point
// =============================================================================
//
// Wires the Binance provider, snapshot storage and wall clock into the cache
// manager and tick aggregator, then keeps both fed: WebSocket streams push
// trades and closed klines, a refresh loop tops up the cached history.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use candle_pipeline::api;
use candle_pipeline::app_state::AppState;
use candle_pipeline::cache::{CandleStorage, FileStorage, MemoryStorage};
use candle_pipeline::config::PipelineConfig;
use candle_pipeline::market_data::timeframe::{bucket_start, normalize_timeframe, timeframe_ms};
use candle_pipeline::market_data::{Clock, SystemClock};
use candle_pipeline::provider::BinanceProvider;
use candle_pipeline::stream::{run_kline_stream, run_trade_stream};

const CONFIG_PATH: &str = "pipeline_config.json";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Candle Pipeline — starting up");

    let mut config = PipelineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        PipelineConfig::default()
    });
    config.apply_env_overrides();

    info!(symbols = ?config.symbols, "Configured symbols");

    // ── 2. Seams: provider, storage, clock ───────────────────────────────
    let provider = Arc::new(BinanceProvider::new().context("failed to build Binance provider")?);

    let storage: Arc<dyn CandleStorage> = match FileStorage::open(&config.storage_dir).await {
        Ok(storage) => Arc::new(storage),
        Err(e) => {
            warn!(error = %e, dir = %config.storage_dir, "File storage unavailable, using memory");
            Arc::new(MemoryStorage::new())
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // ── 3. Build shared state ────────────────────────────────────────────
    let state = Arc::new(AppState::new(config, provider, storage, Arc::clone(&clock)));
    let sweeper = state.cache.start_sweeper();

    // ── 4. Preload history and start live series ─────────────────────────
    let symbols = state.config.symbols.clone();
    let live_timeframes: Vec<String> = state
        .config
        .aggregator
        .default_timeframes
        .iter()
        .map(|tf| normalize_timeframe(tf))
        .collect();

    for symbol in &symbols {
        state.cache.preload_symbol(symbol).await;

        for timeframe in &live_timeframes {
            // Seed from history only when its last candle is the current one.
            let seed = match timeframe_ms(timeframe) {
                Some(tf_ms) => state
                    .cache
                    .get_candles(symbol, timeframe, 1)
                    .await
                    .pop()
                    .filter(|c| c.time == bucket_start(clock.now_ms(), tf_ms)),
                None => None,
            };
            state.aggregator.initialize_candle(symbol, timeframe, seed);
        }
    }

    info!(count = symbols.len(), "History preloaded");

    // ── 5. Spawn market data streams ─────────────────────────────────────
    for symbol in &symbols {
        let agg = state.aggregator.clone();
        let sym = symbol.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = run_trade_stream(&sym, &agg).await {
                    error!(symbol = %sym, error = %e, "Trade stream error — reconnecting in 5s");
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        });

        for timeframe in &live_timeframes {
            let agg = state.aggregator.clone();
            let sym = symbol.clone();
            let tf = timeframe.clone();
            tokio::spawn(async move {
                loop {
                    if let Err(e) = run_kline_stream(&sym, &tf, &agg).await {
                        error!(symbol = %sym, timeframe = %tf, error = %e, "Kline stream error — reconnecting in 5s");
                    }
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            });
        }
    }

    info!(count = symbols.len(), "Market data streams launched");

    // ── 6. Incremental refresh loop ──────────────────────────────────────
    let refresh_state = state.clone();
    let refresh = tokio::spawn(async move {
        let period = Duration::from_secs(refresh_state.config.refresh_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            for symbol in &refresh_state.config.symbols {
                refresh_state.cache.update_symbol(symbol).await;
            }
        }
    });

    // ── 7. Start the API server ──────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr = state.config.bind_addr.clone();
    tokio::spawn(async move {
        let app = api::router(api_state);
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %bind_addr, error = %e, "Failed to bind API server");
                return;
            }
        };
        info!(addr = %bind_addr, "API server listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    refresh.abort();
    sweeper.stop();

    if let Err(e) = state.config.save(CONFIG_PATH) {
        error!(error = %e, "Failed to save pipeline config on shutdown");
    }

    info!("Candle Pipeline shut down complete.");
    Ok(())
}
