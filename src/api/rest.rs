// =============================================================================
// REST API Endpoints - Axum 0.7
// =============================================================================
//
// Read-only diagnostics over the cache manager and the tick aggregator. All
// endpoints live under `/api/v1/`.
//
// CORS is configured permissively; the service holds public market data only.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::debug;

use crate::app_state::AppState;
use crate::market_data::timeframe::{lookup, normalize_timeframe};
use crate::market_data::{AggregatedCandle, BaseCandle};

const DEFAULT_CANDLE_LIMIT: usize = 500;
const DEFAULT_TICK_CANDLES: usize = 100;

type ApiError = (StatusCode, Json<serde_json::Value>);

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/candles/:symbol/:timeframe", get(candles))
        .route("/api/v1/live/:symbol/:timeframe", get(live_candle))
        .route("/api/v1/ticks/:symbol/:timeframe", get(tick_candles))
        .route("/api/v1/stats", get(stats))
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
    uptime_secs: u64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        server_time: state.clock.now_ms(),
        uptime_secs: state.uptime_secs(),
    })
}

// =============================================================================
// Candles
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CountQuery {
    count: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct CandlesResponse {
    pub symbol: String,
    pub timeframe: String,
    pub count: usize,
    pub candles: Vec<BaseCandle>,
}

/// Normalise and validate the `(symbol, timeframe)` path pair.
fn parse_series(symbol: &str, timeframe: &str) -> Result<(String, String), ApiError> {
    let symbol = symbol.trim().to_uppercase();
    let timeframe = normalize_timeframe(timeframe);
    if symbol.is_empty() {
        return Err(bad_request("symbol must not be empty"));
    }
    if lookup(&timeframe).is_none() {
        return Err(bad_request(&format!("unsupported timeframe '{timeframe}'")));
    }
    Ok((symbol, timeframe))
}

fn bad_request(message: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
}

async fn candles(
    State(state): State<Arc<AppState>>,
    Path((symbol, timeframe)): Path<(String, String)>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<CandlesResponse>, ApiError> {
    let (symbol, timeframe) = parse_series(&symbol, &timeframe)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_CANDLE_LIMIT)
        .clamp(1, state.config.cache.max_cached_candles.max(1));

    let candles = state.cache.get_candles(&symbol, &timeframe, limit).await;
    debug!(symbol = %symbol, timeframe = %timeframe, count = candles.len(), "candles served");

    Ok(Json(CandlesResponse {
        count: candles.len(),
        symbol,
        timeframe,
        candles,
    }))
}

async fn live_candle(
    State(state): State<Arc<AppState>>,
    Path((symbol, timeframe)): Path<(String, String)>,
) -> Result<Json<AggregatedCandle>, ApiError> {
    let (symbol, timeframe) = parse_series(&symbol, &timeframe)?;
    match state.aggregator.get_current_candle(&symbol, &timeframe) {
        Some(candle) => Ok(Json(candle)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": "no live candle",
                "symbol": symbol,
                "timeframe": timeframe,
            })),
        )),
    }
}

async fn tick_candles(
    State(state): State<Arc<AppState>>,
    Path((symbol, timeframe)): Path<(String, String)>,
    Query(query): Query<CountQuery>,
) -> Result<Json<CandlesResponse>, ApiError> {
    let (symbol, timeframe) = parse_series(&symbol, &timeframe)?;
    let count = query.count.unwrap_or(DEFAULT_TICK_CANDLES).max(1);

    let candles = state
        .aggregator
        .build_candles_from_ticks(&symbol, &timeframe, count);

    Ok(Json(CandlesResponse {
        count: candles.len(),
        symbol,
        timeframe,
        candles,
    }))
}

// =============================================================================
// Stats
// =============================================================================

async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_stats())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::test_support::{state, START};

    #[tokio::test]
    async fn candles_endpoint_normalises_and_derives() {
        let (state, _clock) = state();

        let Json(hourly) = candles(
            State(Arc::clone(&state)),
            Path(("btcusdt".to_string(), "60min".to_string())),
            Query(LimitQuery { limit: Some(8) }),
        )
        .await
        .unwrap();
        assert_eq!(hourly.symbol, "BTCUSDT");
        assert_eq!(hourly.timeframe, "1h");
        assert_eq!(hourly.count, 8);

        let Json(four) = candles(
            State(Arc::clone(&state)),
            Path(("BTCUSDT".to_string(), "4h".to_string())),
            Query(LimitQuery { limit: None }),
        )
        .await
        .unwrap();
        assert_eq!(four.count, 2);
        assert_eq!(state.cache.get_stats().fetches, 1);
    }

    #[tokio::test]
    async fn unknown_timeframe_is_bad_request() {
        let (state, _clock) = state();
        let err = candles(
            State(state),
            Path(("BTCUSDT".to_string(), "7m".to_string())),
            Query(LimitQuery { limit: None }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn live_candle_requires_a_tick() {
        let (state, _clock) = state();
        state.aggregator.initialize_candle("BTCUSDT", "1m", None);

        let missing = live_candle(
            State(Arc::clone(&state)),
            Path(("BTCUSDT".to_string(), "1m".to_string())),
        )
        .await;
        assert!(matches!(missing, Err((StatusCode::NOT_FOUND, _))));

        state
            .aggregator
            .on_tick("BTCUSDT", 100.0, START + 500, None)
            .unwrap();
        let found = live_candle(
            State(state),
            Path(("BTCUSDT".to_string(), "1m".to_string())),
        )
        .await;
        assert!(found.is_ok());
    }

    #[tokio::test]
    async fn tick_candles_rebuild_from_buffer() {
        let (state, _clock) = state();
        for i in 0..6 {
            state
                .aggregator
                .on_tick("ETHUSDT", 2_000.0 + i as f64, START + i * 60_000, Some(1.0))
                .unwrap();
        }

        let Json(resp) = tick_candles(
            State(state),
            Path(("ETHUSDT".to_string(), "3m".to_string())),
            Query(CountQuery { count: Some(5) }),
        )
        .await
        .unwrap();
        assert_eq!(resp.count, 2);
        assert!((resp.candles[0].volume - 3.0).abs() < f64::EPSILON);
    }
}
