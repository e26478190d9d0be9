// =============================================================================
// Kline Stream - closed Binance klines pushed into the tick aggregator
// =============================================================================
//
// Forming candles are built from trades; the kline stream only contributes the
// exchange's final version of each candle (`k.x == true`).
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::BINANCE_WS_BASE;
use crate::aggregator::TickAggregator;
use crate::market_data::timeframe::normalize_timeframe;
use crate::market_data::BaseCandle;
use crate::provider::binance::{binance_interval, parse_str_f64};

/// A kline update with its timeframe already mapped to the canonical label.
#[derive(Debug, Clone, PartialEq)]
pub struct KlineEvent {
    pub symbol: String,
    pub timeframe: String,
    pub candle: BaseCandle,
    pub is_closed: bool,
}

/// Connect to the kline stream for one `(symbol, timeframe)` and push every
/// closed kline into `aggregator`.
///
/// Runs until the stream disconnects or an error occurs, then returns so that
/// the caller (main.rs) can handle reconnection.
pub async fn run_kline_stream(
    symbol: &str,
    timeframe: &str,
    aggregator: &Arc<TickAggregator>,
) -> Result<()> {
    let lower = symbol.to_lowercase();
    let interval = binance_interval(&normalize_timeframe(timeframe));
    let url = format!("{BINANCE_WS_BASE}/{lower}@kline_{interval}");
    info!(url = %url, symbol = %symbol, interval = %interval, "connecting to kline WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to kline WebSocket")?;

    info!(symbol = %symbol, interval = %interval, "kline WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match parse_kline_message(&text) {
                Ok(event) if event.is_closed => {
                    debug!(
                        symbol = %event.symbol,
                        timeframe = %event.timeframe,
                        close = event.candle.close,
                        "closed kline"
                    );
                    aggregator.on_candle(&event.symbol, &event.timeframe, event.candle);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "failed to parse kline message");
                }
            },
            // tungstenite answers pings itself.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(error = %e, "kline WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, interval = %interval, "kline WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a kline message, either single-stream or wrapped in the
/// combined-stream `{ "stream", "data" }` envelope.
///
/// ```json
/// { "e": "kline", "s": "BTCUSDT", "k": { "t": 0, "i": "1m", "o": "1", "h": "2", "l": "0.5", "c": "1.5", "v": "10", "x": true } }
/// ```
pub fn parse_kline_message(text: &str) -> Result<KlineEvent> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse kline JSON")?;
    let data = root.get("data").unwrap_or(&root);

    let symbol = data["s"]
        .as_str()
        .context("missing field s")?
        .to_uppercase();

    let k = &data["k"];
    let interval = k["i"].as_str().context("missing field k.i")?;
    let time = k["t"].as_i64().context("missing field k.t")?;

    let open = parse_str_f64(&k["o"]).context("invalid field k.o")?;
    let high = parse_str_f64(&k["h"]).context("invalid field k.h")?;
    let low = parse_str_f64(&k["l"]).context("invalid field k.l")?;
    let close = parse_str_f64(&k["c"]).context("invalid field k.c")?;
    let volume = parse_str_f64(&k["v"]).context("invalid field k.v")?;
    let is_closed = k["x"].as_bool().context("missing field k.x")?;

    Ok(KlineEvent {
        symbol,
        timeframe: normalize_timeframe(interval),
        candle: BaseCandle::new(time, open, high, low, close, volume),
        is_closed,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
