// =============================================================================
// Trade Stream - Binance aggTrade feed into the tick aggregator
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use super::BINANCE_WS_BASE;
use crate::aggregator::TickAggregator;
use crate::provider::binance::parse_str_f64;

/// One aggregated trade as delivered by the `<symbol>@aggTrade` stream.
#[derive(Debug, Clone, PartialEq)]
pub struct AggTrade {
    pub symbol: String,
    pub price: f64,
    pub quantity: f64,
    /// Trade time in epoch milliseconds.
    pub trade_time: i64,
}

/// Connect to the aggTrade stream of one symbol and feed every trade into
/// `aggregator` as a tick.
///
/// Runs until the stream disconnects or an error occurs, then returns so that
/// the caller (main.rs) can handle reconnection.
pub async fn run_trade_stream(symbol: &str, aggregator: &Arc<TickAggregator>) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("{BINANCE_WS_BASE}/{lower}@aggTrade");
    info!(url = %url, symbol = %symbol, "connecting to trade WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to trade WebSocket")?;

    info!(symbol = %symbol, "trade WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match parse_agg_trade(&text) {
                Ok(trade) => {
                    // Rejected ticks are logged by the aggregator.
                    let _ = aggregator.on_tick(
                        &trade.symbol,
                        trade.price,
                        trade.trade_time,
                        Some(trade.quantity),
                    );
                }
                Err(e) => {
                    warn!(error = %e, "failed to parse aggTrade message");
                }
            },
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(symbol = %symbol, error = %e, "trade WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, "trade WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a Binance aggTrade message.
///
/// Expected shape:
/// ```json
/// { "e": "aggTrade", "s": "BTCUSDT", "p": "37000.00", "q": "0.123", "T": 1700000000123, "m": true }
/// ```
pub fn parse_agg_trade(text: &str) -> Result<AggTrade> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse aggTrade JSON")?;
    let data = root.get("data").unwrap_or(&root);

    let symbol = data["s"]
        .as_str()
        .context("missing field s")?
        .to_uppercase();
    let price = parse_str_f64(&data["p"]).context("invalid field p")?;
    let quantity = parse_str_f64(&data["q"]).context("invalid field q")?;
    let trade_time = data["T"].as_i64().context("missing field T")?;

    Ok(AggTrade {
        symbol,
        price,
        quantity,
        trade_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_agg_trade() {
        let text = r#"{"e":"aggTrade","E":1700000000200,"s":"btcusdt","a":1,"p":"37000.50","q":"0.125","f":1,"l":2,"T":1700000000123,"m":true}"#;
        let trade = parse_agg_trade(text).unwrap();
        assert_eq!(trade.symbol, "BTCUSDT");
        assert!((trade.price - 37_000.5).abs() < 1e-9);
        assert!((trade.quantity - 0.125).abs() < 1e-12);
        assert_eq!(trade.trade_time, 1_700_000_000_123);
    }

    #[test]
    fn parses_combined_stream_envelope() {
        let text = r#"{"stream":"ethusdt@aggTrade","data":{"s":"ETHUSDT","p":"2000","q":"1","T":5}}"#;
        let trade = parse_agg_trade(text).unwrap();
        assert_eq!(trade.symbol, "ETHUSDT");
        assert_eq!(trade.trade_time, 5);
    }

    #[test]
    fn rejects_incomplete_trade() {
        assert!(parse_agg_trade(r#"{"s":"BTCUSDT","p":"1.0","q":"1.0"}"#).is_err());
        assert!(parse_agg_trade(r#"{"s":"BTCUSDT","p":"abc","q":"1.0","T":1}"#).is_err());
        assert!(parse_agg_trade("not json").is_err());
    }
}
