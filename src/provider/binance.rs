// =============================================================================
// Binance REST market data provider
// =============================================================================
//
// Implements `MarketDataProvider` over the public GET /api/v3/klines endpoint.
// No signing is involved; the endpoint caps one request at 1000 bars.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use super::{FetchOptions, MarketDataProvider};
use crate::market_data::BaseCandle;

/// Maximum `limit` accepted by /api/v3/klines.
const MAX_KLINES_PER_REQUEST: usize = 1000;

/// Public Binance market data client.
#[derive(Clone)]
pub struct BinanceProvider {
    base_url: String,
    client: reqwest::Client,
}

impl BinanceProvider {
    pub fn new() -> Result<Self> {
        Self::with_base_url("https://api.binance.com")
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client")?;

        let base_url = base_url.into();
        debug!(base_url = %base_url, "BinanceProvider initialised");

        Ok(Self { base_url, client })
    }
}

/// Map a canonical timeframe label onto a Binance kline interval.
///
/// Binance spells minute/hour intervals like the canonical labels but uses
/// lower case for days and weeks (`1d`, `3d`, `1w`) and keeps `1M` for months.
pub fn binance_interval(timeframe: &str) -> String {
    match timeframe {
        "1D" => "1d".to_string(),
        "3D" => "3d".to_string(),
        "1W" => "1w".to_string(),
        other => other.to_string(),
    }
}

/// Parse Binance's array-of-arrays kline payload.
///
/// Array indices:
///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
///   [6] closeTime, ...
pub fn parse_klines(body: &serde_json::Value) -> Result<Vec<BaseCandle>> {
    let raw = body.as_array().context("klines response is not an array")?;

    let mut candles = Vec::with_capacity(raw.len());
    for entry in raw {
        let arr = entry.as_array().context("kline entry is not an array")?;

        if arr.len() < 6 {
            warn!("skipping malformed kline entry with {} elements", arr.len());
            continue;
        }

        let time = arr[0].as_i64().context("kline open time is not an integer")?;
        let open = parse_str_f64(&arr[1])?;
        let high = parse_str_f64(&arr[2])?;
        let low = parse_str_f64(&arr[3])?;
        let close = parse_str_f64(&arr[4])?;
        let volume = parse_str_f64(&arr[5])?;

        candles.push(BaseCandle::new(time, open, high, low, close, volume));
    }

    candles.sort_by_key(|c| c.time);
    candles.dedup_by_key(|c| c.time);
    Ok(candles)
}

/// Binance sends numeric values as JSON strings inside kline arrays.
pub(crate) fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64")),
        serde_json::Value::Number(n) => n.as_f64().context("number is not a valid f64"),
        _ => anyhow::bail!("unexpected JSON type for numeric field: {val}"),
    }
}

#[async_trait]
impl MarketDataProvider for BinanceProvider {
    #[instrument(skip(self), name = "binance::fetch_candles")]
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        options: FetchOptions,
    ) -> Result<Vec<BaseCandle>> {
        let limit = options.total_bars().clamp(1, MAX_KLINES_PER_REQUEST);
        let interval = binance_interval(timeframe);
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/klines request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET /api/v3/klines returned {}: {}", status, body);
        }

        let candles = parse_klines(&body)?;
        debug!(symbol, interval = %interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_mapping() {
        assert_eq!(binance_interval("1m"), "1m");
        assert_eq!(binance_interval("4h"), "4h");
        assert_eq!(binance_interval("1D"), "1d");
        assert_eq!(binance_interval("1W"), "1w");
        assert_eq!(binance_interval("1M"), "1M");
    }

    #[test]
    fn parse_klines_payload() {
        let body = serde_json::json!([
            [1700000060000i64, "2.0", "3.0", "1.5", "2.5", "20.0", 1700000119999i64, "0", 5, "0", "0", "0"],
            [1700000000000i64, "1.0", "2.0", "0.5", "1.5", "10.0", 1700000059999i64, "0", 5, "0", "0", "0"],
            ["short"]
        ]);
        let candles = parse_klines(&body).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].time, 1_700_000_000_000);
        assert!((candles[0].close - 1.5).abs() < f64::EPSILON);
        assert!((candles[1].volume - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_klines_rejects_non_array() {
        let body = serde_json::json!({ "code": -1121, "msg": "Invalid symbol." });
        assert!(parse_klines(&body).is_err());
    }

    #[test]
    fn numeric_fields_accept_strings_and_numbers() {
        assert!((parse_str_f64(&serde_json::json!("1.25")).unwrap() - 1.25).abs() < 1e-12);
        assert!((parse_str_f64(&serde_json::json!(2.5)).unwrap() - 2.5).abs() < 1e-12);
        assert!(parse_str_f64(&serde_json::json!(null)).is_err());
    }
}
