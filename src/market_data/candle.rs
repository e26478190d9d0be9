// =============================================================================
// Candle types shared by the cache manager and the tick aggregator
// =============================================================================

use serde::{Deserialize, Serialize};

/// A single OHLCV bar at a fixed resolution.
///
/// `time` is the bar's open time in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaseCandle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

impl BaseCandle {
    pub fn new(time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Placeholder installed before the first real tick of a bucket.
    ///
    /// The sentinel extrema (`high = 0`, `low = +inf`) are overwritten by the
    /// first accepted tick.
    pub fn placeholder(time: i64) -> Self {
        Self {
            time,
            open: 0.0,
            high: 0.0,
            low: f64::INFINITY,
            close: 0.0,
            volume: 0.0,
        }
    }

    /// `true` while the candle still carries placeholder sentinels.
    pub fn is_placeholder(&self) -> bool {
        self.open == 0.0 || self.low.is_infinite()
    }
}

/// Composite key that identifies one live candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub timeframe: String,
}

impl CandleKey {
    pub fn new(symbol: impl Into<String>, timeframe: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe: timeframe.into(),
        }
    }
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

/// A candle produced by the tick aggregator for one `(symbol, timeframe)`.
///
/// `is_complete` flips to `true` exactly once; after that the candle is never
/// mutated again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedCandle {
    #[serde(flatten)]
    pub candle: BaseCandle,
    pub symbol: String,
    pub timeframe: String,
    pub is_complete: bool,
}

impl AggregatedCandle {
    pub fn forming(key: &CandleKey, candle: BaseCandle) -> Self {
        Self {
            candle,
            symbol: key.symbol.clone(),
            timeframe: key.timeframe.clone(),
            is_complete: false,
        }
    }
}

/// A raw price tick retained for ad-hoc candle reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TickRecord {
    pub price: f64,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
