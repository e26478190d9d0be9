// =============================================================================
// Tick Buffer - bounded per-symbol tick history and price sanity checks
// =============================================================================
//
// Accepted ticks are kept in a ring buffer that compacts to its newest
// `retain` entries once it grows past `capacity`. The same history feeds two
// things: outlier rejection (trailing average of the last N ticks) and
// on-demand reconstruction of arbitrary timeframes.
// =============================================================================

use std::collections::VecDeque;

use crate::market_data::timeframe::bucket_start;
use crate::market_data::{BaseCandle, TickRecord};

/// Why a tick was refused.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickRejection {
    NonFinite,
    NonPositive,
    Outlier { price: f64, average: f64 },
}

impl std::fmt::Display for TickRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonFinite => write!(f, "price is not finite"),
            Self::NonPositive => write!(f, "price is not positive"),
            Self::Outlier { price, average } => {
                write!(f, "price {price} deviates too far from trailing average {average:.6}")
            }
        }
    }
}

impl std::error::Error for TickRejection {}

/// Bounded tick history for one symbol.
#[derive(Debug, Clone)]
pub struct TickBuffer {
    ticks: VecDeque<TickRecord>,
    capacity: usize,
    retain: usize,
}

impl TickBuffer {
    pub fn new(capacity: usize, retain: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ticks: VecDeque::with_capacity(capacity + 1),
            capacity,
            retain: retain.clamp(1, capacity),
        }
    }

    pub fn push(&mut self, tick: TickRecord) {
        self.ticks.push_back(tick);
        if self.ticks.len() > self.capacity {
            let excess = self.ticks.len() - self.retain;
            self.ticks.drain(..excess);
        }
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TickRecord> {
        self.ticks.iter()
    }

    /// Mean price of the newest `window` ticks.
    pub fn trailing_average(&self, window: usize) -> Option<f64> {
        if self.ticks.is_empty() || window == 0 {
            return None;
        }
        let n = window.min(self.ticks.len());
        let sum: f64 = self.ticks.iter().rev().take(n).map(|t| t.price).sum();
        Some(sum / n as f64)
    }

    /// Check `price` against basic sanity rules and the trailing average.
    pub fn validate(
        &self,
        price: f64,
        window: usize,
        max_deviation: f64,
    ) -> Result<(), TickRejection> {
        validate_price(price)?;
        if let Some(average) = self.trailing_average(window) {
            if average > 0.0 && ((price - average) / average).abs() > max_deviation {
                return Err(TickRejection::Outlier { price, average });
            }
        }
        Ok(())
    }

    /// Rebuild `count` candles of `timeframe_ms` from the retained ticks.
    pub fn build_candles(&self, timeframe_ms: i64, count: usize) -> Vec<BaseCandle> {
        let ticks: Vec<TickRecord> = self.ticks.iter().copied().collect();
        build_candles_from_ticks(ticks, timeframe_ms, count)
    }
}

/// Reject non-finite and non-positive prices.
pub fn validate_price(price: f64) -> Result<(), TickRejection> {
    if !price.is_finite() {
        return Err(TickRejection::NonFinite);
    }
    if price <= 0.0 {
        return Err(TickRejection::NonPositive);
    }
    Ok(())
}

/// Bucket raw ticks into OHLCV candles, returning the newest `count`.
pub fn build_candles_from_ticks(
    mut ticks: Vec<TickRecord>,
    timeframe_ms: i64,
    count: usize,
) -> Vec<BaseCandle> {
    if timeframe_ms <= 0 || count == 0 {
        return Vec::new();
    }
    ticks.sort_by_key(|t| t.timestamp);

    let mut candles: Vec<BaseCandle> = Vec::new();
    for tick in &ticks {
        let bucket = bucket_start(tick.timestamp, timeframe_ms);
        let volume = tick.volume.unwrap_or(0.0);
        match candles.last_mut() {
            Some(c) if c.time == bucket => {
                c.high = c.high.max(tick.price);
                c.low = c.low.min(tick.price);
                c.close = tick.price;
                c.volume += volume;
            }
            _ => candles.push(BaseCandle::new(
                bucket, tick.price, tick.price, tick.price, tick.price, volume,
            )),
        }
    }

    let start = candles.len().saturating_sub(count);
    candles.split_off(start)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
