// =============================================================================
// Cache entry - base series, timeframe derivation and incremental merge
// =============================================================================
//
// One entry per symbol holds the base (finest) series actually fetched.
// Coarser timeframes are synthesised by grouping consecutive base candles.
//
// Grouping is aligned to the start of the array, not to calendar boundaries:
// with ratio 4 over 1h candles starting at 01:00, the first 4h candle covers
// 01:00-04:59. Consumers rely on this layout.
//
// Invariant: `data` is strictly ascending by `time` and
// `last_candle == data.last().time` whenever `data` is non-empty.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::market_data::timeframe;
use crate::market_data::BaseCandle;

/// Cached base series for one symbol (also the persisted blob shape).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandleCacheEntry {
    pub symbol: String,
    pub base_timeframe: String,
    pub data: Vec<BaseCandle>,
    /// Epoch ms of the last fetch or merge.
    pub last_update: i64,
    /// `time` of the newest candle in `data` (0 when empty).
    pub last_candle: i64,
}

/// What a merge did to the entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub replaced_last: bool,
    pub appended: usize,
    pub trimmed: usize,
}

impl CandleCacheEntry {
    /// Build a fresh entry from a fetched series, sorting and de-duplicating
    /// it so the ordering invariant holds whatever the provider returned.
    pub fn new(
        symbol: impl Into<String>,
        base_timeframe: impl Into<String>,
        mut data: Vec<BaseCandle>,
        now_ms: i64,
    ) -> Self {
        normalise_series(&mut data);
        let last_candle = data.last().map_or(0, |c| c.time);
        Self {
            symbol: symbol.into(),
            base_timeframe: base_timeframe.into(),
            data,
            last_update: now_ms,
            last_candle,
        }
    }

    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.last_update
    }

    pub fn is_stale(&self, now_ms: i64, ttl_ms: i64) -> bool {
        self.age_ms(now_ms) > ttl_ms
    }

    /// Derive `limit` candles of `target` from the base series.
    ///
    /// Returns `None` when derivation is impossible: stale entry (unless
    /// `ttl_ms` is `None`), unknown timeframe, or a target finer than the base.
    pub fn derive(
        &self,
        target: &str,
        limit: usize,
        now_ms: i64,
        ttl_ms: Option<i64>,
    ) -> Option<Vec<BaseCandle>> {
        if let Some(ttl) = ttl_ms {
            if self.is_stale(now_ms, ttl) {
                return None;
            }
        }
        derive_series(&self.data, &self.base_timeframe, target, limit)
    }

    /// Merge freshly fetched candles into the cached series.
    ///
    /// * A fetched candle at the current `last_candle` time replaces the
    ///   cached one in place (the still-open bar may have been revised).
    /// * Other candles at or before `last_candle` are dropped.
    /// * Strictly newer candles are appended, then the series is trimmed from
    ///   the oldest end to `max_len`.
    pub fn merge_candles(
        &mut self,
        new_candles: &[BaseCandle],
        max_len: usize,
        now_ms: i64,
    ) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        let mut fresh: Vec<BaseCandle> = new_candles.to_vec();
        normalise_series(&mut fresh);

        match self.data.last().map(|c| c.time) {
            None => {
                outcome.appended = fresh.len();
                self.data = fresh;
            }
            Some(prev_last) => {
                if let Some(revised) = fresh.iter().find(|c| c.time == prev_last) {
                    if let Some(last) = self.data.last_mut() {
                        *last = *revised;
                        outcome.replaced_last = true;
                    }
                }
                let newer: Vec<BaseCandle> =
                    fresh.into_iter().filter(|c| c.time > prev_last).collect();
                outcome.appended = newer.len();
                self.data.extend(newer);
            }
        }

        if self.data.len() > max_len {
            outcome.trimmed = self.data.len() - max_len;
            self.data.drain(..outcome.trimmed);
        }

        self.last_update = now_ms;
        self.last_candle = self.data.last().map_or(0, |c| c.time);
        outcome
    }
}

/// Sort ascending by time and drop duplicate times (last one wins).
fn normalise_series(data: &mut Vec<BaseCandle>) {
    data.sort_by_key(|c| c.time);
    // `dedup_by` keeps the first of a run; swap so the later revision wins.
    data.dedup_by(|later, earlier| {
        if later.time == earlier.time {
            *earlier = *later;
            true
        } else {
            false
        }
    });
}

/// Group a base series into a coarser timeframe.
pub fn derive_series(
    data: &[BaseCandle],
    base: &str,
    target: &str,
    limit: usize,
) -> Option<Vec<BaseCandle>> {
    if !timeframe::can_derive(base, target) {
        return None;
    }
    let base_minutes = timeframe::timeframe_minutes(base)?;
    let target_minutes = timeframe::timeframe_minutes(target)?;

    let ratio = (target_minutes / base_minutes) as usize;
    let derived = if ratio <= 1 {
        data.to_vec()
    } else {
        group_candles(data, ratio)
    };

    Some(take_last(derived, limit))
}

/// Collapse consecutive chunks of `ratio` candles, starting at index 0.
///
/// The trailing chunk is kept even when short, since it ends at the newest
/// candle.
pub fn group_candles(data: &[BaseCandle], ratio: usize) -> Vec<BaseCandle> {
    data.chunks(ratio.max(1))
        .filter_map(|group| {
            let first = group.first()?;
            let last = group.last()?;
            Some(BaseCandle {
                time: first.time,
                open: first.open,
                high: group.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max),
                low: group.iter().map(|c| c.low).fold(f64::INFINITY, f64::min),
                close: last.close,
                volume: group.iter().map(|c| c.volume).sum(),
            })
        })
        .collect()
}

/// Keep the most recent `limit` items.
pub fn take_last<T>(mut items: Vec<T>, limit: usize) -> Vec<T> {
    let start = items.len().saturating_sub(limit);
    items.drain(..start);
    items
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
