// =============================================================================
// Timeframe hierarchy - canonical labels, synonyms and bucket arithmetic
// =============================================================================
//
// Every supported timeframe maps to a duration in minutes and a priority.
// Priority grows with duration, so the table is a strict total order: a
// coarser timeframe can be derived from any finer one.
//
// Normalisation is permissive: a label that matches neither a canonical name
// nor a synonym is returned unchanged and later treated as "unknown".
// =============================================================================

use serde::Serialize;

/// Duration and ordering of one canonical timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeframeSpec {
    pub label: &'static str,
    pub minutes: i64,
    pub priority: u32,
}

impl TimeframeSpec {
    pub fn duration_ms(&self) -> i64 {
        self.minutes * MS_PER_MINUTE
    }
}

pub const MS_PER_MINUTE: i64 = 60_000;

const fn spec(label: &'static str, minutes: i64, priority: u32) -> TimeframeSpec {
    TimeframeSpec {
        label,
        minutes,
        priority,
    }
}

/// Canonical timeframes, finest first. `1M` is one month (30 days).
pub const TIMEFRAMES: &[TimeframeSpec] = &[
    spec("1m", 1, 1),
    spec("3m", 3, 2),
    spec("5m", 5, 3),
    spec("15m", 15, 4),
    spec("30m", 30, 5),
    spec("1h", 60, 6),
    spec("2h", 120, 7),
    spec("4h", 240, 8),
    spec("6h", 360, 9),
    spec("8h", 480, 10),
    spec("12h", 720, 11),
    spec("1D", 1_440, 12),
    spec("3D", 4_320, 13),
    spec("1W", 10_080, 14),
    spec("1M", 43_200, 15),
];

/// Lower-case synonyms accepted by [`normalize_timeframe`].
const SYNONYMS: &[(&str, &str)] = &[
    ("1", "1m"),
    ("1m", "1m"),
    ("1min", "1m"),
    ("1minute", "1m"),
    ("3", "3m"),
    ("3m", "3m"),
    ("3min", "3m"),
    ("3minute", "3m"),
    ("5", "5m"),
    ("5m", "5m"),
    ("5min", "5m"),
    ("5minute", "5m"),
    ("15", "15m"),
    ("15m", "15m"),
    ("15min", "15m"),
    ("15minute", "15m"),
    ("30", "30m"),
    ("30m", "30m"),
    ("30min", "30m"),
    ("30minute", "30m"),
    ("60", "1h"),
    ("60m", "1h"),
    ("60min", "1h"),
    ("1h", "1h"),
    ("1hr", "1h"),
    ("1hour", "1h"),
    ("2h", "2h"),
    ("2hr", "2h"),
    ("2hour", "2h"),
    ("120", "2h"),
    ("4h", "4h"),
    ("4hr", "4h"),
    ("4hour", "4h"),
    ("240", "4h"),
    ("6h", "6h"),
    ("6hr", "6h"),
    ("6hour", "6h"),
    ("8h", "8h"),
    ("8hr", "8h"),
    ("8hour", "8h"),
    ("12h", "12h"),
    ("12hr", "12h"),
    ("12hour", "12h"),
    ("1d", "1D"),
    ("d", "1D"),
    ("1day", "1D"),
    ("day", "1D"),
    ("daily", "1D"),
    ("3d", "3D"),
    ("3day", "3D"),
    ("1w", "1W"),
    ("w", "1W"),
    ("1wk", "1W"),
    ("1week", "1W"),
    ("week", "1W"),
    ("weekly", "1W"),
    ("1mo", "1M"),
    ("1mon", "1M"),
    ("1month", "1M"),
    ("month", "1M"),
    ("monthly", "1M"),
];

/// Map a user-supplied timeframe label onto the canonical label set.
///
/// Canonical labels match case-sensitively first so that `1M` (month) and
/// `1m` (minute) stay distinct. Unmapped labels pass through unchanged.
pub fn normalize_timeframe(raw: &str) -> String {
    let trimmed = raw.trim();
    if TIMEFRAMES.iter().any(|tf| tf.label == trimmed) {
        return trimmed.to_string();
    }

    let lower = trimmed.to_lowercase();
    SYNONYMS
        .iter()
        .find(|(alias, _)| *alias == lower)
        .map(|(_, canonical)| (*canonical).to_string())
        .unwrap_or_else(|| trimmed.to_string())
}

/// Look up a canonical label. Labels are expected to be normalised already.
pub fn lookup(label: &str) -> Option<&'static TimeframeSpec> {
    TIMEFRAMES.iter().find(|tf| tf.label == label)
}

pub fn timeframe_minutes(label: &str) -> Option<i64> {
    lookup(label).map(|tf| tf.minutes)
}

pub fn timeframe_ms(label: &str) -> Option<i64> {
    lookup(label).map(TimeframeSpec::duration_ms)
}

/// Start of the bucket containing `timestamp_ms`.
///
/// Uses floor division so pre-epoch timestamps still align downwards.
pub fn bucket_start(timestamp_ms: i64, timeframe_ms: i64) -> i64 {
    if timeframe_ms <= 0 {
        return timestamp_ms;
    }
    timestamp_ms.div_euclid(timeframe_ms) * timeframe_ms
}

/// `true` when `target` can be synthesised by grouping candles of `base`.
pub fn can_derive(base: &str, target: &str) -> bool {
    match (lookup(base), lookup(target)) {
        (Some(b), Some(t)) => t.priority >= b.priority,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
