// =============================================================================
// Tick Aggregator - live OHLCV candles from a realtime tick feed
// =============================================================================
//
// One `SeriesState` per (symbol, timeframe), stored in a flat map:
//
//   Uninitialized → Forming → Complete → Forming → ...
//
// Ticks update every tracked timeframe of their symbol. A candle is finalised
// either by a tick landing in a later bucket or by the per-series boundary
// timer once the wall clock passes the bucket end, so quiet markets still
// close their candles on time.
//
// Placeholders (open = 0, low = +inf) mark a bucket that has seen no tick
// yet. They are never emitted: a placeholder past its bucket simply moves to
// the current bucket.
//
// Locks are never held while listeners run. Events produced under a lock are
// collected and dispatched after it is released.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::listeners::{ListenerRegistry, Subscription};
use super::tick_buffer::{TickBuffer, TickRejection};
use crate::config::AggregatorConfig;
use crate::market_data::timeframe::{bucket_start, normalize_timeframe, timeframe_ms};
use crate::market_data::{AggregatedCandle, BaseCandle, CandleKey, Clock, TickRecord};

// =============================================================================
// SeriesState
// =============================================================================

#[derive(Debug, Clone)]
struct SeriesState {
    candle: BaseCandle,
    is_complete: bool,
    timeframe_ms: i64,
}

impl SeriesState {
    fn forming(candle: BaseCandle, timeframe_ms: i64) -> Self {
        Self {
            candle,
            is_complete: false,
            timeframe_ms,
        }
    }

    fn snapshot(&self, key: &CandleKey) -> AggregatedCandle {
        AggregatedCandle {
            candle: self.candle,
            symbol: key.symbol.clone(),
            timeframe: key.timeframe.clone(),
            is_complete: self.is_complete,
        }
    }

    /// Fold one tick into the series, pushing any resulting events.
    fn apply_tick(
        &mut self,
        key: &CandleKey,
        price: f64,
        timestamp: i64,
        volume: f64,
        events: &mut Vec<AggregatedCandle>,
    ) {
        let bucket = bucket_start(timestamp, self.timeframe_ms);

        if bucket < self.candle.time {
            debug!(key = %key, timestamp, "late tick ignored");
            return;
        }

        if bucket == self.candle.time {
            if self.is_complete {
                return;
            }
            let c = &mut self.candle;
            if c.is_placeholder() {
                c.open = price;
                c.high = price;
                c.low = price;
            } else {
                c.high = c.high.max(price);
                c.low = c.low.min(price);
            }
            c.close = price;
            c.volume += volume;
            events.push(self.snapshot(key));
            return;
        }

        // Later bucket: close out whatever we have, then open the next candle.
        let touched = !self.candle.is_placeholder();
        if touched && !self.is_complete {
            self.is_complete = true;
            events.push(self.snapshot(key));
        }

        let open = if touched { self.candle.close } else { price };
        self.candle = BaseCandle::new(bucket, open, price, price, price, volume);
        self.is_complete = false;
        events.push(self.snapshot(key));
    }

    /// Boundary check. Returns the finalised candle, if any.
    fn expire(&mut self, key: &CandleKey, now_ms: i64) -> Option<AggregatedCandle> {
        if self.is_complete || now_ms < self.candle.time + self.timeframe_ms {
            return None;
        }
        if self.candle.is_placeholder() {
            self.candle = BaseCandle::placeholder(bucket_start(now_ms, self.timeframe_ms));
            return None;
        }
        self.is_complete = true;
        Some(self.snapshot(key))
    }
}

// =============================================================================
// Shared core (reachable from timer tasks through a Weak)
// =============================================================================

#[derive(Default)]
struct AggregatorCounters {
    ticks_accepted: AtomicU64,
    ticks_rejected: AtomicU64,
    candles_completed: AtomicU64,
}

struct AggregatorCore {
    config: AggregatorConfig,
    clock: Arc<dyn Clock>,
    series: RwLock<HashMap<CandleKey, SeriesState>>,
    ticks: Mutex<HashMap<String, TickBuffer>>,
    listeners: ListenerRegistry,
    counters: AggregatorCounters,
}

impl AggregatorCore {
    fn emit(&self, events: &[AggregatedCandle]) {
        let completed = events.iter().filter(|e| e.is_complete).count() as u64;
        if completed > 0 {
            self.counters
                .candles_completed
                .fetch_add(completed, Ordering::Relaxed);
        }
        for event in events {
            self.listeners.dispatch(event);
        }
    }

    fn check_key(&self, key: &CandleKey) {
        let now = self.clock.now_ms();
        let event = {
            let mut series = self.series.write();
            match series.get_mut(key) {
                Some(state) => state.expire(key, now),
                None => return,
            }
        };
        if let Some(event) = event {
            debug!(key = %key, time = event.candle.time, "candle closed on boundary");
            self.emit(&[event]);
        }
    }
}

// =============================================================================
// TickAggregator
// =============================================================================

/// Snapshot of aggregator internals for the diagnostics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatorStats {
    pub series: usize,
    pub symbols: usize,
    pub forming: usize,
    pub complete: usize,
    pub buffered_ticks: usize,
    pub listeners: usize,
    pub active_timers: usize,
    pub ticks_accepted: u64,
    pub ticks_rejected: u64,
    pub candles_completed: u64,
    pub tracked: Vec<String>,
}

pub struct TickAggregator {
    core: Arc<AggregatorCore>,
    timers: Mutex<HashMap<CandleKey, JoinHandle<()>>>,
}

impl TickAggregator {
    pub fn new(config: AggregatorConfig, clock: Arc<dyn Clock>) -> Self {
        info!(
            default_timeframes = ?config.default_timeframes,
            buffer = config.tick_buffer_capacity,
            "TickAggregator initialised"
        );
        Self {
            core: Arc::new(AggregatorCore {
                config,
                clock,
                series: RwLock::new(HashMap::new()),
                ticks: Mutex::new(HashMap::new()),
                listeners: ListenerRegistry::new(),
                counters: AggregatorCounters::default(),
            }),
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Start tracking `(symbol, timeframe)`, replacing any existing state.
    ///
    /// A seed candle is aligned down to its bucket and becomes the forming
    /// candle; without one a placeholder is installed at the current bucket.
    /// Returns `false` for unknown timeframes.
    pub fn initialize_candle(
        &self,
        symbol: &str,
        timeframe: &str,
        seed: Option<BaseCandle>,
    ) -> bool {
        let timeframe = normalize_timeframe(timeframe);
        let Some(tf_ms) = timeframe_ms(&timeframe) else {
            warn!(symbol, timeframe = %timeframe, "cannot initialise candle: unknown timeframe");
            return false;
        };

        let candle = match seed {
            Some(mut seed) => {
                seed.time = bucket_start(seed.time, tf_ms);
                seed
            }
            None => BaseCandle::placeholder(bucket_start(self.core.clock.now_ms(), tf_ms)),
        };

        let key = CandleKey::new(symbol, timeframe);
        self.core
            .series
            .write()
            .insert(key.clone(), SeriesState::forming(candle, tf_ms));
        debug!(key = %key, time = candle.time, seeded = seed.is_some(), "series initialised");
        self.arm_timer(key, tf_ms);
        true
    }

    /// Feed one realtime trade.
    ///
    /// Invalid prices and outliers are dropped without touching any state.
    /// On success returns the number of events emitted.
    pub fn on_tick(
        &self,
        symbol: &str,
        price: f64,
        timestamp: i64,
        volume: Option<f64>,
    ) -> Result<usize, TickRejection> {
        let config = &self.core.config;
        {
            let mut ticks = self.core.ticks.lock();
            let buffer = ticks.entry(symbol.to_string()).or_insert_with(|| {
                TickBuffer::new(config.tick_buffer_capacity, config.tick_buffer_retain)
            });
            if let Err(rejection) =
                buffer.validate(price, config.validation_window, config.max_price_deviation)
            {
                self.core
                    .counters
                    .ticks_rejected
                    .fetch_add(1, Ordering::Relaxed);
                debug!(symbol, price, reason = %rejection, "tick rejected");
                return Err(rejection);
            }
            buffer.push(TickRecord {
                price,
                timestamp,
                volume,
            });
        }
        self.core
            .counters
            .ticks_accepted
            .fetch_add(1, Ordering::Relaxed);

        if !self.is_tracked(symbol) {
            self.initialize_defaults(symbol, timestamp);
        }

        let events = {
            let mut series = self.core.series.write();
            let mut keys: Vec<(i64, CandleKey)> = series
                .iter()
                .filter(|(k, _)| k.symbol == symbol)
                .map(|(k, s)| (s.timeframe_ms, k.clone()))
                .collect();
            keys.sort();

            let mut events = Vec::new();
            for (_, key) in keys {
                if let Some(state) = series.get_mut(&key) {
                    state.apply_tick(&key, price, timestamp, volume.unwrap_or(0.0), &mut events);
                }
            }
            events
        };

        self.core.emit(&events);
        Ok(events.len())
    }

    /// Install a finished candle pushed by the provider and emit it.
    ///
    /// A candle older than the series' current bucket is emitted but does not
    /// rewind the forming candle.
    pub fn on_candle(&self, symbol: &str, timeframe: &str, mut candle: BaseCandle) {
        let timeframe = normalize_timeframe(timeframe);
        let Some(tf_ms) = timeframe_ms(&timeframe) else {
            warn!(symbol, timeframe = %timeframe, "ignoring pushed candle: unknown timeframe");
            return;
        };
        candle.time = bucket_start(candle.time, tf_ms);

        let key = CandleKey::new(symbol, timeframe);
        let (event, is_new) = {
            let mut series = self.core.series.write();
            let is_new = !series.contains_key(&key);
            let state = series
                .entry(key.clone())
                .or_insert_with(|| SeriesState::forming(candle, tf_ms));

            if state.candle.time <= candle.time {
                state.candle = candle;
                state.is_complete = true;
                (state.snapshot(&key), is_new)
            } else {
                debug!(key = %key, time = candle.time, "pushed candle behind live series");
                let mut event = state.snapshot(&key);
                event.candle = candle;
                event.is_complete = true;
                (event, is_new)
            }
        };

        if is_new {
            self.arm_timer(key, tf_ms);
        }
        self.core.emit(&[event]);
    }

    /// Run the boundary check for every tracked series now.
    ///
    /// Returns the number of candles finalised.
    pub fn check_boundaries(&self) -> usize {
        let now = self.core.clock.now_ms();
        let events: Vec<AggregatedCandle> = {
            let mut series = self.core.series.write();
            series
                .iter_mut()
                .filter_map(|(key, state)| state.expire(key, now))
                .collect()
        };
        self.core.emit(&events);
        events.len()
    }

    /// Rebuild `count` candles of `timeframe` from buffered ticks.
    pub fn build_candles_from_ticks(
        &self,
        symbol: &str,
        timeframe: &str,
        count: usize,
    ) -> Vec<BaseCandle> {
        let timeframe = normalize_timeframe(timeframe);
        let Some(tf_ms) = timeframe_ms(&timeframe) else {
            warn!(symbol, timeframe = %timeframe, "cannot build candles: unknown timeframe");
            return Vec::new();
        };
        self.core
            .ticks
            .lock()
            .get(symbol)
            .map(|buffer| buffer.build_candles(tf_ms, count))
            .unwrap_or_default()
    }

    /// Current candle of a series. Untouched placeholders are not exposed.
    pub fn get_current_candle(&self, symbol: &str, timeframe: &str) -> Option<AggregatedCandle> {
        let key = CandleKey::new(symbol, normalize_timeframe(timeframe));
        self.core
            .series
            .read()
            .get(&key)
            .filter(|s| !s.candle.is_placeholder())
            .map(|s| s.snapshot(&key))
    }

    pub fn tracked_timeframes(&self, symbol: &str) -> Vec<String> {
        let mut tracked: Vec<(i64, String)> = self
            .core
            .series
            .read()
            .iter()
            .filter(|(k, _)| k.symbol == symbol)
            .map(|(k, s)| (s.timeframe_ms, k.timeframe.clone()))
            .collect();
        tracked.sort();
        tracked.into_iter().map(|(_, tf)| tf).collect()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&AggregatedCandle) + Send + Sync + 'static,
    {
        self.core.listeners.subscribe(listener)
    }

    /// Stop tracking one timeframe, or the whole symbol (tick buffer too).
    pub fn cleanup(&self, symbol: &str, timeframe: Option<&str>) {
        let timeframe = timeframe.map(normalize_timeframe);
        let matches = |key: &CandleKey| {
            key.symbol == symbol && timeframe.as_ref().map_or(true, |tf| key.timeframe == *tf)
        };

        let removed = {
            let mut series = self.core.series.write();
            let before = series.len();
            series.retain(|key, _| !matches(key));
            before - series.len()
        };

        self.timers.lock().retain(|key, handle| {
            if matches(key) {
                handle.abort();
                false
            } else {
                true
            }
        });

        if timeframe.is_none() {
            self.core.ticks.lock().remove(symbol);
        }

        info!(symbol, timeframe = ?timeframe, removed, "aggregator cleanup");
    }

    pub fn get_stats(&self) -> AggregatorStats {
        let (series, symbols, forming, complete, mut tracked) = {
            let series = self.core.series.read();
            let mut symbols: Vec<&str> = series.keys().map(|k| k.symbol.as_str()).collect();
            symbols.sort_unstable();
            symbols.dedup();
            let complete = series.values().filter(|s| s.is_complete).count();
            let tracked: Vec<String> = series.keys().map(ToString::to_string).collect();
            (
                series.len(),
                symbols.len(),
                series.len() - complete,
                complete,
                tracked,
            )
        };
        tracked.sort();

        let buffered_ticks: usize = self.core.ticks.lock().values().map(TickBuffer::len).sum();
        let counters = &self.core.counters;

        AggregatorStats {
            series,
            symbols,
            forming,
            complete,
            buffered_ticks,
            listeners: self.core.listeners.len(),
            active_timers: self.timers.lock().len(),
            ticks_accepted: counters.ticks_accepted.load(Ordering::Relaxed),
            ticks_rejected: counters.ticks_rejected.load(Ordering::Relaxed),
            candles_completed: counters.candles_completed.load(Ordering::Relaxed),
            tracked,
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn is_tracked(&self, symbol: &str) -> bool {
        self.core.series.read().keys().any(|k| k.symbol == symbol)
    }

    /// First tick of an untracked symbol: start the default timeframes in the
    /// tick's own bucket.
    fn initialize_defaults(&self, symbol: &str, timestamp: i64) {
        let mut armed = Vec::new();
        {
            let mut series = self.core.series.write();
            for raw in &self.core.config.default_timeframes {
                let timeframe = normalize_timeframe(raw);
                let Some(tf_ms) = timeframe_ms(&timeframe) else {
                    warn!(timeframe = %timeframe, "skipping unknown default timeframe");
                    continue;
                };
                let key = CandleKey::new(symbol, timeframe);
                if series.contains_key(&key) {
                    continue;
                }
                let placeholder = BaseCandle::placeholder(bucket_start(timestamp, tf_ms));
                series.insert(key.clone(), SeriesState::forming(placeholder, tf_ms));
                armed.push((key, tf_ms));
            }
        }
        if !armed.is_empty() {
            info!(symbol, count = armed.len(), "default timeframes initialised on first tick");
        }
        for (key, tf_ms) in armed {
            self.arm_timer(key, tf_ms);
        }
    }

    /// (Re)start the boundary timer of one series.
    ///
    /// Outside a tokio runtime no timer is started; `check_boundaries` can
    /// still be driven by hand.
    fn arm_timer(&self, key: CandleKey, tf_ms: i64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(key = %key, "no tokio runtime, boundary timer not started");
            return;
        };

        let max_ms = i64::try_from(self.core.config.max_boundary_check_ms).unwrap_or(i64::MAX);
        let period_ms = (tf_ms / 10).clamp(1, max_ms.max(1));
        let period = Duration::from_millis(period_ms.unsigned_abs());

        let weak: Weak<AggregatorCore> = Arc::downgrade(&self.core);
        let task_key = key.clone();
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(core) = weak.upgrade() else { break };
                core.check_key(&task_key);
            }
        });

        if let Some(previous) = self.timers.lock().insert(key, handle) {
            previous.abort();
        }
    }
}

impl Drop for TickAggregator {
    fn drop(&mut self) {
        for (_, handle) in self.timers.lock().drain() {
            handle.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
