// =============================================================================
// Candle Cache Manager - multi-timeframe queries over one cached base series
// =============================================================================
//
// Query flow for `get_candles(symbol, timeframe, limit)`:
//   1. Normalise the timeframe label.
//   2. Lazily load the symbol's snapshot from storage (dropping it when older
//      than the storage TTL).
//   3. Derive the requested timeframe from the resident base series.
//   4. Otherwise fetch at the requested timeframe; the result becomes the new
//      base series and is persisted.
//
// At most one provider fetch per `symbol:timeframe` is in flight. Later
// callers await the pending shared future. The fetch itself runs on a spawned
// task so a cancelled caller never abandons it half-way; its in-flight marker
// is removed by a drop guard on success, failure and panic alike.
//
// Locks are never held across an `.await`. Every async step re-reads the
// cache afterwards since another operation may have replaced the entry.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::entry::{take_last, CandleCacheEntry};
use super::storage::{storage_key, CandleStorage};
use crate::config::CacheConfig;
use crate::market_data::timeframe::{normalize_timeframe, timeframe_ms};
use crate::market_data::{BaseCandle, Clock};
use crate::provider::{FetchOptions, MarketDataProvider};

type FetchOutput = std::result::Result<Vec<BaseCandle>, Arc<anyhow::Error>>;
type SharedFetch = Shared<BoxFuture<'static, FetchOutput>>;
type CacheMap = Arc<RwLock<HashMap<String, CandleCacheEntry>>>;
type InFlightMap = Arc<Mutex<HashMap<String, SharedFetch>>>;

// =============================================================================
// Stats
// =============================================================================

#[derive(Default)]
struct CacheCounters {
    derive_hits: AtomicU64,
    fetches: AtomicU64,
    fetch_errors: AtomicU64,
    joined_fetches: AtomicU64,
    incremental_updates: AtomicU64,
    full_reloads: AtomicU64,
    evictions: AtomicU64,
}

/// Per-symbol view of a resident cache entry.
#[derive(Debug, Clone, Serialize)]
pub struct EntryStats {
    pub symbol: String,
    pub base_timeframe: String,
    pub candles: usize,
    pub last_update: i64,
    pub last_candle: i64,
    pub age_secs: i64,
    pub stale: bool,
}

/// Diagnostics snapshot of the cache manager.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_candles: usize,
    pub in_flight: usize,
    pub derive_hits: u64,
    pub fetches: u64,
    pub fetch_errors: u64,
    pub joined_fetches: u64,
    pub incremental_updates: u64,
    pub full_reloads: u64,
    pub evictions: u64,
    pub symbols: Vec<EntryStats>,
}

// =============================================================================
// CandleCacheManager
// =============================================================================

/// Per-symbol candle cache with timeframe derivation and fetch de-duplication.
///
/// Cloning is cheap and every clone shares the same cache.
#[derive(Clone)]
pub struct CandleCacheManager {
    config: Arc<CacheConfig>,
    provider: Arc<dyn MarketDataProvider>,
    storage: Arc<dyn CandleStorage>,
    clock: Arc<dyn Clock>,
    cache: CacheMap,
    in_flight: InFlightMap,
    counters: Arc<CacheCounters>,
}

impl CandleCacheManager {
    pub fn new(
        config: CacheConfig,
        provider: Arc<dyn MarketDataProvider>,
        storage: Arc<dyn CandleStorage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            provider,
            storage,
            clock,
            cache: Arc::new(RwLock::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(CacheCounters::default()),
        }
    }

    fn cache_ttl_ms(&self) -> i64 {
        secs_to_ms(self.config.cache_ttl_secs)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Return up to `limit` of the most recent candles of `timeframe`.
    ///
    /// Never fails: provider and storage errors degrade to the best data
    /// available, possibly an empty vector.
    #[instrument(skip(self), name = "cache::get_candles")]
    pub async fn get_candles(&self, symbol: &str, timeframe: &str, limit: usize) -> Vec<BaseCandle> {
        let timeframe = normalize_timeframe(timeframe);
        if limit == 0 {
            return Vec::new();
        }

        self.ensure_loaded(symbol).await;

        if let Some(derived) = self.try_derive(symbol, &timeframe, limit, true) {
            if !derived.is_empty() {
                self.counters.derive_hits.fetch_add(1, Ordering::Relaxed);
                debug!(symbol, timeframe = %timeframe, count = derived.len(), "served from cache");
                return derived;
            }
        }

        match self.fetch_and_cache(symbol, &timeframe, limit).await {
            Ok(candles) if !candles.is_empty() => take_last(candles, limit),
            Ok(_) => {
                warn!(symbol, timeframe = %timeframe, "provider returned no candles");
                self.stale_fallback(symbol, &timeframe, limit)
            }
            Err(e) => {
                warn!(symbol, timeframe = %timeframe, error = %e, "fetch failed — serving best available data");
                self.stale_fallback(symbol, &timeframe, limit)
            }
        }
    }

    fn try_derive(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
        honour_ttl: bool,
    ) -> Option<Vec<BaseCandle>> {
        let now = self.clock.now_ms();
        let ttl = honour_ttl.then(|| self.cache_ttl_ms());
        let cache = self.cache.read();
        cache.get(symbol)?.derive(timeframe, limit, now, ttl)
    }

    fn stale_fallback(&self, symbol: &str, timeframe: &str, limit: usize) -> Vec<BaseCandle> {
        self.try_derive(symbol, timeframe, limit, false)
            .unwrap_or_default()
    }

    /// Snapshot of the resident entry for `symbol`, if any.
    pub fn get_entry(&self, symbol: &str) -> Option<CandleCacheEntry> {
        self.cache.read().get(symbol).cloned()
    }

    // -------------------------------------------------------------------------
    // Storage
    // -------------------------------------------------------------------------

    /// Load `symbol`'s snapshot into memory unless it is already resident.
    async fn ensure_loaded(&self, symbol: &str) {
        if self.cache.read().contains_key(symbol) {
            return;
        }

        let key = storage_key(symbol);
        let blob = match self.storage.get(&key).await {
            Ok(Some(blob)) => blob,
            Ok(None) => return,
            Err(e) => {
                warn!(symbol, error = %e, "storage read failed — treating as cache miss");
                return;
            }
        };

        let entry: CandleCacheEntry = match serde_json::from_str(&blob) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(symbol, error = %e, "corrupt cache snapshot — discarding");
                self.remove_persisted(symbol).await;
                return;
            }
        };

        let now = self.clock.now_ms();
        if entry.is_stale(now, secs_to_ms(self.config.storage_ttl_secs)) {
            debug!(symbol, age_ms = entry.age_ms(now), "persisted snapshot expired");
            self.remove_persisted(symbol).await;
            return;
        }

        debug!(symbol, candles = entry.data.len(), "snapshot restored from storage");
        // A fetch may have completed while storage was being read.
        self.cache
            .write()
            .entry(symbol.to_string())
            .or_insert(entry);
    }

    async fn remove_persisted(&self, symbol: &str) {
        if let Err(e) = self.storage.remove(&storage_key(symbol)).await {
            warn!(symbol, error = %e, "failed to remove persisted snapshot");
        }
    }

    // -------------------------------------------------------------------------
    // Fetching
    // -------------------------------------------------------------------------

    /// Fetch `limit` candles of `timeframe` and install them as the symbol's
    /// base series.
    ///
    /// Concurrent calls for the same `symbol:timeframe` share one request.
    pub async fn fetch_and_cache(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<BaseCandle>> {
        let timeframe = normalize_timeframe(timeframe);
        let key = format!("{symbol}:{timeframe}");

        let pending = {
            let mut in_flight = self.in_flight.lock();
            if let Some(existing) = in_flight.get(&key) {
                self.counters.joined_fetches.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "joining in-flight fetch");
                existing.clone()
            } else {
                self.counters.fetches.fetch_add(1, Ordering::Relaxed);
                let job = FetchJob {
                    key: key.clone(),
                    symbol: symbol.to_string(),
                    timeframe: timeframe.clone(),
                    options: FetchOptions::new(limit, self.config.base_cushion),
                    provider: self.provider.clone(),
                    storage: self.storage.clone(),
                    clock: self.clock.clone(),
                    cache: self.cache.clone(),
                    in_flight: self.in_flight.clone(),
                };
                let handle = tokio::spawn(job.run());
                let counters = self.counters.clone();
                // Polled once however many callers join.
                let shared = async move {
                    let output = match handle.await {
                        Ok(output) => output,
                        Err(e) => Err(Arc::new(anyhow!("fetch task aborted: {e}"))),
                    };
                    if output.is_err() {
                        counters.fetch_errors.fetch_add(1, Ordering::Relaxed);
                    }
                    output
                }
                .boxed()
                .shared();
                in_flight.insert(key.clone(), shared.clone());
                shared
            }
        };

        pending.await.map_err(|e| anyhow!("{e:#}"))
    }

    /// Full reload of `symbol` at its current base timeframe (or the
    /// configured default when nothing is cached).
    #[instrument(skip(self), name = "cache::preload_symbol")]
    pub async fn preload_symbol(&self, symbol: &str) {
        self.ensure_loaded(symbol).await;

        let timeframe = self
            .cache
            .read()
            .get(symbol)
            .map(|e| e.base_timeframe.clone())
            .unwrap_or_else(|| normalize_timeframe(&self.config.default_base_timeframe));

        self.counters.full_reloads.fetch_add(1, Ordering::Relaxed);
        match self
            .fetch_and_cache(symbol, &timeframe, self.config.preload_limit)
            .await
        {
            Ok(candles) => {
                info!(symbol, timeframe = %timeframe, count = candles.len(), "symbol preloaded");
            }
            Err(e) => {
                warn!(symbol, timeframe = %timeframe, error = %e, "preload failed");
            }
        }
    }

    /// Bring the symbol's base series up to date with as few bars as possible.
    #[instrument(skip(self), name = "cache::update_symbol")]
    pub async fn update_symbol(&self, symbol: &str) {
        self.ensure_loaded(symbol).await;

        let snapshot = self.cache.read().get(symbol).map(|e| {
            (
                e.base_timeframe.clone(),
                e.last_update,
                e.last_candle,
                e.data.is_empty(),
            )
        });

        let Some((base, last_update, last_candle, empty)) = snapshot else {
            debug!(symbol, "nothing cached — performing full load");
            return self.preload_symbol(symbol).await;
        };

        let now = self.clock.now_ms();
        if now - last_update < secs_to_ms(self.config.quiet_window_secs) {
            debug!(symbol, "updated recently — skipping");
            return;
        }

        let base_ms = match timeframe_ms(&base) {
            Some(ms) if !empty => ms,
            _ => return self.preload_symbol(symbol).await,
        };

        let elapsed = (now - last_candle).max(0);
        if elapsed > secs_to_ms(self.config.max_incremental_gap_secs) {
            info!(symbol, elapsed_ms = elapsed, "gap too large for incremental update — reloading");
            return self.preload_symbol(symbol).await;
        }

        let bars = incremental_bar_count(elapsed, base_ms, self.config.max_incremental_bars);
        self.counters.incremental_updates.fetch_add(1, Ordering::Relaxed);

        let fetched = self
            .provider
            .fetch_candles(symbol, &base, FetchOptions::new(bars, 0))
            .await;

        match fetched {
            Ok(candles) => {
                let merged = {
                    let mut cache = self.cache.write();
                    match cache.get_mut(symbol) {
                        Some(entry) if entry.base_timeframe == base => {
                            let outcome = entry.merge_candles(
                                &candles,
                                self.config.max_cached_candles,
                                self.clock.now_ms(),
                            );
                            debug!(
                                symbol,
                                appended = outcome.appended,
                                replaced_last = outcome.replaced_last,
                                trimmed = outcome.trimmed,
                                "incremental merge"
                            );
                            Some(entry.clone())
                        }
                        _ => None,
                    }
                };
                match merged {
                    Some(entry) => persist(self.storage.as_ref(), &entry).await,
                    None => debug!(symbol, "entry replaced during update — merge skipped"),
                }
            }
            Err(e) => {
                self.counters.fetch_errors.fetch_add(1, Ordering::Relaxed);
                warn!(symbol, error = %e, "incremental fetch failed — falling back to full reload");
                self.preload_symbol(symbol).await;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Eviction & maintenance
    // -------------------------------------------------------------------------

    /// Drop resident entries (and their snapshots) older than the cache TTL.
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let ttl = self.cache_ttl_ms();

        let expired: Vec<String> = {
            let mut cache = self.cache.write();
            let keys: Vec<String> = cache
                .iter()
                .filter(|(_, entry)| entry.is_stale(now, ttl))
                .map(|(symbol, _)| symbol.clone())
                .collect();
            for symbol in &keys {
                cache.remove(symbol);
            }
            keys
        };

        for symbol in &expired {
            self.remove_persisted(symbol).await;
        }

        if !expired.is_empty() {
            self.counters
                .evictions
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            info!(count = expired.len(), symbols = ?expired, "expired cache entries evicted");
        }
        expired.len()
    }

    /// Spawn the periodic eviction sweep. Dropping the handle stops it.
    pub fn start_sweeper(&self) -> SweeperHandle {
        let manager = self.clone();
        let period = std::time::Duration::from_secs(self.config.sweep_interval_secs.max(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.sweep_expired().await;
            }
        });

        info!(interval_secs = period.as_secs(), "cache sweeper started");
        SweeperHandle { handle }
    }

    pub async fn clear_symbol(&self, symbol: &str) {
        self.cache.write().remove(symbol);
        self.remove_persisted(symbol).await;
    }

    pub async fn clear_all(&self) {
        let symbols: Vec<String> = self.cache.write().drain().map(|(k, _)| k).collect();
        for symbol in &symbols {
            self.remove_persisted(symbol).await;
        }
        info!(count = symbols.len(), "cache cleared");
    }

    pub fn get_stats(&self) -> CacheStats {
        let now = self.clock.now_ms();
        let ttl = self.cache_ttl_ms();
        let cache = self.cache.read();

        let mut symbols: Vec<EntryStats> = cache
            .values()
            .map(|e| EntryStats {
                symbol: e.symbol.clone(),
                base_timeframe: e.base_timeframe.clone(),
                candles: e.data.len(),
                last_update: e.last_update,
                last_candle: e.last_candle,
                age_secs: e.age_ms(now) / 1000,
                stale: e.is_stale(now, ttl),
            })
            .collect();
        symbols.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        CacheStats {
            entries: cache.len(),
            total_candles: cache.values().map(|e| e.data.len()).sum(),
            in_flight: self.in_flight.lock().len(),
            derive_hits: self.counters.derive_hits.load(Ordering::Relaxed),
            fetches: self.counters.fetches.load(Ordering::Relaxed),
            fetch_errors: self.counters.fetch_errors.load(Ordering::Relaxed),
            joined_fetches: self.counters.joined_fetches.load(Ordering::Relaxed),
            incremental_updates: self.counters.incremental_updates.load(Ordering::Relaxed),
            full_reloads: self.counters.full_reloads.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            symbols,
        }
    }
}

// =============================================================================
// Sweeper handle
// =============================================================================

/// Owned handle of the eviction sweep task.
pub struct SweeperHandle {
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn stop(self) {
        // Drop aborts.
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// =============================================================================
// Fetch job
// =============================================================================

/// Everything a spawned fetch needs, detached from the manager's lifetime.
struct FetchJob {
    key: String,
    symbol: String,
    timeframe: String,
    options: FetchOptions,
    provider: Arc<dyn MarketDataProvider>,
    storage: Arc<dyn CandleStorage>,
    clock: Arc<dyn Clock>,
    cache: CacheMap,
    in_flight: InFlightMap,
}

/// Removes the in-flight marker when the fetch task ends, however it ends.
struct InFlightGuard {
    key: String,
    in_flight: InFlightMap,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.key);
    }
}

impl FetchJob {
    async fn run(self) -> FetchOutput {
        let _guard = InFlightGuard {
            key: self.key.clone(),
            in_flight: self.in_flight.clone(),
        };

        let candles = self
            .provider
            .fetch_candles(&self.symbol, &self.timeframe, self.options)
            .await
            .with_context(|| format!("provider fetch failed for {}", self.key))
            .map_err(Arc::new)?;

        if candles.is_empty() {
            return Ok(candles);
        }

        let entry = CandleCacheEntry::new(
            self.symbol.clone(),
            self.timeframe.clone(),
            candles,
            self.clock.now_ms(),
        );
        let data = entry.data.clone();

        self.cache.write().insert(self.symbol.clone(), entry.clone());
        info!(
            symbol = %self.symbol,
            timeframe = %self.timeframe,
            count = data.len(),
            "base series cached"
        );

        persist(self.storage.as_ref(), &entry).await;
        Ok(data)
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Best-effort snapshot write; failures are logged and skipped.
async fn persist(storage: &dyn CandleStorage, entry: &CandleCacheEntry) {
    let blob = match serde_json::to_string(entry) {
        Ok(blob) => blob,
        Err(e) => {
            warn!(symbol = %entry.symbol, error = %e, "failed to serialise cache snapshot");
            return;
        }
    };
    if let Err(e) = storage.set(&storage_key(&entry.symbol), blob).await {
        warn!(symbol = %entry.symbol, error = %e, "failed to persist cache snapshot");
    }
}

/// Bars needed to cover `elapsed_ms` plus the revised last bar, capped.
pub fn incremental_bar_count(elapsed_ms: i64, base_ms: i64, cap: usize) -> usize {
    if base_ms <= 0 {
        return cap.max(2);
    }
    let covering = (elapsed_ms.max(0) + base_ms - 1) / base_ms;
    ((covering + 1) as usize).clamp(2, cap.max(2))
}

fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::storage::MemoryStorage;
    use crate::market_data::ManualClock;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicI64, AtomicUsize};

    const HOUR: i64 = 3_600_000;
    const MIN: i64 = 60_000;
    /// 2023-11-14 22:00:00 UTC, hour aligned.
    const START: i64 = 1_699_999_200_000;

    /// Provider producing a contiguous series that ends at `end_ms`.
    struct MockProvider {
        calls: AtomicUsize,
        fail_next: AtomicUsize,
        end_ms: AtomicI64,
        delay_ms: u64,
        requests: Mutex<Vec<(String, String, FetchOptions)>>,
    }

    impl MockProvider {
        fn new(end_ms: i64) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_next: AtomicUsize::new(0),
                end_ms: AtomicI64::new(end_ms),
                delay_ms: 0,
                requests: Mutex::new(Vec::new()),
            }
        }

        fn with_delay(mut self, delay_ms: u64) -> Self {
            self.delay_ms = delay_ms;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn last_request(&self) -> (String, String, FetchOptions) {
            self.requests.lock().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl MarketDataProvider for MockProvider {
        async fn fetch_candles(
            &self,
            symbol: &str,
            timeframe: &str,
            options: FetchOptions,
        ) -> Result<Vec<BaseCandle>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests
                .lock()
                .push((symbol.to_string(), timeframe.to_string(), options));

            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }

            let should_fail = self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if should_fail {
                anyhow::bail!("upstream unavailable");
            }

            let tf_ms = timeframe_ms(timeframe).context("unknown timeframe")?;
            let end = self.end_ms.load(Ordering::SeqCst) / tf_ms * tf_ms;
            let n = options.total_bars() as i64;
            Ok((0..n)
                .map(|i| {
                    let time = end - (n - 1 - i) * tf_ms;
                    let px = 100.0 + i as f64;
                    BaseCandle::new(time, px, px + 2.0, px - 2.0, px + 1.0, 10.0)
                })
                .collect())
        }
    }

    /// Storage whose every call fails.
    struct BrokenStorage {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CandleStorage for BrokenStorage {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("disk unavailable")
        }

        async fn set(&self, _key: &str, _blob: String) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("disk unavailable")
        }

        async fn remove(&self, _key: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("disk unavailable")
        }
    }

    struct Harness {
        manager: CandleCacheManager,
        provider: Arc<MockProvider>,
        storage: Arc<MemoryStorage>,
        clock: Arc<ManualClock>,
    }

    fn harness_with(provider: MockProvider, config: CacheConfig) -> Harness {
        let provider = Arc::new(provider);
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::new(START));
        let manager =
            CandleCacheManager::new(config, provider.clone(), storage.clone(), clock.clone());
        Harness {
            manager,
            provider,
            storage,
            clock,
        }
    }

    fn harness() -> Harness {
        harness_with(MockProvider::new(START), CacheConfig::default())
    }

    #[tokio::test]
    async fn hourly_fetch_then_four_hour_derivation() {
        let h = harness();

        let hourly = h.manager.get_candles("AAPL", "1h", 10).await;
        assert_eq!(hourly.len(), 10);
        assert_eq!(h.provider.calls(), 1);
        let (symbol, timeframe, options) = h.provider.last_request();
        assert_eq!((symbol.as_str(), timeframe.as_str()), ("AAPL", "1h"));
        assert_eq!(options.out_bars, 10);

        let entry = h.manager.get_entry("AAPL").unwrap();
        assert_eq!(entry.base_timeframe, "1h");

        let four_hour = h.manager.get_candles("AAPL", "4h", 5).await;
        assert_eq!(h.provider.calls(), 1, "4h must be derived, not fetched");
        // 10 hourly candles group into 4 + 4 + 2.
        assert_eq!(four_hour.len(), 3);
        assert_eq!(four_hour[0].time, entry.data[0].time);
        assert!((four_hour[0].volume - 40.0).abs() < 1e-9);
        assert!((four_hour[2].close - entry.data[9].close).abs() < 1e-9);
    }

    #[tokio::test]
    async fn synonyms_hit_the_same_cache() {
        let h = harness();
        h.manager.get_candles("AAPL", "1hour", 5).await;
        h.manager.get_candles("AAPL", "1HR", 5).await;
        assert_eq!(h.provider.calls(), 1);
    }

    #[tokio::test]
    async fn direct_fetch_normalises_timeframe() {
        let h = harness();
        let fetched = h.manager.fetch_and_cache("AAPL", "1hr", 10).await.unwrap();
        assert_eq!(fetched.len(), 10);
        assert_eq!(h.provider.last_request().1, "1h");
        assert_eq!(h.manager.get_entry("AAPL").unwrap().base_timeframe, "1h");

        assert_eq!(h.manager.get_candles("AAPL", "4h", 2).await.len(), 2);
        assert_eq!(h.manager.get_candles("AAPL", "1h", 2).await.len(), 2);
        assert_eq!(h.provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn synonym_fetches_share_one_request() {
        let h = harness_with(MockProvider::new(START).with_delay(50), CacheConfig::default());
        let (a, b) = tokio::join!(
            h.manager.fetch_and_cache("AAPL", "60min", 10),
            h.manager.fetch_and_cache("AAPL", "1h", 10),
        );
        assert_eq!(a.unwrap().len(), 10);
        assert_eq!(b.unwrap().len(), 10);
        assert_eq!(h.provider.calls(), 1);
    }

    #[tokio::test]
    async fn failing_storage_degrades_to_memory_only() {
        let provider = Arc::new(MockProvider::new(START));
        let storage = Arc::new(BrokenStorage {
            calls: AtomicUsize::new(0),
        });
        let manager = CandleCacheManager::new(
            CacheConfig::default(),
            provider.clone(),
            storage.clone(),
            Arc::new(ManualClock::new(START)),
        );

        let hourly = manager.get_candles("AAPL", "1h", 10).await;
        assert_eq!(hourly.len(), 10);
        // Read on load, write after the fetch.
        assert!(storage.calls.load(Ordering::SeqCst) >= 2);

        let derived = manager.get_candles("AAPL", "4h", 2).await;
        assert_eq!(derived.len(), 2);
        assert_eq!(provider.calls(), 1);
        assert_eq!(manager.get_entry("AAPL").unwrap().base_timeframe, "1h");

        manager.clear_symbol("AAPL").await;
        assert!(manager.get_entry("AAPL").is_none());
    }

    #[tokio::test]
    async fn finer_request_refetches_and_replaces_base() {
        let h = harness();
        h.manager.get_candles("AAPL", "1h", 10).await;
        let minutes = h.manager.get_candles("AAPL", "5m", 12).await;
        assert_eq!(minutes.len(), 12);
        assert_eq!(h.provider.calls(), 2);
        assert_eq!(h.manager.get_entry("AAPL").unwrap().base_timeframe, "5m");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_fetches_are_deduplicated() {
        let h = harness_with(MockProvider::new(START).with_delay(50), CacheConfig::default());

        let (a, b, c) = tokio::join!(
            h.manager.fetch_and_cache("BTCUSDT", "1m", 20),
            h.manager.fetch_and_cache("BTCUSDT", "1m", 20),
            h.manager.get_candles("BTCUSDT", "1m", 20),
        );

        assert_eq!(h.provider.calls(), 1);
        assert_eq!(a.unwrap().len(), 20);
        assert_eq!(b.unwrap().len(), 20);
        assert_eq!(c.len(), 20);

        let stats = h.manager.get_stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.joined_fetches, 2);
    }

    #[tokio::test]
    async fn failed_fetch_clears_marker_and_returns_empty() {
        let h = harness();
        h.provider.fail_next.store(1, Ordering::SeqCst);

        let candles = h.manager.get_candles("AAPL", "1h", 10).await;
        assert!(candles.is_empty());
        assert_eq!(h.manager.get_stats().in_flight, 0);
        assert_eq!(h.manager.get_stats().fetch_errors, 1);

        let retry = h.manager.get_candles("AAPL", "1h", 10).await;
        assert_eq!(retry.len(), 10);
        assert_eq!(h.provider.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn joined_failure_counts_one_error() {
        let h = harness_with(MockProvider::new(START).with_delay(50), CacheConfig::default());
        h.provider.fail_next.store(1, Ordering::SeqCst);

        let (a, b, c) = tokio::join!(
            h.manager.fetch_and_cache("AAPL", "1h", 10),
            h.manager.fetch_and_cache("AAPL", "1h", 10),
            h.manager.fetch_and_cache("AAPL", "1h", 10),
        );
        assert!(a.is_err() && b.is_err() && c.is_err());
        assert_eq!(h.provider.calls(), 1);

        let stats = h.manager.get_stats();
        assert_eq!(stats.joined_fetches, 2);
        assert_eq!(stats.fetch_errors, 1);
    }

    #[tokio::test]
    async fn failed_fetch_serves_stale_cache() {
        let h = harness();
        h.manager.get_candles("AAPL", "1h", 10).await;
        h.clock.advance(31 * MIN);
        h.provider.fail_next.store(1, Ordering::SeqCst);

        let candles = h.manager.get_candles("AAPL", "1h", 4).await;
        assert_eq!(candles.len(), 4);
        assert_eq!(h.provider.calls(), 2);
    }

    #[tokio::test]
    async fn stale_entry_is_not_derived_from() {
        let h = harness();
        h.manager.get_candles("AAPL", "1h", 10).await;
        h.clock.advance(31 * MIN);

        h.manager.get_candles("AAPL", "4h", 2).await;
        assert_eq!(h.provider.calls(), 2);
        assert_eq!(h.manager.get_entry("AAPL").unwrap().base_timeframe, "4h");
    }

    #[tokio::test]
    async fn fetched_series_is_persisted_and_restored() {
        let h = harness();
        h.manager.get_candles("AAPL", "1h", 10).await;
        assert!(h.storage.contains("candle_cache_AAPL"));

        // A second manager over the same storage restores without fetching.
        let provider = Arc::new(MockProvider::new(START));
        let restored = CandleCacheManager::new(
            CacheConfig::default(),
            provider.clone(),
            h.storage.clone(),
            h.clock.clone(),
        );
        let candles = restored.get_candles("AAPL", "2h", 3).await;
        assert_eq!(candles.len(), 3);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn expired_snapshot_is_removed_on_load() {
        let h = harness();
        let old = CandleCacheEntry::new(
            "AAPL",
            "1h",
            vec![BaseCandle::new(START - HOUR, 1.0, 1.0, 1.0, 1.0, 1.0)],
            START - 2 * HOUR,
        );
        h.storage
            .set("candle_cache_AAPL", serde_json::to_string(&old).unwrap())
            .await
            .unwrap();

        let candles = h.manager.get_candles("AAPL", "1h", 5).await;
        assert_eq!(candles.len(), 5);
        assert_eq!(h.provider.calls(), 1);
        // The fresh fetch re-persisted the key with the new series.
        let blob = h.storage.get("candle_cache_AAPL").await.unwrap().unwrap();
        let entry: CandleCacheEntry = serde_json::from_str(&blob).unwrap();
        assert_eq!(entry.last_update, START);
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_a_miss() {
        let h = harness();
        h.storage
            .set("candle_cache_AAPL", "not json".into())
            .await
            .unwrap();
        let candles = h.manager.get_candles("AAPL", "1h", 5).await;
        assert_eq!(candles.len(), 5);
        assert_eq!(h.provider.calls(), 1);
    }

    #[tokio::test]
    async fn sweep_evicts_expired_entries_from_memory_and_storage() {
        let h = harness();
        h.manager.get_candles("AAPL", "1h", 10).await;
        h.manager.get_candles("MSFT", "1h", 10).await;

        h.clock.advance(20 * MIN);
        h.manager.clear_symbol("MSFT").await;
        h.manager.get_candles("MSFT", "1h", 10).await;

        h.clock.advance(11 * MIN);
        let evicted = h.manager.sweep_expired().await;
        assert_eq!(evicted, 1);
        assert!(h.manager.get_entry("AAPL").is_none());
        assert!(!h.storage.contains("candle_cache_AAPL"));
        assert!(h.manager.get_entry("MSFT").is_some());
        assert!(h.storage.contains("candle_cache_MSFT"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_runs_on_schedule() {
        let h = harness();
        h.manager.get_candles("AAPL", "1h", 10).await;
        let sweeper = h.manager.start_sweeper();
        assert!(sweeper.is_running());

        h.clock.advance(31 * MIN);
        tokio::time::sleep(std::time::Duration::from_secs(601)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(h.manager.get_entry("AAPL").is_none());
        assert_eq!(h.manager.get_stats().evictions, 1);
        sweeper.stop();
    }

    #[tokio::test]
    async fn update_within_quiet_window_is_noop() {
        let h = harness();
        h.manager.get_candles("AAPL", "1m", 30).await;
        h.clock.advance(2_000);
        h.manager.update_symbol("AAPL").await;
        assert_eq!(h.provider.calls(), 1);
    }

    #[tokio::test]
    async fn update_fetches_only_the_gap() {
        let h = harness();
        h.manager.get_candles("AAPL", "1m", 30).await;
        let before = h.manager.get_entry("AAPL").unwrap();

        h.clock.advance(3 * MIN + 10_000);
        h.provider.end_ms.store(h.clock.now_ms(), Ordering::SeqCst);
        h.manager.update_symbol("AAPL").await;

        assert_eq!(h.provider.calls(), 2);
        let (_, timeframe, options) = h.provider.last_request();
        assert_eq!(timeframe, "1m");
        // ceil(190s / 60s) + 1 = 5 bars.
        assert_eq!(options.out_bars, 5);

        let after = h.manager.get_entry("AAPL").unwrap();
        assert_eq!(after.data.len(), before.data.len() + 3);
        assert_eq!(after.last_candle, START + 3 * MIN);
        assert_eq!(after.last_update, h.clock.now_ms());
    }

    #[tokio::test]
    async fn update_after_long_gap_reloads_fully() {
        let h = harness();
        h.manager.get_candles("AAPL", "1m", 30).await;
        h.clock.advance(25 * HOUR);
        h.provider.end_ms.store(h.clock.now_ms(), Ordering::SeqCst);

        h.manager.update_symbol("AAPL").await;
        let (_, timeframe, options) = h.provider.last_request();
        assert_eq!(timeframe, "1m");
        assert_eq!(options.out_bars, CacheConfig::default().preload_limit);
        assert_eq!(h.manager.get_stats().full_reloads, 1);
    }

    #[tokio::test]
    async fn failed_incremental_update_falls_back_to_reload() {
        let h = harness();
        h.manager.get_candles("AAPL", "1m", 30).await;
        h.clock.advance(2 * MIN);
        h.provider.fail_next.store(1, Ordering::SeqCst);

        h.manager.update_symbol("AAPL").await;
        assert_eq!(h.provider.calls(), 3);
        let (_, _, options) = h.provider.last_request();
        assert_eq!(options.out_bars, CacheConfig::default().preload_limit);
        assert_eq!(h.manager.get_entry("AAPL").unwrap().data.len(), 500);
    }

    #[tokio::test]
    async fn update_of_unknown_symbol_preloads_default_base() {
        let h = harness();
        h.manager.update_symbol("ETHUSDT").await;
        let (symbol, timeframe, options) = h.provider.last_request();
        assert_eq!(symbol, "ETHUSDT");
        assert_eq!(timeframe, "1m");
        assert_eq!(options.out_bars, 500);
    }

    #[tokio::test]
    async fn clear_all_drops_everything() {
        let h = harness();
        h.manager.get_candles("AAPL", "1h", 10).await;
        h.manager.get_candles("MSFT", "1h", 10).await;
        h.manager.clear_all().await;
        assert_eq!(h.manager.get_stats().entries, 0);
        assert!(h.storage.is_empty());
    }

    #[test]
    fn incremental_bar_count_is_bounded() {
        assert_eq!(incremental_bar_count(0, MIN, 100), 2);
        assert_eq!(incremental_bar_count(MIN, MIN, 100), 2);
        assert_eq!(incremental_bar_count(MIN + 1, MIN, 100), 3);
        assert_eq!(incremental_bar_count(1_000 * MIN, MIN, 100), 100);
    }
}
