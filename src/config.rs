// =============================================================================
// Pipeline Configuration - tunables for the cache manager and aggregator
// =============================================================================
//
// Every design value of the candle pipeline lives here. All fields carry a
// serde default so that an older or partial JSON file still loads.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_live_timeframes() -> Vec<String> {
    vec!["1m".to_string(), "5m".to_string()]
}

fn default_base_timeframe() -> String {
    "1m".to_string()
}

fn default_cache_ttl_secs() -> u64 {
    30 * 60
}

fn default_storage_ttl_secs() -> u64 {
    30 * 60
}

fn default_sweep_interval_secs() -> u64 {
    10 * 60
}

fn default_quiet_window_secs() -> u64 {
    5
}

fn default_max_incremental_gap_secs() -> u64 {
    24 * 60 * 60
}

fn default_max_incremental_bars() -> usize {
    100
}

fn default_max_cached_candles() -> usize {
    2000
}

fn default_preload_limit() -> usize {
    500
}

fn default_refresh_interval_secs() -> u64 {
    30
}

fn default_tick_buffer_capacity() -> usize {
    1000
}

fn default_tick_buffer_retain() -> usize {
    500
}

fn default_validation_window() -> usize {
    20
}

fn default_max_price_deviation() -> f64 {
    0.5
}

fn default_max_boundary_check_ms() -> u64 {
    5_000
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_storage_dir() -> String {
    "candle_cache".to_string()
}

// =============================================================================
// CacheConfig
// =============================================================================

/// Tunables for the candle cache manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Resident entries older than this are not derived from and are swept.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Persisted entries older than this are treated as absent on load.
    #[serde(default = "default_storage_ttl_secs")]
    pub storage_ttl_secs: u64,

    /// Period of the eviction sweep.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// `update_symbol` is a no-op if the entry was updated this recently.
    #[serde(default = "default_quiet_window_secs")]
    pub quiet_window_secs: u64,

    /// Gaps longer than this trigger a full reload instead of an incremental
    /// fetch.
    #[serde(default = "default_max_incremental_gap_secs")]
    pub max_incremental_gap_secs: u64,

    /// Upper bound on the bars requested by one incremental fetch.
    #[serde(default = "default_max_incremental_bars")]
    pub max_incremental_bars: usize,

    /// Maximum candles retained per symbol after a merge.
    #[serde(default = "default_max_cached_candles")]
    pub max_cached_candles: usize,

    /// Bars requested by a full reload.
    #[serde(default = "default_preload_limit")]
    pub preload_limit: usize,

    /// Extra warm-up bars asked from the provider on full fetches.
    #[serde(default)]
    pub base_cushion: usize,

    /// Base timeframe used by `preload_symbol` when nothing is cached yet.
    #[serde(default = "default_base_timeframe")]
    pub default_base_timeframe: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            storage_ttl_secs: default_storage_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            quiet_window_secs: default_quiet_window_secs(),
            max_incremental_gap_secs: default_max_incremental_gap_secs(),
            max_incremental_bars: default_max_incremental_bars(),
            max_cached_candles: default_max_cached_candles(),
            preload_limit: default_preload_limit(),
            base_cushion: 0,
            default_base_timeframe: default_base_timeframe(),
        }
    }
}

// =============================================================================
// AggregatorConfig
// =============================================================================

/// Tunables for the live tick aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Timeframes initialised implicitly when a symbol's first tick arrives.
    #[serde(default = "default_live_timeframes")]
    pub default_timeframes: Vec<String>,

    /// Ring buffer size per symbol before compaction.
    #[serde(default = "default_tick_buffer_capacity")]
    pub tick_buffer_capacity: usize,

    /// Ticks kept after compaction.
    #[serde(default = "default_tick_buffer_retain")]
    pub tick_buffer_retain: usize,

    /// Number of trailing ticks averaged for outlier rejection.
    #[serde(default = "default_validation_window")]
    pub validation_window: usize,

    /// Maximum fractional deviation from the trailing average (0.5 = 50 %).
    #[serde(default = "default_max_price_deviation")]
    pub max_price_deviation: f64,

    /// Boundary checks run at `min(timeframe / 10, this)`.
    #[serde(default = "default_max_boundary_check_ms")]
    pub max_boundary_check_ms: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            default_timeframes: default_live_timeframes(),
            tick_buffer_capacity: default_tick_buffer_capacity(),
            tick_buffer_retain: default_tick_buffer_retain(),
            validation_window: default_validation_window(),
            max_price_deviation: default_max_price_deviation(),
            max_boundary_check_ms: default_max_boundary_check_ms(),
        }
    }
}

// =============================================================================
// PipelineConfig
// =============================================================================

/// Top-level configuration of the candle pipeline service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Symbols preloaded and streamed at startup.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Period of the background incremental refresh loop.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// Address the diagnostics API binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Directory backing the persisted cache snapshots.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: String,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub aggregator: AggregatorConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            refresh_interval_secs: default_refresh_interval_secs(),
            bind_addr: default_bind_addr(),
            storage_dir: default_storage_dir(),
            cache: CacheConfig::default(),
            aggregator: AggregatorConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read pipeline config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse pipeline config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            "pipeline config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration to `path` using an atomic write (write to
    /// `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise pipeline config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "pipeline config saved (atomic)");
        Ok(())
    }

    /// Apply `PIPELINE_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(syms) = std::env::var("PIPELINE_SYMBOLS") {
            self.symbols = parse_symbol_list(&syms);
        }
        if let Ok(addr) = std::env::var("PIPELINE_BIND_ADDR") {
            if !addr.trim().is_empty() {
                self.bind_addr = addr.trim().to_string();
            }
        }
        if let Ok(dir) = std::env::var("PIPELINE_STORAGE_DIR") {
            if !dir.trim().is_empty() {
                self.storage_dir = dir.trim().to_string();
            }
        }
    }
}

/// Split a comma-separated symbol list, upper-casing and dropping blanks.
pub fn parse_symbol_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}
