// =============================================================================
// Harvest Configuration — file-backed settings with atomic save
// =============================================================================
//
// Every tunable parameter of a harvest run lives here. Persistence uses an
// atomic tmp + rename pattern to prevent corruption on crash. All fields
// carry `#[serde(default)]` so that adding new fields never breaks loading an
// older config file.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::batch::RangeSpec;
use crate::error::FetchError;
use crate::exchange::MAX_PAGE_LIMIT;
use crate::fetch::RetryPolicy;
use crate::timeframe::Timeframe;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbol() -> String {
    "BTC/USDT".to_string()
}

fn default_timeframes() -> Vec<String> {
    vec![
        "15m".to_string(),
        "1h".to_string(),
        "4h".to_string(),
        "1d".to_string(),
        "1w".to_string(),
    ]
}

fn default_lookback_bars() -> u32 {
    300
}

fn default_output_dir() -> String {
    "data".to_string()
}

fn default_page_limit() -> u32 {
    1000
}

fn default_max_retry_attempts() -> u32 {
    6
}

fn default_retry_backoff_secs() -> u64 {
    10
}

fn default_min_request_interval_ms() -> u64 {
    250
}

fn default_max_concurrent_fetches() -> usize {
    2
}

// =============================================================================
// HarvestConfig
// =============================================================================

/// Top-level configuration for one harvest run.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestConfig {
    // --- What to fetch ------------------------------------------------------

    /// Trading pair in display form, e.g. "BTC/USDT".
    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// Timeframe labels to harvest, each producing one table/file.
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<String>,

    /// How many most-recent bars to fetch when no start date is given.
    #[serde(default = "default_lookback_bars")]
    pub lookback_bars: u32,

    /// Optional explicit start date ("YYYY-MM-DD"). When set it wins over
    /// `lookback_bars` and the fetch runs from that date through now.
    #[serde(default)]
    pub start_date: Option<String>,

    // --- Output -------------------------------------------------------------

    /// Directory for the per-timeframe CSV files (created if absent).
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    // --- Exchange pacing & retry --------------------------------------------

    /// Rows per kline request, clamped to the exchange maximum on use.
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,

    /// Attempts per page before a transient error becomes permanent.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// Fixed wait between retry attempts, in seconds.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,

    /// Minimum spacing between consecutive exchange requests, in
    /// milliseconds.
    #[serde(default = "default_min_request_interval_ms")]
    pub min_request_interval_ms: u64,

    /// Timeframes fetched concurrently (they share one rate-limit budget).
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            timeframes: default_timeframes(),
            lookback_bars: default_lookback_bars(),
            start_date: None,
            output_dir: default_output_dir(),
            page_limit: default_page_limit(),
            max_retry_attempts: default_max_retry_attempts(),
            retry_backoff_secs: default_retry_backoff_secs(),
            min_request_interval_ms: default_min_request_interval_ms(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
        }
    }
}

impl HarvestConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read harvest config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse harvest config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.symbol,
            timeframes = ?config.timeframes,
            "harvest config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise harvest config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "harvest config saved (atomic)");
        Ok(())
    }

    /// Apply `HARVEST_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(symbol) = std::env::var("HARVEST_SYMBOL") {
            if !symbol.trim().is_empty() {
                self.symbol = symbol.trim().to_uppercase();
            }
        }
        if let Ok(timeframes) = std::env::var("HARVEST_TIMEFRAMES") {
            let labels: Vec<String> = timeframes
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !labels.is_empty() {
                self.timeframes = labels;
            }
        }
        if let Ok(start_date) = std::env::var("HARVEST_START_DATE") {
            if !start_date.trim().is_empty() {
                self.start_date = Some(start_date.trim().to_string());
            }
        }
        if let Ok(output_dir) = std::env::var("HARVEST_OUTPUT_DIR") {
            if !output_dir.trim().is_empty() {
                self.output_dir = output_dir.trim().to_string();
            }
        }
    }

    // -------------------------------------------------------------------------
    // Derived views
    // -------------------------------------------------------------------------

    /// Parse the configured timeframe labels, failing on the first unknown
    /// label rather than fetching a partial set silently.
    pub fn parsed_timeframes(&self) -> std::result::Result<Vec<Timeframe>, FetchError> {
        self.timeframes.iter().map(|label| label.parse()).collect()
    }

    /// The range mode for this run: explicit start date when configured,
    /// otherwise the lookback window.
    pub fn range_spec(&self) -> Result<RangeSpec> {
        match &self.start_date {
            Some(raw) => {
                let start = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .with_context(|| format!("invalid start_date '{raw}' (expected YYYY-MM-DD)"))?;
                Ok(RangeSpec::Since { start })
            }
            None => Ok(RangeSpec::Lookback {
                bars: self.lookback_bars,
            }),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_secs(self.retry_backoff_secs),
            self.max_retry_attempts,
        )
    }

    /// Page limit clamped to what the exchange accepts.
    pub fn effective_page_limit(&self) -> u32 {
        self.page_limit.clamp(1, MAX_PAGE_LIMIT)
    }

    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }
}
