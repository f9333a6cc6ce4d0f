// =============================================================================
// Shared types used across the candela harvester
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::timeframe::Timeframe;

/// A single OHLCV candle as returned by the exchange.
///
/// `timestamp` is the bucket open time in milliseconds since the UNIX epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Half-open time window `[since_ms, until_ms)` in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub since_ms: i64,
    pub until_ms: i64,
}

impl TimeRange {
    pub fn new(since_ms: i64, until_ms: i64) -> Self {
        Self { since_ms, until_ms }
    }

    /// True when the window contains no instants (`since >= until`).
    pub fn is_empty(&self) -> bool {
        self.since_ms >= self.until_ms
    }
}

/// Immutable input to the pagination cursor engine.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Exchange symbol in compact form, e.g. "BTCUSDT".
    pub symbol: String,
    pub timeframe: Timeframe,
    pub range: TimeRange,
    /// Rows per page, at most the exchange maximum (1000 for Bybit klines).
    pub page_limit: u32,
}

/// Ordered candle sequence accumulated by one `fetch_range` run.
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    /// Candles ascending by timestamp, no duplicates.
    pub candles: Vec<Candle>,
    /// True when the exchange returned an empty page — no more data at or
    /// after the final cursor (true end of history or the real-time
    /// frontier; the exchange does not distinguish the two).
    pub exhausted: bool,
}

impl FetchResult {
    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Timestamp of the newest candle, if any.
    pub fn last_timestamp(&self) -> Option<i64> {
        self.candles.last().map(|c| c.timestamp)
    }
}

/// Strip the pair separator from a display symbol: "BTC/USDT" -> "BTCUSDT".
///
/// Used both for the exchange request and for output file names, so that a
/// symbol never introduces a path component.
pub fn compact_symbol(symbol: &str) -> String {
    symbol.replace('/', "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_range_emptiness() {
        assert!(TimeRange::new(10, 10).is_empty());
        assert!(TimeRange::new(11, 10).is_empty());
        assert!(!TimeRange::new(9, 10).is_empty());
    }

    #[test]
    fn fetch_result_last_timestamp() {
        let mut result = FetchResult::default();
        assert_eq!(result.last_timestamp(), None);
        assert!(result.is_empty());

        result.candles.push(Candle {
            timestamp: 1_000,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
        });
        result.candles.push(Candle {
            timestamp: 2_000,
            open: 1.5,
            high: 2.5,
            low: 1.0,
            close: 2.0,
            volume: 12.0,
        });
        assert_eq!(result.last_timestamp(), Some(2_000));
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn compact_symbol_strips_separator() {
        assert_eq!(compact_symbol("BTC/USDT"), "BTCUSDT");
        assert_eq!(compact_symbol("SOLUSDT"), "SOLUSDT");
    }
}
