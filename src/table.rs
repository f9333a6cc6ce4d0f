// =============================================================================
// Table assembler — candle sequence to a fixed-column table, plus CSV output
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::warn;

use crate::error::FetchError;
use crate::types::Candle;

/// Column layout of every assembled table (and of the CSV header row).
pub const COLUMNS: [&str; 6] = ["date", "Open", "High", "Low", "Close", "Volume"];

/// One table row: the candle's millisecond timestamp resolved to a UTC
/// calendar date-time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableRow {
    pub date: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Tabular view over an ordered candle sequence. A zero-row table is valid;
/// callers that need data use [`CandleTable::require_rows`].
#[derive(Debug, Clone, Default)]
pub struct CandleTable {
    rows: Vec<TableRow>,
}

impl CandleTable {
    /// Build a table from candles, preserving input order (already ascending
    /// when it comes out of the cursor engine).
    ///
    /// A timestamp outside chrono's representable range cannot come from a
    /// real exchange; such rows are dropped with a warning rather than
    /// poisoning the whole table.
    pub fn from_candles(candles: &[Candle]) -> Self {
        let mut rows = Vec::with_capacity(candles.len());
        for candle in candles {
            match chrono::DateTime::from_timestamp_millis(candle.timestamp) {
                Some(dt) => rows.push(TableRow {
                    date: dt.naive_utc(),
                    open: candle.open,
                    high: candle.high,
                    low: candle.low,
                    close: candle.close,
                    volume: candle.volume,
                }),
                None => {
                    warn!(timestamp = candle.timestamp, "dropping candle with unrepresentable timestamp");
                }
            }
        }
        Self { rows }
    }

    pub fn rows(&self) -> &[TableRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Fail with [`FetchError::EmptyTable`] when the table has no rows.
    pub fn require_rows(&self) -> std::result::Result<&Self, FetchError> {
        if self.rows.is_empty() {
            Err(FetchError::EmptyTable)
        } else {
            Ok(self)
        }
    }

    /// Write the table to `path` as CSV with the header row
    /// `date,Open,High,Low,Close,Volume` and dates rendered as
    /// `YYYY-MM-DD HH:MM:SS`.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("failed to create {}", path.display()))?;

        writer
            .write_record(COLUMNS)
            .context("failed to write CSV header")?;

        for row in &self.rows {
            writer
                .write_record(&[
                    row.date.format("%Y-%m-%d %H:%M:%S").to_string(),
                    row.open.to_string(),
                    row.high.to_string(),
                    row.low.to_string(),
                    row.close.to_string(),
                    row.volume.to_string(),
                ])
                .with_context(|| format!("failed to write CSV row to {}", path.display()))?;
        }

        writer
            .flush()
            .with_context(|| format!("failed to flush {}", path.display()))?;
        Ok(())
    }
}
