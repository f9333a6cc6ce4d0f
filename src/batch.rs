// =============================================================================
// Batch orchestrator — one cursor-engine run per timeframe, failures isolated
// =============================================================================
//
// Timeframe fetches are independent, so they run as concurrent tasks bounded
// by a semaphore (the exchange rate-limit budget is shared). Each task writes
// exactly one key of the outcome map; a failing timeframe is recorded and
// never aborts the others.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::FetchError;
use crate::fetch::{fetch_range, KlineSource, RetryPolicy};
use crate::shutdown::ShutdownSignal;
use crate::table::CandleTable;
use crate::timeframe::Timeframe;
use crate::types::{compact_symbol, FetchRequest, TimeRange};

/// How the time window for each timeframe is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// The `bars` most recent periods, ending now.
    Lookback { bars: u32 },
    /// From midnight UTC of `start` through now.
    Since { start: NaiveDate },
}

impl RangeSpec {
    /// Resolve to a concrete window against the given clock reading.
    pub fn resolve(&self, timeframe: Timeframe, now_ms: i64) -> TimeRange {
        match self {
            Self::Lookback { bars } => {
                let span = timeframe.duration_ms() * i64::from(*bars);
                TimeRange::new(now_ms - span, now_ms)
            }
            Self::Since { start } => {
                let since_ms = start
                    .and_time(NaiveTime::MIN)
                    .and_utc()
                    .timestamp_millis();
                TimeRange::new(since_ms, now_ms)
            }
        }
    }
}

/// Everything one batch run needs besides the adapter and policies.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    /// Display symbol, e.g. "BTC/USDT" (compacted before it reaches the
    /// exchange).
    pub symbol: String,
    pub timeframes: Vec<Timeframe>,
    pub range: RangeSpec,
    pub page_limit: u32,
}

/// A timeframe that did not produce a table, with the reason.
#[derive(Debug)]
pub struct TimeframeFailure {
    pub timeframe: Timeframe,
    pub error: FetchError,
}

/// Result of one batch run: tables for the timeframes that succeeded,
/// recorded failures for those that did not.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub tables: BTreeMap<Timeframe, CandleTable>,
    pub failures: Vec<TimeframeFailure>,
}

/// Fetch and assemble every requested timeframe.
///
/// Concurrency is bounded by `max_concurrent` (floored to 1). Duplicate
/// timeframes are collapsed so each outcome key is written exactly once.
pub async fn run_batch(
    source: Arc<dyn KlineSource>,
    request: &BatchRequest,
    policy: &RetryPolicy,
    max_concurrent: usize,
    shutdown: &ShutdownSignal,
) -> BatchOutcome {
    let now_ms = Utc::now().timestamp_millis();
    let symbol = compact_symbol(&request.symbol);
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));

    let mut seen = BTreeSet::new();
    let mut join_set: JoinSet<(Timeframe, Result<CandleTable, FetchError>)> = JoinSet::new();

    for &timeframe in &request.timeframes {
        if !seen.insert(timeframe) {
            debug!(timeframe = %timeframe, "duplicate timeframe in batch — skipping");
            continue;
        }

        let source = source.clone();
        let semaphore = semaphore.clone();
        let mut shutdown = shutdown.clone();
        let policy = policy.clone();
        let fetch_request = FetchRequest {
            symbol: symbol.clone(),
            timeframe,
            range: request.range.resolve(timeframe, now_ms),
            page_limit: request.page_limit,
        };

        join_set.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return (timeframe, Err(FetchError::Cancelled)),
            };

            info!(
                symbol = %fetch_request.symbol,
                timeframe = %timeframe,
                since_ms = fetch_request.range.since_ms,
                until_ms = fetch_request.range.until_ms,
                "fetching timeframe"
            );

            let outcome =
                fetch_range(source.as_ref(), &fetch_request, &policy, &mut shutdown).await;

            let outcome = outcome.map(|result| {
                info!(
                    timeframe = %timeframe,
                    rows = result.len(),
                    exhausted = result.exhausted,
                    "timeframe fetch complete"
                );
                CandleTable::from_candles(&result.candles)
            });

            (timeframe, outcome)
        });
    }

    let mut outcome = BatchOutcome::default();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((timeframe, Ok(table))) => {
                outcome.tables.insert(timeframe, table);
            }
            Ok((timeframe, Err(err))) => {
                warn!(timeframe = %timeframe, error = %err, "timeframe fetch failed");
                outcome.failures.push(TimeframeFailure { timeframe, error: err });
            }
            Err(join_err) => {
                error!(error = %join_err, "timeframe fetch task aborted");
            }
        }
    }

    outcome
}
