// =============================================================================
// Pagination cursor engine — walks a time range in fixed-size pages
// =============================================================================
//
// The cursor invariant: after a non-empty page the next `since` is the last
// received timestamp + 1 ms, strictly greater than every timestamp already
// accumulated. Each page therefore starts at or after the advanced cursor
// and the final sequence is globally ascending with no duplicates.
//
// Termination:
//   - empty page        -> `exhausted = true` (end of history or the
//                          real-time frontier; the exchange cannot tell us
//                          which)
//   - cursor >= until   -> requested range fully covered
//   - non-advancing page-> `NoProgress` (stalled endpoint guard)
// =============================================================================

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::FetchError;
use crate::fetch::{KlineSource, RetryPolicy};
use crate::shutdown::ShutdownSignal;
use crate::types::{FetchRequest, FetchResult};

/// Fetch every candle in `request.range`, paginating with `request.page_limit`
/// rows per call.
///
/// Transient adapter errors are retried at the same cursor position per
/// `policy`; fatal errors abort immediately, discarding this timeframe's
/// partial progress. All waits race against `shutdown`.
pub async fn fetch_range(
    source: &dyn KlineSource,
    request: &FetchRequest,
    policy: &RetryPolicy,
    shutdown: &mut ShutdownSignal,
) -> Result<FetchResult, FetchError> {
    if shutdown.is_cancelled() {
        return Err(FetchError::Cancelled);
    }

    if request.range.is_empty() {
        debug!(
            symbol = %request.symbol,
            timeframe = %request.timeframe,
            "empty time range — nothing to fetch"
        );
        return Ok(FetchResult {
            candles: Vec::new(),
            exhausted: true,
        });
    }

    let mut since = request.range.since_ms;
    let until = request.range.until_ms;
    let mut result = FetchResult::default();

    // The adapter advertises its minimum spacing; floor it so the delay is
    // never zero.
    let pace = source
        .min_request_interval()
        .max(Duration::from_millis(1));

    while since < until {
        let page = fetch_page_with_retry(source, request, since, policy, shutdown).await?;

        let last_ts = match page.last() {
            Some(candle) => candle.timestamp,
            None => {
                debug!(
                    symbol = %request.symbol,
                    timeframe = %request.timeframe,
                    since,
                    rows = result.len(),
                    "empty page — pagination exhausted"
                );
                result.exhausted = true;
                break;
            }
        };

        let next_since = last_ts + 1;
        if next_since <= since {
            return Err(FetchError::NoProgress { since_ms: since });
        }

        result.candles.extend(page);
        since = next_since;

        debug!(
            symbol = %request.symbol,
            timeframe = %request.timeframe,
            rows = result.len(),
            last = %format_ts(last_ts),
            "page appended"
        );

        if since < until {
            wait_or_cancel(pace, shutdown).await?;
        }
    }

    Ok(result)
}

/// One page at a fixed cursor position, retrying transient errors with the
/// policy's fixed backoff until the attempt cap is hit.
async fn fetch_page_with_retry(
    source: &dyn KlineSource,
    request: &FetchRequest,
    since_ms: i64,
    policy: &RetryPolicy,
    shutdown: &mut ShutdownSignal,
) -> Result<Vec<crate::types::Candle>, FetchError> {
    let mut attempts: u32 = 0;

    loop {
        if shutdown.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let outcome = tokio::select! {
            page = source.fetch_page(
                &request.symbol,
                request.timeframe,
                since_ms,
                request.page_limit,
            ) => page,
            _ = shutdown.cancelled() => return Err(FetchError::Cancelled),
        };

        match outcome {
            Ok(page) => return Ok(page),
            Err(err) if err.is_transient() => {
                attempts += 1;
                if attempts >= policy.max_attempts {
                    return Err(FetchError::RetriesExhausted {
                        attempts,
                        last: err.to_string(),
                    });
                }
                warn!(
                    symbol = %request.symbol,
                    timeframe = %request.timeframe,
                    since_ms,
                    attempt = attempts,
                    max_attempts = policy.max_attempts,
                    backoff_secs = policy.backoff.as_secs(),
                    error = %err,
                    "transient fetch error — backing off"
                );
                wait_or_cancel(policy.backoff, shutdown).await?;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Sleep for `duration` unless shutdown fires first.
async fn wait_or_cancel(
    duration: Duration,
    shutdown: &mut ShutdownSignal,
) -> Result<(), FetchError> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = shutdown.cancelled() => Err(FetchError::Cancelled),
    }
}

fn format_ts(ts_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts_ms)
        .map(|dt| dt.naive_utc().to_string())
        .unwrap_or_else(|| ts_ms.to_string())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    use futures_util::future::BoxFuture;
    use parking_lot::Mutex;

    use crate::shutdown::shutdown_channel;
    use crate::timeframe::Timeframe;
    use crate::types::{Candle, TimeRange};

    fn candle(ts: i64) -> Candle {
        Candle {
            timestamp: ts,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
        }
    }

    fn request(since: i64, until: i64, page_limit: u32) -> FetchRequest {
        FetchRequest {
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::M15,
            range: TimeRange::new(since, until),
            page_limit,
        }
    }

    fn quick_policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(10), 6)
    }

    /// Replays a fixed script of page results; once the script runs dry every
    /// further call returns an empty page.
    #[derive(Default)]
    struct ScriptedSource {
        pages: Mutex<VecDeque<Result<Vec<Candle>, FetchError>>>,
        calls: AtomicU32,
        since_log: Mutex<Vec<i64>>,
        interval: Duration,
    }

    impl ScriptedSource {
        fn new(pages: Vec<Result<Vec<Candle>, FetchError>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                ..Default::default()
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl KlineSource for ScriptedSource {
        fn fetch_page<'a>(
            &'a self,
            _symbol: &'a str,
            _timeframe: Timeframe,
            since_ms: i64,
            _limit: u32,
        ) -> BoxFuture<'a, Result<Vec<Candle>, FetchError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.since_log.lock().push(since_ms);
                self.pages.lock().pop_front().unwrap_or_else(|| Ok(Vec::new()))
            })
        }

        fn min_request_interval(&self) -> Duration {
            self.interval
        }
    }

    /// Serves a synthetic candle series at a fixed step, honouring `since`
    /// and `limit` the way a real exchange does.
    struct SeriesSource {
        first_ts: i64,
        last_ts: i64,
        step_ms: i64,
        calls: AtomicU32,
    }

    impl SeriesSource {
        fn new(first_ts: i64, last_ts: i64, step_ms: i64) -> Self {
            Self {
                first_ts,
                last_ts,
                step_ms,
                calls: AtomicU32::new(0),
            }
        }
    }

    impl KlineSource for SeriesSource {
        fn fetch_page<'a>(
            &'a self,
            _symbol: &'a str,
            _timeframe: Timeframe,
            since_ms: i64,
            limit: u32,
        ) -> BoxFuture<'a, Result<Vec<Candle>, FetchError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let mut ts = if since_ms <= self.first_ts {
                    self.first_ts
                } else {
                    // First bucket at or after the cursor.
                    let offset = since_ms - self.first_ts;
                    let buckets = (offset + self.step_ms - 1) / self.step_ms;
                    self.first_ts + buckets * self.step_ms
                };
                let mut page = Vec::new();
                while ts <= self.last_ts && (page.len() as u32) < limit {
                    page.push(candle(ts));
                    ts += self.step_ms;
                }
                Ok(page)
            })
        }

        fn min_request_interval(&self) -> Duration {
            Duration::from_millis(1)
        }
    }

    fn assert_strictly_ascending(candles: &[Candle]) {
        for pair in candles.windows(2) {
            assert!(
                pair[0].timestamp < pair[1].timestamp,
                "timestamps not strictly ascending: {} then {}",
                pair[0].timestamp,
                pair[1].timestamp
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn paginates_across_pages_ascending_unique() {
        let source = ScriptedSource::new(vec![
            Ok(vec![candle(0), candle(1_000), candle(2_000)]),
            Ok(vec![candle(3_000), candle(4_000)]),
        ]);
        let req = request(0, 1_000_000, 100);
        let mut shutdown = ShutdownSignal::never();

        let result = fetch_range(&source, &req, &quick_policy(), &mut shutdown)
            .await
            .unwrap();

        assert_eq!(result.len(), 5);
        assert!(result.exhausted);
        assert_strictly_ascending(&result.candles);
        // Two data pages plus the empty terminator.
        assert_eq!(source.calls(), 3);
        // Cursor always advanced to last timestamp + 1.
        assert_eq!(*source.since_log.lock(), vec![0, 2_001, 4_001]);
    }

    #[tokio::test]
    async fn empty_first_page_is_exhausted_not_an_error() {
        let source = ScriptedSource::new(vec![]);
        let req = request(0, 1_000_000, 100);
        let mut shutdown = ShutdownSignal::never();

        let result = fetch_range(&source, &req, &quick_policy(), &mut shutdown)
            .await
            .unwrap();

        assert!(result.is_empty());
        assert!(result.exhausted);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn start_at_or_after_end_skips_adapter() {
        let source = ScriptedSource::new(vec![Ok(vec![candle(0)])]);
        let mut shutdown = ShutdownSignal::never();

        for (since, until) in [(1_000, 1_000), (2_000, 1_000)] {
            let req = request(since, until, 100);
            let result = fetch_range(&source, &req, &quick_policy(), &mut shutdown)
                .await
                .unwrap();
            assert!(result.is_empty());
            assert!(result.exhausted);
        }
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn continuation_from_last_plus_one_has_no_overlap() {
        let step = 60_000;
        let mut shutdown = ShutdownSignal::never();

        // First run: only four buckets of history exist yet.
        let source = SeriesSource::new(0, 3 * step, step);
        let first = fetch_range(
            &source,
            &request(0, 3 * step + 1, 100),
            &quick_policy(),
            &mut shutdown,
        )
        .await
        .unwrap();
        assert_eq!(first.len(), 4);
        let resume_at = first.last_timestamp().unwrap() + 1;

        // Later run against the same series, now grown to ten buckets.
        let source = SeriesSource::new(0, 9 * step, step);
        let second = fetch_range(
            &source,
            &request(resume_at, 9 * step + 1, 100),
            &quick_policy(),
            &mut shutdown,
        )
        .await
        .unwrap();

        assert_eq!(second.len(), 6);
        assert!(second.candles[0].timestamp > first.last_timestamp().unwrap());
        let mut all = first.candles.clone();
        all.extend(second.candles.clone());
        assert_strictly_ascending(&all);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_transparent_to_the_result() {
        let flaky = ScriptedSource::new(vec![
            Err(FetchError::Transient("connection reset".into())),
            Err(FetchError::Transient("HTTP 503".into())),
            Ok(vec![candle(0), candle(1_000)]),
        ]);
        let clean = ScriptedSource::new(vec![Ok(vec![candle(0), candle(1_000)])]);
        let req = request(0, 1_000_000, 100);
        let mut shutdown = ShutdownSignal::never();

        let from_flaky = fetch_range(&flaky, &req, &quick_policy(), &mut shutdown)
            .await
            .unwrap();
        let from_clean = fetch_range(&clean, &req, &quick_policy(), &mut shutdown)
            .await
            .unwrap();

        assert_eq!(from_flaky.candles, from_clean.candles);
        assert_eq!(from_flaky.exhausted, from_clean.exhausted);
        // Two failures retried at the same cursor, then the data page and the
        // empty terminator.
        assert_eq!(flaky.calls(), 4);
        assert_eq!(*flaky.since_log.lock(), vec![0, 0, 0, 1_001]);
    }

    #[tokio::test]
    async fn fatal_error_aborts_without_retry() {
        let source = ScriptedSource::new(vec![
            Err(FetchError::Fatal("invalid api key".into())),
            Ok(vec![candle(0)]),
        ]);
        let req = request(0, 1_000_000, 100);
        let mut shutdown = ShutdownSignal::never();

        let err = fetch_range(&source, &req, &quick_policy(), &mut shutdown)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Fatal(_)));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhausted_after_attempt_cap() {
        let source = ScriptedSource::new(vec![
            Err(FetchError::Transient("boom".into())),
            Err(FetchError::Transient("boom".into())),
            Err(FetchError::Transient("boom".into())),
            Ok(vec![candle(0)]),
        ]);
        let req = request(0, 1_000_000, 100);
        let policy = RetryPolicy::new(Duration::from_secs(10), 3);
        let mut shutdown = ShutdownSignal::never();

        let err = fetch_range(&source, &req, &policy, &mut shutdown)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            FetchError::RetriesExhausted { attempts: 3, .. }
        ));
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_adapter_triggers_no_progress() {
        // Adapter keeps replaying the same page: the first iteration advances
        // the cursor past it, the second detects the stall.
        let source = ScriptedSource::new(vec![
            Ok(vec![candle(5_000)]),
            Ok(vec![candle(5_000)]),
        ]);
        let req = request(5_000, 1_000_000, 100);
        let mut shutdown = ShutdownSignal::never();

        let err = fetch_range(&source, &req, &quick_policy(), &mut shutdown)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::NoProgress { since_ms: 5_001 }));
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn page_behind_cursor_triggers_no_progress() {
        let source = ScriptedSource::new(vec![Ok(vec![candle(4_000)])]);
        let req = request(5_000, 1_000_000, 100);
        let mut shutdown = ShutdownSignal::never();

        let err = fetch_range(&source, &req, &quick_policy(), &mut shutdown)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::NoProgress { since_ms: 5_000 }));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn five_thousand_rows_across_five_calls() {
        let step = 60_000;
        let last = 4_999 * step;
        let source = SeriesSource::new(0, last, step);
        let req = request(0, last + 1, 1_000);
        let mut shutdown = ShutdownSignal::never();

        let result = fetch_range(&source, &req, &quick_policy(), &mut shutdown)
            .await
            .unwrap();

        assert_eq!(result.len(), 5_000);
        assert_strictly_ascending(&result.candles);
        assert_eq!(source.calls.load(Ordering::SeqCst), 5);
        // Range end reached, not an empty page.
        assert!(!result.exhausted);
        assert_eq!(result.last_timestamp(), Some(last));
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_delay_applied_between_pages() {
        let source = ScriptedSource {
            pages: Mutex::new(
                vec![
                    Ok(vec![candle(0)]),
                    Ok(vec![candle(1_000)]),
                ]
                .into(),
            ),
            interval: Duration::from_millis(250),
            ..Default::default()
        };
        let req = request(0, 1_000_000, 100);
        let mut shutdown = ShutdownSignal::never();

        let started = tokio::time::Instant::now();
        fetch_range(&source, &req, &quick_policy(), &mut shutdown)
            .await
            .unwrap();

        // One pacing sleep after each of the two data pages.
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn pre_cancelled_shutdown_skips_adapter() {
        let source = ScriptedSource::new(vec![Ok(vec![candle(0)])]);
        let req = request(0, 1_000_000, 100);
        let (handle, mut shutdown) = shutdown_channel();
        handle.shutdown();

        let err = fetch_range(&source, &req, &quick_policy(), &mut shutdown)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Cancelled));
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_backoff_cancels_promptly() {
        let source = std::sync::Arc::new(ScriptedSource::new(vec![Err(
            FetchError::Transient("boom".into()),
        )]));
        let req = request(0, 1_000_000, 100);
        let (handle, shutdown) = shutdown_channel();

        let task_source = source.clone();
        let task = tokio::spawn(async move {
            let mut shutdown = shutdown;
            fetch_range(task_source.as_ref(), &req, &quick_policy(), &mut shutdown).await
        });

        // Let the fetch reach the 10 s backoff sleep, then pull the plug.
        tokio::task::yield_now().await;
        handle.shutdown();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
        assert_eq!(source.calls(), 1);
    }
}
