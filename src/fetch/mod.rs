// =============================================================================
// Fetch layer — the pagination cursor engine and its exchange-facing seam
// =============================================================================

pub mod cursor;
pub mod retry;

use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::error::FetchError;
use crate::timeframe::Timeframe;
use crate::types::Candle;

pub use cursor::fetch_range;
pub use retry::RetryPolicy;

/// The single capability the cursor engine consumes from an exchange.
///
/// Implementations own authentication and transport; the engine only sees
/// pages of candles or a classified [`FetchError`]. Object-safe (boxed
/// futures) so batch tasks can share one `Arc<dyn KlineSource>` and tests can
/// substitute a scripted double.
pub trait KlineSource: Send + Sync {
    /// Fetch one page of candles with open time `>= since_ms`, ascending,
    /// at most `limit` rows. An empty page means no data at or after
    /// `since_ms`.
    fn fetch_page<'a>(
        &'a self,
        symbol: &'a str,
        timeframe: Timeframe,
        since_ms: i64,
        limit: u32,
    ) -> BoxFuture<'a, Result<Vec<Candle>, FetchError>>;

    /// Minimum spacing between consecutive requests. Never zero — the engine
    /// sleeps this long between pages to stay inside the exchange's rate
    /// limit.
    fn min_request_interval(&self) -> Duration;
}
