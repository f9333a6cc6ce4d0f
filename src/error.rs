// =============================================================================
// Fetch error taxonomy — what can go wrong while harvesting klines
// =============================================================================
//
// Transient vs Fatal is the load-bearing split: the cursor engine retries
// Transient errors with a fixed backoff and gives up immediately on Fatal
// ones. The classification itself happens in the exchange client, which is
// the only layer that can read Bybit return codes.
// =============================================================================

use thiserror::Error;

/// Errors produced while fetching, paginating, or assembling candle data.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The timeframe label is not in the recognised set.
    #[error("unknown timeframe label '{0}'")]
    UnknownTimeframe(String),

    /// A network or exchange hiccup worth retrying (timeouts, 429/5xx,
    /// Bybit retCode 10006/10016, malformed bodies).
    #[error("transient exchange error: {0}")]
    Transient(String),

    /// An error retrying cannot fix (bad credentials, invalid symbol,
    /// rejected parameters). Aborts the current timeframe's fetch.
    #[error("fatal exchange error: {0}")]
    Fatal(String),

    /// The bounded retry policy ran out of attempts on a transient error.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// The adapter returned a page whose last timestamp did not advance the
    /// cursor. Guard against looping forever on a stalled endpoint.
    #[error("pagination cursor made no progress at since={since_ms}")]
    NoProgress { since_ms: i64 },

    /// The assembler was handed zero rows when the caller required data.
    #[error("candle table is empty")]
    EmptyTable,

    /// Shutdown was observed while waiting (backoff, pacing, or in-flight).
    #[error("fetch cancelled by shutdown")]
    Cancelled,
}

impl FetchError {
    /// Whether the cursor engine should retry the same request.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retriable() {
        assert!(FetchError::Transient("timeout".into()).is_transient());
        assert!(!FetchError::Fatal("bad key".into()).is_transient());
        assert!(!FetchError::UnknownTimeframe("7m".into()).is_transient());
        assert!(!FetchError::NoProgress { since_ms: 0 }.is_transient());
        assert!(!FetchError::Cancelled.is_transient());
    }

    #[test]
    fn display_carries_context() {
        let err = FetchError::RetriesExhausted {
            attempts: 6,
            last: "connection reset".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("6 attempts"));
        assert!(msg.contains("connection reset"));
    }
}
