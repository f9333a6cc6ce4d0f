// =============================================================================
// Retry policy — bounded fixed-interval backoff for transient fetch errors
// =============================================================================

use std::time::Duration;

/// How the cursor engine reacts to a transient page failure.
///
/// The backoff interval is fixed (no exponential growth): the exchange either
/// recovers within a few intervals or the attempt cap fails the fetch with
/// `RetriesExhausted`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Wait between attempts on the same cursor position.
    pub backoff: Duration,
    /// Maximum attempts for a single page, first try included. Never zero.
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(backoff: Duration, max_attempts: u32) -> Self {
        Self {
            backoff,
            max_attempts: max_attempts.max(1),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(10),
            max_attempts: 6,
        }
    }
}
