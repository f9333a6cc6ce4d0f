// =============================================================================
// Rate-Limit Tracker — monitors Bybit API budget to avoid 403/10006 bans
// =============================================================================
//
// Bybit reports the per-endpoint budget in response headers:
//   - X-Bapi-Limit                  total requests allowed in the window
//   - X-Bapi-Limit-Status           requests remaining in the window
//   - X-Bapi-Limit-Reset-Timestamp  ms timestamp when the window resets
//
// The tracker reads these after every request and keeps atomic counters that
// any task may query lock-free. When the remaining budget hits zero the
// client refuses to send until the advertised reset time has passed, turning
// a would-be 403 into a local transient error the cursor engine backs off on.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Remaining-budget level at which we start warning.
const REMAINING_WARN_THRESHOLD: u32 = 5;

/// Sentinel for "no header seen yet".
const UNKNOWN: u32 = u32::MAX;

/// Thread-safe rate-limit tracker backed by atomic counters.
pub struct RateLimitTracker {
    limit: AtomicU32,
    remaining: AtomicU32,
    reset_at_ms: AtomicI64,
}

/// Immutable snapshot of the current rate-limit state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_at_ms: Option<i64>,
}

impl RateLimitTracker {
    /// Create a new tracker with an unknown (unconstrained) budget.
    pub fn new() -> Self {
        Self {
            limit: AtomicU32::new(UNKNOWN),
            remaining: AtomicU32::new(UNKNOWN),
            reset_at_ms: AtomicI64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Header-based updates
    // -------------------------------------------------------------------------

    /// Update internal counters from the HTTP response headers returned by
    /// Bybit.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(limit) = header_u32(headers, "X-Bapi-Limit") {
            self.limit.store(limit, Ordering::Relaxed);
        }

        if let Some(remaining) = header_u32(headers, "X-Bapi-Limit-Status") {
            let prev = self.remaining.swap(remaining, Ordering::Relaxed);
            if remaining <= REMAINING_WARN_THRESHOLD && prev > REMAINING_WARN_THRESHOLD {
                warn!(
                    remaining,
                    "rate-limit budget running low"
                );
            }
            debug!(remaining, "rate-limit budget updated from header");
        }

        if let Some(val) = headers.get("X-Bapi-Limit-Reset-Timestamp") {
            if let Ok(s) = val.to_str() {
                if let Ok(ts) = s.parse::<i64>() {
                    self.reset_at_ms.store(ts, Ordering::Relaxed);
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Pre-flight check
    // -------------------------------------------------------------------------

    /// Return `true` if we may send another request: budget unknown, budget
    /// remaining, or the advertised reset time already passed.
    pub fn can_send_request(&self, now_ms: i64) -> bool {
        let remaining = self.remaining.load(Ordering::Relaxed);
        if remaining == UNKNOWN || remaining > 0 {
            return true;
        }
        let reset_at = self.reset_at_ms.load(Ordering::Relaxed);
        if now_ms >= reset_at {
            return true;
        }
        warn!(
            reset_at_ms = reset_at,
            "request blocked — rate-limit budget exhausted until reset"
        );
        false
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    /// Produce a serialisable snapshot of the current counters.
    pub fn snapshot(&self) -> RateLimitSnapshot {
        let limit = self.limit.load(Ordering::Relaxed);
        let remaining = self.remaining.load(Ordering::Relaxed);
        let reset_at = self.reset_at_ms.load(Ordering::Relaxed);
        RateLimitSnapshot {
            limit: (limit != UNKNOWN).then_some(limit),
            remaining: (remaining != UNKNOWN).then_some(remaining),
            reset_at_ms: (reset_at != 0).then_some(reset_at),
        }
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("limit", &self.limit.load(Ordering::Relaxed))
            .field("remaining", &self.remaining.load(Ordering::Relaxed))
            .field("reset_at_ms", &self.reset_at_ms.load(Ordering::Relaxed))
            .finish()
    }
}

fn header_u32(headers: &reqwest::header::HeaderMap, name: &str) -> Option<u32> {
    headers
        .get(name)?
        .to_str()
        .ok()?
        .parse::<u32>()
        .ok()
}

// =============================================================================
// RequestPacer — global minimum spacing between outgoing requests
// =============================================================================

/// Enforces the advertised minimum interval across every caller of one
/// client. The cursor engine paces its own loop, but concurrent timeframe
/// fetches share a single client — the pacer spaces their requests globally
/// so the combined stream stays inside the exchange budget.
pub struct RequestPacer {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    /// How long the caller must still wait before sending the next request.
    pub fn delay_before_next(&self) -> Duration {
        let last = self.last_request.lock();
        match *last {
            None => Duration::ZERO,
            Some(at) => self.min_interval.saturating_sub(at.elapsed()),
        }
    }

    /// Record that a request was just sent.
    pub fn mark_sent(&self) {
        *self.last_request.lock() = Some(Instant::now());
    }
}

impl std::fmt::Debug for RequestPacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPacer")
            .field("min_interval", &self.min_interval)
            .finish()
    }
}
