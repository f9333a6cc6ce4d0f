// =============================================================================
// Bybit v5 REST API Client — public kline paging + HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. Signed requests
// carry X-BAPI-SIGN over "timestamp + api_key + recvWindow + query" with a
// recvWindow of 5 000 ms to tolerate minor clock drift between the harvester
// and Bybit servers. The kline endpoint is public; credentials are optional
// and only needed for the wallet-balance check.
// =============================================================================

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::error::FetchError;
use crate::exchange::rate_limit::{RateLimitSnapshot, RateLimitTracker, RequestPacer};
use crate::fetch::KlineSource;
use crate::timeframe::Timeframe;
use crate::types::Candle;

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Bybit caps kline pages at 1000 rows.
pub const MAX_PAGE_LIMIT: u32 = 1000;

/// API key pair for signed endpoints.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub secret: String,
}

impl Credentials {
    /// Read `BYBIT_API_KEY` / `BYBIT_API_SECRET` from the environment.
    /// Returns `None` unless both are present and non-empty — public
    /// endpoints work without them.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("BYBIT_API_KEY").ok()?;
        let secret = std::env::var("BYBIT_API_SECRET").ok()?;
        if api_key.is_empty() || secret.is_empty() {
            return None;
        }
        Some(Self { api_key, secret })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Bybit v5 REST client with optional HMAC-SHA256 request signing.
pub struct BybitClient {
    credentials: Option<Credentials>,
    base_url: String,
    client: reqwest::Client,
    rate_limit: RateLimitTracker,
    pacer: RequestPacer,
    min_request_interval: Duration,
}

impl BybitClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `BybitClient`.
    ///
    /// # Arguments
    /// * `credentials`          — optional key pair; absent means public
    ///                            endpoints only.
    /// * `min_request_interval` — advertised spacing between requests,
    ///                            floored to 1 ms so it is never zero.
    pub fn new(credentials: Option<Credentials>, min_request_interval: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(
            authenticated = credentials.is_some(),
            "BybitClient initialised (base_url=https://api.bybit.com)"
        );

        let min_request_interval = min_request_interval.max(Duration::from_millis(1));
        Self {
            credentials,
            base_url: "https://api.bybit.com".to_string(),
            client,
            rate_limit: RateLimitTracker::new(),
            pacer: RequestPacer::new(min_request_interval),
            min_request_interval,
        }
    }

    /// Wait out the global pacer, then mark this request as sent. Concurrent
    /// timeframe fetches share this client, so spacing is enforced across
    /// all of them, not just within one cursor loop.
    async fn pace(&self) {
        let delay = self.pacer.delay_before_next();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.pacer.mark_sent();
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `payload` with `secret`.
    fn sign(secret: &str, payload: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    pub fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /v5/market/kline (public — no signature required).
    ///
    /// Returns candles ascending by open time. Bybit serialises the page
    /// newest-first; the rows are re-ordered here so callers never see it.
    #[instrument(skip(self), name = "bybit::get_klines")]
    pub async fn get_klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        limit: u32,
    ) -> std::result::Result<Vec<Candle>, FetchError> {
        if !self
            .rate_limit
            .can_send_request(Self::timestamp_ms() as i64)
        {
            return Err(FetchError::Transient(
                "local rate-limit budget exhausted — waiting for window reset".to_string(),
            ));
        }

        let url = format!(
            "{}/v5/market/kline?category=spot&symbol={}&interval={}&start={}&limit={}",
            self.base_url,
            symbol,
            timeframe.bybit_interval(),
            start_ms,
            limit.min(MAX_PAGE_LIMIT)
        );

        self.pace().await;
        let resp = self.client.get(&url).send().await.map_err(|e| {
            FetchError::Transient(format!("GET /v5/market/kline request failed: {e}"))
        })?;

        self.rate_limit.update_from_headers(resp.headers());

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_http_status(status, &body));
        }

        let body: serde_json::Value = resp.json().await.map_err(|e| {
            FetchError::Transient(format!("failed to parse kline response: {e}"))
        })?;

        let candles = parse_kline_body(&body)?;

        debug!(
            symbol,
            interval = timeframe.bybit_interval(),
            count = candles.len(),
            "klines fetched"
        );
        Ok(candles)
    }

    // -------------------------------------------------------------------------
    // Account (signed)
    // -------------------------------------------------------------------------

    /// GET /v5/account/wallet-balance (signed) — total equity of the UNIFIED
    /// account. Used as a startup credential check; fails when no
    /// credentials are configured.
    #[instrument(skip(self), name = "bybit::wallet_balance")]
    pub async fn wallet_balance(&self) -> Result<f64> {
        let creds = self
            .credentials
            .as_ref()
            .context("no API credentials configured")?;

        let query = "accountType=UNIFIED";
        let ts = Self::timestamp_ms();
        let payload = format!("{ts}{}{RECV_WINDOW}{query}", creds.api_key);
        let signature = Self::sign(&creds.secret, &payload);

        let url = format!("{}/v5/account/wallet-balance?{query}", self.base_url);

        self.pace().await;
        let resp = self
            .client
            .get(&url)
            .header("X-BAPI-API-KEY", &creds.api_key)
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW.to_string())
            .header("X-BAPI-SIGN", signature)
            .send()
            .await
            .context("GET /v5/account/wallet-balance request failed")?;

        self.rate_limit.update_from_headers(resp.headers());

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse wallet-balance response")?;

        if !status.is_success() {
            anyhow::bail!(
                "Bybit GET /v5/account/wallet-balance returned {}: {}",
                status,
                body
            );
        }

        let ret_code = body["retCode"].as_i64().unwrap_or(-1);
        if ret_code != 0 {
            anyhow::bail!(
                "Bybit wallet-balance retCode {}: {}",
                ret_code,
                body["retMsg"].as_str().unwrap_or("")
            );
        }

        let equity: f64 = body["result"]["list"]
            .as_array()
            .and_then(|list| list.first())
            .and_then(|account| account["totalEquity"].as_str())
            .unwrap_or("0")
            .parse()
            .unwrap_or(0.0);

        debug!(total_equity = equity, "wallet balance retrieved");
        Ok(equity)
    }

    // -------------------------------------------------------------------------
    // Telemetry
    // -------------------------------------------------------------------------

    /// Current view of the exchange rate-limit budget.
    pub fn rate_limit_snapshot(&self) -> RateLimitSnapshot {
        self.rate_limit.snapshot()
    }
}

impl KlineSource for BybitClient {
    fn fetch_page<'a>(
        &'a self,
        symbol: &'a str,
        timeframe: Timeframe,
        since_ms: i64,
        limit: u32,
    ) -> BoxFuture<'a, std::result::Result<Vec<Candle>, FetchError>> {
        Box::pin(self.get_klines(symbol, timeframe, since_ms, limit))
    }

    fn min_request_interval(&self) -> Duration {
        self.min_request_interval
    }
}

impl std::fmt::Debug for BybitClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitClient")
            .field("credentials", &self.credentials)
            .field("base_url", &self.base_url)
            .field("min_request_interval", &self.min_request_interval)
            .finish()
    }
}

// =============================================================================
// Response parsing & error classification
// =============================================================================

/// Map an unsuccessful HTTP status to the retry taxonomy: throttling and
/// server-side failures are worth retrying, everything else is not.
fn classify_http_status(status: reqwest::StatusCode, body: &str) -> FetchError {
    if status.as_u16() == 429
        || status.as_u16() == 403
        || status.as_u16() == 408
        || status.is_server_error()
    {
        FetchError::Transient(format!("Bybit returned HTTP {status}: {body}"))
    } else {
        FetchError::Fatal(format!("Bybit returned HTTP {status}: {body}"))
    }
}

/// Map a non-zero Bybit retCode to the retry taxonomy.
///
/// 10002 (timestamp skew), 10006 (rate limit), 10016 (service error) and
/// 10018 (IP rate limit) recover on their own; auth and parameter errors
/// (10001/10003/10004/10005, …) do not.
fn classify_ret_code(code: i64, msg: &str) -> FetchError {
    match code {
        10002 | 10006 | 10016 | 10018 => {
            FetchError::Transient(format!("Bybit retCode {code}: {msg}"))
        }
        _ => FetchError::Fatal(format!("Bybit retCode {code}: {msg}")),
    }
}

/// Parse a full /v5/market/kline response body into ascending candles.
///
/// Row layout: `[startTime, open, high, low, close, volume, turnover]`, every
/// element a string.
fn parse_kline_body(body: &serde_json::Value) -> std::result::Result<Vec<Candle>, FetchError> {
    let ret_code = body["retCode"].as_i64().unwrap_or(-1);
    if ret_code != 0 {
        return Err(classify_ret_code(
            ret_code,
            body["retMsg"].as_str().unwrap_or(""),
        ));
    }

    let rows = body["result"]["list"].as_array().ok_or_else(|| {
        FetchError::Transient("kline response missing result.list array".to_string())
    })?;

    let mut candles = Vec::with_capacity(rows.len());
    for entry in rows {
        let arr = match entry.as_array() {
            Some(arr) if arr.len() >= 6 => arr,
            _ => {
                warn!("skipping malformed kline row: {entry}");
                continue;
            }
        };

        candles.push(Candle {
            timestamp: parse_str_i64(&arr[0])?,
            open: parse_str_f64(&arr[1])?,
            high: parse_str_f64(&arr[2])?,
            low: parse_str_f64(&arr[3])?,
            close: parse_str_f64(&arr[4])?,
            volume: parse_str_f64(&arr[5])?,
        });
    }

    // Bybit serialises newest-first; callers get ascending.
    if candles.len() >= 2 && candles[0].timestamp > candles[candles.len() - 1].timestamp {
        candles.reverse();
    }

    Ok(candles)
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: &serde_json::Value) -> std::result::Result<f64, FetchError> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .map_err(|_| FetchError::Transient(format!("failed to parse '{s}' as f64")))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        Err(FetchError::Transient(format!(
            "expected string or number, got: {val}"
        )))
    }
}

/// Parse a JSON value that may be either a string or a number into `i64`.
fn parse_str_i64(val: &serde_json::Value) -> std::result::Result<i64, FetchError> {
    if let Some(s) = val.as_str() {
        s.parse::<i64>()
            .map_err(|_| FetchError::Transient(format!("failed to parse '{s}' as i64")))
    } else if let Some(n) = val.as_i64() {
        Ok(n)
    } else {
        Err(FetchError::Transient(format!(
            "expected string or number, got: {val}"
        )))
    }
}
