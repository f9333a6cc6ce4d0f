// =============================================================================
// Candela — historical OHLCV harvester, main entry point
// =============================================================================
//
// Fetches candle history for one symbol across a set of timeframes from
// Bybit, paginating each range with retry and rate-limit pacing, and writes
// one CSV per timeframe. One timeframe failing never aborts the run.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod batch;
mod config;
mod error;
mod exchange;
mod fetch;
mod shutdown;
mod table;
mod timeframe;
mod types;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::batch::{run_batch, BatchRequest};
use crate::config::HarvestConfig;
use crate::exchange::{BybitClient, Credentials};
use crate::fetch::KlineSource;
use crate::shutdown::shutdown_channel;
use crate::types::compact_symbol;

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Candela OHLCV Harvester — Starting Up             ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = HarvestConfig::load("harvest_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        HarvestConfig::default()
    });
    config.apply_env_overrides();

    let timeframes = config.parsed_timeframes()?;
    let range_spec = config.range_spec()?;

    info!(
        symbol = %config.symbol,
        timeframes = ?config.timeframes,
        range = ?range_spec,
        output_dir = %config.output_dir,
        "harvest parameters"
    );

    // ── 2. Build exchange client ─────────────────────────────────────────
    let credentials = Credentials::from_env();
    let authenticated = credentials.is_some();
    let client = Arc::new(BybitClient::new(
        credentials,
        config.min_request_interval(),
    ));

    if authenticated {
        // The public kline endpoint needs no credentials; this only tells
        // the operator early whether their key pair is usable.
        match client.wallet_balance().await {
            Ok(equity) => info!(total_equity = equity, "API credentials verified"),
            Err(e) => {
                warn!(error = %e, "credential check failed — continuing with public endpoints")
            }
        }
    } else {
        info!("no API credentials configured — public endpoints only");
    }

    // ── 3. Cancellation on Ctrl-C ────────────────────────────────────────
    let (handle, signal) = shutdown_channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received — cancelling in-flight fetches");
            handle.shutdown();
        }
    });

    // ── 4. Run the batch ─────────────────────────────────────────────────
    let request = BatchRequest {
        symbol: config.symbol.clone(),
        timeframes,
        range: range_spec,
        page_limit: config.effective_page_limit(),
    };

    let source: Arc<dyn KlineSource> = client.clone();
    let outcome = run_batch(
        source,
        &request,
        &config.retry_policy(),
        config.max_concurrent_fetches,
        &signal,
    )
    .await;

    // ── 5. Persist results ───────────────────────────────────────────────
    let output_dir = Path::new(&config.output_dir);
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create output directory {}", output_dir.display()))?;

    let compact = compact_symbol(&config.symbol);
    let mut written = 0usize;
    for (timeframe, table) in &outcome.tables {
        if table.is_empty() {
            warn!(timeframe = %timeframe, "no rows fetched — skipping file");
            continue;
        }
        let path = output_dir.join(format!("{compact}_{timeframe}.csv"));
        match table.write_csv(&path) {
            Ok(()) => {
                written += 1;
                info!(timeframe = %timeframe, rows = table.len(), path = %path.display(), "table saved");
            }
            Err(e) => warn!(timeframe = %timeframe, error = %e, "failed to write table"),
        }
    }

    // ── 6. Summary ───────────────────────────────────────────────────────
    for failure in &outcome.failures {
        warn!(
            timeframe = %failure.timeframe,
            error = %failure.error,
            "timeframe failed"
        );
    }

    info!(
        succeeded = outcome.tables.len(),
        failed = outcome.failures.len(),
        files_written = written,
        rate_limit = ?client.rate_limit_snapshot(),
        "harvest complete"
    );

    Ok(())
}
