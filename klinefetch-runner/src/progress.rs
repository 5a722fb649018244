//! Progress reporting for multi-symbol downloads.

use tracing::{debug, info, warn};

use klinefetch_core::Kline;

use crate::download::{DownloadSummary, SymbolOutcome, SymbolState};

/// Receives per-symbol state changes and batch arrivals.
///
/// Symbol tasks run on a thread pool, so callbacks for different symbols may
/// arrive concurrently and in any order. Callbacks for one symbol are ordered.
pub trait DownloadProgress: Send + Sync {
    /// A symbol moved to `state`.
    fn on_state(&self, _symbol: &str, _state: SymbolState) {}

    /// A batch for `symbol` was written to its file.
    fn on_batch(&self, _symbol: &str, _batch: &[Kline]) {}

    /// A symbol finished, successfully or not.
    fn on_complete(&self, _symbol: &str, _outcome: &SymbolOutcome) {}

    /// Every symbol task has joined.
    fn on_run_complete(&self, _summary: &DownloadSummary) {}
}

/// Ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl DownloadProgress for NoProgress {}

/// Simple progress reporter that prints to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutProgress;

impl DownloadProgress for StdoutProgress {
    fn on_state(&self, symbol: &str, state: SymbolState) {
        if state == SymbolState::Fetching {
            println!("Fetching {symbol}...");
        }
    }

    fn on_complete(&self, symbol: &str, outcome: &SymbolOutcome) {
        match outcome {
            Ok(d) => println!(
                "  OK: {symbol}: {} klines -> {}",
                d.kline_count,
                d.path.display()
            ),
            Err(f) => println!(
                "  FAIL: {symbol}: {} ({} klines kept)",
                f.error, f.partial.kline_count
            ),
        }
    }

    fn on_run_complete(&self, summary: &DownloadSummary) {
        println!(
            "\nDownload complete: {}/{} succeeded, {} failed in {:.1}s",
            summary.succeeded,
            summary.total,
            summary.failed,
            summary.elapsed.as_secs_f64()
        );
    }
}

/// Reports through `tracing`, for non-interactive runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl DownloadProgress for LogProgress {
    fn on_state(&self, symbol: &str, state: SymbolState) {
        debug!(symbol, ?state, "symbol state changed");
    }

    fn on_batch(&self, symbol: &str, batch: &[Kline]) {
        if let (Some(first), Some(last)) = (batch.first(), batch.last()) {
            debug!(
                symbol,
                rows = batch.len(),
                first = first.timestamp,
                last = last.timestamp,
                "batch written"
            );
        }
    }

    fn on_complete(&self, symbol: &str, outcome: &SymbolOutcome) {
        match outcome {
            Ok(d) => info!(symbol, klines = d.kline_count, path = %d.path.display(), "symbol done"),
            Err(f) => warn!(symbol, error = %f.error, kept = f.partial.kline_count, "symbol failed"),
        }
    }

    fn on_run_complete(&self, summary: &DownloadSummary) {
        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "download run complete"
        );
    }
}
