//! Download orchestrator: coordinates multi-symbol kline downloads.
//!
//! One run lists the exchange's markets once, rejects the whole request if
//! any symbol is unavailable, then downloads every symbol concurrently on a
//! private thread pool. Each symbol writes its own CSV file as batches
//! arrive, and a failing symbol never stops its siblings. The exchange
//! client is closed exactly once when the run ends, whichever way it ends.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use thiserror::Error;
use tracing::{error, info, warn};

use klinefetch_core::exchange::{Exchange, ExchangeError};
use klinefetch_core::sink::SinkError;
use klinefetch_core::{
    Batch, CsvKlineSink, DownloaderError, FetchRequest, InstantInput, KlinePaginator,
    RetryPolicy, Timeframe, TimestampStyle,
};

use crate::config::DownloadConfig;
use crate::progress::DownloadProgress;

// ─── Errors ─────────────────────────────────────────────────────────

/// Failures that abort a whole run before any symbol is downloaded.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid timeframe: {timeframe}. Available timeframes: {}", Timeframe::available())]
    InvalidTimeframe { timeframe: String },

    #[error(
        "the following symbols are not available on {exchange}: {}",
        join_symbols(.symbols)
    )]
    UnavailableSymbols {
        exchange: String,
        symbols: BTreeSet<String>,
    },

    #[error("failed to list markets: {0}")]
    MarketList(#[source] ExchangeError),

    #[error("failed to build download thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

fn join_symbols(symbols: &BTreeSet<String>) -> String {
    symbols.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}

// ─── Request and options ────────────────────────────────────────────

/// What to download: a set of symbols over one time range and timeframe.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadRequest {
    pub symbols: Vec<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Timeframe code, validated when the run starts.
    pub timeframe: String,
    pub output_dir: PathBuf,
}

impl DownloadRequest {
    /// Request ending now at the default `1h` timeframe.
    pub fn new<S: Into<String>>(
        symbols: impl IntoIterator<Item = S>,
        start: impl Into<InstantInput>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            symbols: symbols.into_iter().map(Into::into).collect(),
            start: start.into().to_utc(),
            end: Utc::now(),
            timeframe: Timeframe::default().to_string(),
            output_dir: output_dir.into(),
        }
    }

    pub fn with_end(mut self, end: impl Into<InstantInput>) -> Self {
        self.end = end.into().to_utc();
        self
    }

    pub fn with_timeframe(mut self, timeframe: impl Into<String>) -> Self {
        self.timeframe = timeframe.into();
        self
    }

    /// Requested symbols in order, without repeats.
    fn unique_symbols(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.symbols
            .iter()
            .map(String::as_str)
            .filter(|s| seen.insert(*s))
            .collect()
    }
}

/// How a run behaves, independent of what it downloads.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadOptions {
    /// Rows requested per klines call.
    pub limit: u32,
    pub retry: RetryPolicy,
    /// Worker cap. `None` runs every symbol at once.
    pub max_concurrency: Option<usize>,
    pub timestamp_style: TimestampStyle,
    /// Keep every yielded batch in the summary. Turn off to bound memory to
    /// one batch per symbol.
    pub retain_batches: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            limit: KlinePaginator::DEFAULT_LIMIT,
            retry: RetryPolicy::default(),
            max_concurrency: None,
            timestamp_style: TimestampStyle::default(),
            retain_batches: true,
        }
    }
}

impl From<&DownloadConfig> for DownloadOptions {
    fn from(config: &DownloadConfig) -> Self {
        Self {
            limit: config.limit,
            retry: config.retry.clone(),
            max_concurrency: config.max_concurrency,
            timestamp_style: config.timestamp_style,
            retain_batches: true,
        }
    }
}

// ─── Per-symbol results ─────────────────────────────────────────────

/// Lifecycle of one symbol within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolState {
    Pending,
    Fetching,
    Completed,
    Failed,
}

/// Everything fetched for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolDownload {
    pub symbol: String,
    pub path: PathBuf,
    /// Yielded batches in order. Empty when batches are not retained.
    pub batches: Vec<Batch>,
    pub batch_count: usize,
    pub kline_count: usize,
    pub first_timestamp: Option<i64>,
    pub last_timestamp: Option<i64>,
}

impl SymbolDownload {
    fn new(symbol: &str, path: &Path) -> Self {
        Self {
            symbol: symbol.to_string(),
            path: path.to_path_buf(),
            batches: Vec::new(),
            batch_count: 0,
            kline_count: 0,
            first_timestamp: None,
            last_timestamp: None,
        }
    }

    fn record(&mut self, batch: Batch, retain: bool) {
        if let (Some(first), Some(last)) = (batch.first(), batch.last()) {
            self.first_timestamp.get_or_insert(first.timestamp);
            self.last_timestamp = Some(last.timestamp);
        }
        self.batch_count += 1;
        self.kline_count += batch.len();
        if retain {
            self.batches.push(batch);
        }
    }
}

/// A symbol that stopped early, with whatever it had written by then.
#[derive(Debug, Error)]
#[error("{symbol}: {error}")]
pub struct SymbolFailure {
    pub symbol: String,
    #[source]
    pub error: DownloaderError,
    pub partial: SymbolDownload,
}

pub type SymbolOutcome = Result<SymbolDownload, SymbolFailure>;

pub fn outcome_state(outcome: &SymbolOutcome) -> SymbolState {
    match outcome {
        Ok(_) => SymbolState::Completed,
        Err(_) => SymbolState::Failed,
    }
}

/// Summary of a multi-symbol download, in request order.
#[derive(Debug)]
pub struct DownloadSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub symbols: Vec<(String, SymbolOutcome)>,
    pub elapsed: Duration,
}

impl DownloadSummary {
    fn new(symbols: Vec<(String, SymbolOutcome)>, elapsed: Duration) -> Self {
        let succeeded = symbols.iter().filter(|(_, o)| o.is_ok()).count();
        Self {
            total: symbols.len(),
            succeeded,
            failed: symbols.len() - succeeded,
            symbols,
            elapsed,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    pub fn get(&self, symbol: &str) -> Option<&SymbolOutcome> {
        self.symbols
            .iter()
            .find(|(s, _)| s == symbol)
            .map(|(_, o)| o)
    }

    pub fn failures(&self) -> impl Iterator<Item = &SymbolFailure> {
        self.symbols.iter().filter_map(|(_, o)| o.as_ref().err())
    }

    /// Klines written across all symbols, including partial downloads.
    pub fn total_klines(&self) -> usize {
        self.symbols
            .iter()
            .map(|(_, o)| match o {
                Ok(d) => d.kline_count,
                Err(f) => f.partial.kline_count,
            })
            .sum()
    }
}

// ─── Orchestrator ───────────────────────────────────────────────────

/// Closes the exchange when dropped, so every exit path closes it once.
struct CloseGuard<'a> {
    exchange: &'a dyn Exchange,
}

impl Drop for CloseGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.exchange.close() {
            warn!(exchange = self.exchange.name(), error = %e, "failed to close exchange client");
        }
    }
}

/// Downloads klines for many symbols from one exchange.
///
/// A downloader owns its exchange for a single run: `run` closes the client
/// on the way out.
pub struct KlineDownloader {
    exchange: Arc<dyn Exchange>,
    options: DownloadOptions,
    cancel: Arc<AtomicBool>,
}

impl KlineDownloader {
    pub fn new(exchange: Arc<dyn Exchange>) -> Self {
        Self {
            exchange,
            options: DownloadOptions::default(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_options(mut self, options: DownloadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    /// Flag that stops every symbol before its next exchange call once set.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Run a download to completion.
    ///
    /// Fails as a whole only for an invalid timeframe, unavailable symbols,
    /// a failed market listing, or a thread pool that cannot start.
    /// Per-symbol failures are reported in the summary instead.
    pub fn run(
        &self,
        request: &DownloadRequest,
        progress: &dyn DownloadProgress,
    ) -> Result<DownloadSummary, RunError> {
        let started = Instant::now();
        let _close = CloseGuard {
            exchange: self.exchange.as_ref(),
        };

        let timeframe: Timeframe = request.timeframe.parse().map_err(|_| RunError::InvalidTimeframe {
            timeframe: request.timeframe.clone(),
        })?;

        let available = self.exchange.list_markets().map_err(RunError::MarketList)?;
        let symbols = request.unique_symbols();
        let missing: BTreeSet<String> = symbols
            .iter()
            .filter(|s| !available.contains(**s))
            .map(|s| s.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(RunError::UnavailableSymbols {
                exchange: self.exchange.name().to_string(),
                symbols: missing,
            });
        }

        info!(
            exchange = self.exchange.name(),
            symbols = symbols.len(),
            %timeframe,
            start = %request.start,
            end = %request.end,
            "starting download"
        );

        for symbol in &symbols {
            progress.on_state(symbol, SymbolState::Pending);
        }

        let workers = self
            .options
            .max_concurrency
            .map_or(symbols.len(), |cap| cap.min(symbols.len()))
            .max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("klinefetch-{i}"))
            .build()?;

        let paginator = KlinePaginator::new(Arc::clone(&self.exchange))
            .with_limit(self.options.limit)
            .with_retry(self.options.retry.clone())
            .with_cancel_flag(Arc::clone(&self.cancel));

        let outcomes: Vec<(String, SymbolOutcome)> = pool.install(|| {
            symbols
                .par_iter()
                .map(|symbol| {
                    let fetch =
                        FetchRequest::with_timeframe(*symbol, timeframe, request.start, request.end);
                    let outcome =
                        self.download_symbol(&paginator, &fetch, &request.output_dir, progress);
                    (symbol.to_string(), outcome)
                })
                .collect()
        });

        let summary = DownloadSummary::new(outcomes, started.elapsed());
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            klines = summary.total_klines(),
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "download finished"
        );
        progress.on_run_complete(&summary);
        Ok(summary)
    }

    /// One symbol's unit of work: fetch every page and append it to the file.
    fn download_symbol(
        &self,
        paginator: &KlinePaginator,
        request: &FetchRequest,
        output_dir: &Path,
        progress: &dyn DownloadProgress,
    ) -> SymbolOutcome {
        let symbol = request.symbol();
        progress.on_state(symbol, SymbolState::Fetching);

        let mut sink = CsvKlineSink::new(
            output_dir,
            symbol,
            request.timeframe(),
            self.options.timestamp_style,
        );
        let mut download = SymbolDownload::new(symbol, sink.path());

        let fetched = self.fetch_into(paginator, request, output_dir, &mut sink, &mut download, progress);
        let outcome = match fetched {
            Ok(()) => {
                info!(symbol, klines = download.kline_count, "symbol complete");
                Ok(download)
            }
            Err(err) => {
                error!(symbol, error = %err, kept = download.kline_count, "symbol failed");
                Err(SymbolFailure {
                    symbol: symbol.to_string(),
                    error: err,
                    partial: download,
                })
            }
        };

        progress.on_state(symbol, outcome_state(&outcome));
        progress.on_complete(symbol, &outcome);
        outcome
    }

    fn fetch_into(
        &self,
        paginator: &KlinePaginator,
        request: &FetchRequest,
        output_dir: &Path,
        sink: &mut CsvKlineSink,
        download: &mut SymbolDownload,
        progress: &dyn DownloadProgress,
    ) -> Result<(), DownloaderError> {
        std::fs::create_dir_all(output_dir).map_err(|source| SinkError::Io {
            path: output_dir.to_path_buf(),
            source,
        })?;

        for batch in paginator.paginate_request(request) {
            let batch = batch?;
            sink.append(&batch)?;
            progress.on_batch(request.symbol(), &batch);
            download.record(batch, self.options.retain_batches);
        }
        Ok(())
    }
}
