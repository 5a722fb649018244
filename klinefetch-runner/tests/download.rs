//! Integration tests for the multi-symbol download orchestrator.
//!
//! Runs full downloads against the in-memory exchange into temp directories.
//! Tests: end-to-end scenario file contents, up-front unavailable symbols,
//! sibling isolation, close-exactly-once on every exit path, cancellation,
//! appends across runs, progress callbacks, bounded memory mode.

use chrono::{TimeZone, Utc};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use klinefetch_core::exchange::ExchangeError;
use klinefetch_core::{DownloaderError, Kline, MemoryExchange, RetryPolicy, Timeframe, TimestampStyle};
use klinefetch_runner::{
    DownloadOptions, DownloadProgress, DownloadRequest, DownloadSummary, KlineDownloader, NoProgress,
    RunError, SymbolOutcome, SymbolState,
};

// ──────────────────────────────────────────────
// Helpers
// ──────────────────────────────────────────────

const SEP_1_2020_MS: i64 = 1_598_918_400_000;

fn options() -> DownloadOptions {
    DownloadOptions {
        retry: RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            multiplier: 2,
            jitter_factor: 0.0,
        },
        timestamp_style: TimestampStyle::Utc,
        ..DownloadOptions::default()
    }
}

fn request(symbols: &[&str], dir: &Path, timeframe: &str) -> DownloadRequest {
    DownloadRequest::new(
        symbols.iter().copied(),
        Utc.with_ymd_and_hms(2020, 9, 1, 0, 0, 0).unwrap(),
        dir,
    )
    .with_end(Utc.with_ymd_and_hms(2020, 9, 2, 0, 0, 0).unwrap())
    .with_timeframe(timeframe)
}

fn half_hour_page(n: usize) -> Vec<Kline> {
    (0..n)
        .map(|i| {
            let close = 11_650.0 + i as f64 * 2.5;
            Kline::new(
                SEP_1_2020_MS + i as i64 * Timeframe::M30.duration_ms(),
                close - 1.0,
                close + 4.0,
                close - 3.0,
                close,
                420.5,
            )
        })
        .collect()
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

/// Records every progress event for later assertions.
#[derive(Default)]
struct Recorder {
    states: Mutex<Vec<(String, SymbolState)>>,
    batches: Mutex<Vec<(String, usize)>>,
    completed: Mutex<Vec<String>>,
    runs: Mutex<usize>,
}

impl DownloadProgress for Recorder {
    fn on_state(&self, symbol: &str, state: SymbolState) {
        self.states.lock().unwrap().push((symbol.to_string(), state));
    }

    fn on_batch(&self, symbol: &str, batch: &[Kline]) {
        self.batches.lock().unwrap().push((symbol.to_string(), batch.len()));
    }

    fn on_complete(&self, symbol: &str, _outcome: &SymbolOutcome) {
        self.completed.lock().unwrap().push(symbol.to_string());
    }

    fn on_run_complete(&self, _summary: &DownloadSummary) {
        *self.runs.lock().unwrap() += 1;
    }
}

impl Recorder {
    fn states_for(&self, symbol: &str) -> Vec<SymbolState> {
        self.states
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == symbol)
            .map(|(_, st)| *st)
            .collect()
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[test]
fn scenario_writes_header_and_rows() {
    let dir = tempfile::tempdir().unwrap();
    let ex = Arc::new(MemoryExchange::new().with_script("BTC/USDT", vec![Ok(half_hour_page(48))]));

    let summary = KlineDownloader::new(ex.clone())
        .with_options(options())
        .run(&request(&["BTC/USDT"], dir.path(), "30m"), &NoProgress)
        .unwrap();

    assert!(summary.all_succeeded());
    let download = summary.get("BTC/USDT").unwrap().as_ref().unwrap();
    assert_eq!(download.kline_count, 48);
    assert_eq!(download.batches.len(), 1);
    assert_eq!(download.first_timestamp, Some(SEP_1_2020_MS));
    assert_eq!(download.path, dir.path().join("BTC_USDT-30m.csv"));

    let lines = read_lines(&download.path);
    assert_eq!(lines.len(), 49);
    assert_eq!(lines[0], "timestamp,open,high,low,close,volume");
    assert_eq!(lines[1], "2020-09-01 00:00:00,11649.0,11654.0,11647.0,11650.0,420.5");
    assert!(lines[48].starts_with("2020-09-01 23:30:00,"));

    let calls = ex.calls_for("BTC/USDT");
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].since_ms, SEP_1_2020_MS);
    assert_eq!(calls[1].since_ms, download.last_timestamp.unwrap() + 1);
    assert_eq!(ex.market_list_count(), 1);
    assert_eq!(ex.close_count(), 1);
}

#[test]
fn unavailable_symbols_fail_before_any_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let ex = Arc::new(MemoryExchange::new().with_generated_series("BTC/USDT", Timeframe::H1, SEP_1_2020_MS, 24));

    let err = KlineDownloader::new(ex.clone())
        .with_options(options())
        .run(
            &request(&["BTC/USDT", "FOO/BAR", "ABC/XYZ"], dir.path(), "1h"),
            &NoProgress,
        )
        .unwrap_err();

    match err {
        RunError::UnavailableSymbols { symbols, .. } => {
            let names: Vec<&str> = symbols.iter().map(String::as_str).collect();
            assert_eq!(names, vec!["ABC/XYZ", "FOO/BAR"]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(ex.fetch_count(), 0);
    assert_eq!(ex.close_count(), 1);
    assert!(!dir.path().join("BTC_USDT-1h.csv").exists());
}

#[test]
fn failing_symbol_does_not_stop_siblings() {
    let dir = tempfile::tempdir().unwrap();
    let ex = Arc::new(
        MemoryExchange::new()
            .with_generated_series("ETH/USDT", Timeframe::H1, SEP_1_2020_MS, 24)
            .with_script(
                "FOO/BAR",
                vec![Err(ExchangeError::UnknownSymbol {
                    symbol: "FOOBAR".into(),
                    reason: "Invalid symbol.".into(),
                })],
            )
            .with_script(
                "DOGE/USDT",
                vec![
                    Ok(vec![Kline::new(SEP_1_2020_MS, 0.003, 0.004, 0.002, 0.0035, 1e6)]),
                    Err(ExchangeError::Http {
                        status: 400,
                        message: "bad request".into(),
                    }),
                ],
            ),
    );

    let summary = KlineDownloader::new(ex.clone())
        .with_options(options())
        .run(
            &request(&["ETH/USDT", "FOO/BAR", "DOGE/USDT"], dir.path(), "1h"),
            &NoProgress,
        )
        .unwrap();

    assert_eq!(summary.total, 3);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 2);
    assert!(!summary.all_succeeded());

    let eth = summary.get("ETH/USDT").unwrap().as_ref().unwrap();
    assert_eq!(eth.kline_count, 24);
    assert_eq!(read_lines(&eth.path).len(), 25);

    let foo = summary.get("FOO/BAR").unwrap().as_ref().unwrap_err();
    assert!(matches!(foo.error, DownloaderError::UnknownSymbol { .. }));
    assert!(!dir.path().join("FOO_BAR-1h.csv").exists());

    // The partial download survives the failure
    let doge = summary.get("DOGE/USDT").unwrap().as_ref().unwrap_err();
    assert!(matches!(doge.error, DownloaderError::Exchange { .. }));
    assert_eq!(doge.partial.kline_count, 1);
    assert_eq!(read_lines(&doge.partial.path).len(), 2);

    assert_eq!(summary.failures().count(), 2);
    assert_eq!(summary.total_klines(), 25);
    assert_eq!(ex.close_count(), 1);
}

#[test]
fn summary_keeps_request_order() {
    let dir = tempfile::tempdir().unwrap();
    let symbols = ["SOL/USDT", "ADA/USDT", "BTC/USDT", "ETH/BTC"];
    let ex = symbols.iter().fold(MemoryExchange::new(), |ex, s| {
        ex.with_generated_series(s, Timeframe::H4, SEP_1_2020_MS, 6)
    });

    let summary = KlineDownloader::new(Arc::new(ex))
        .with_options(options())
        .run(&request(&symbols, dir.path(), "4h"), &NoProgress)
        .unwrap();

    let order: Vec<&str> = summary.symbols.iter().map(|(s, _)| s.as_str()).collect();
    assert_eq!(order, symbols.to_vec());
    assert!(dir.path().join("ETH_BTC-4h.csv").exists());
}

#[test]
fn second_run_appends_without_repeating_header() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("BTC_USDT-1h.csv");

    for _ in 0..2 {
        let ex = Arc::new(MemoryExchange::new().with_generated_series("BTC/USDT", Timeframe::H1, SEP_1_2020_MS, 24));
        KlineDownloader::new(ex)
            .with_options(options())
            .run(&request(&["BTC/USDT"], dir.path(), "1h"), &NoProgress)
            .unwrap();
    }

    let lines = read_lines(&path);
    assert_eq!(lines.len(), 1 + 48);
    assert_eq!(lines.iter().filter(|l| l.starts_with("timestamp,")).count(), 1);
}

#[test]
fn creates_missing_output_directory() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("data").join("klines");
    let ex = Arc::new(MemoryExchange::new().with_generated_series("BTC/USDT", Timeframe::H1, SEP_1_2020_MS, 3));

    KlineDownloader::new(ex)
        .with_options(options())
        .run(&request(&["BTC/USDT"], &nested, "1h"), &NoProgress)
        .unwrap();

    assert_eq!(read_lines(&nested.join("BTC_USDT-1h.csv")).len(), 4);
}

#[test]
fn cancelled_run_fetches_nothing_and_closes() {
    let dir = tempfile::tempdir().unwrap();
    let ex = Arc::new(
        MemoryExchange::new()
            .with_generated_series("BTC/USDT", Timeframe::H1, SEP_1_2020_MS, 24)
            .with_generated_series("ETH/USDT", Timeframe::H1, SEP_1_2020_MS, 24),
    );
    let downloader = KlineDownloader::new(ex.clone()).with_options(options());
    downloader.cancel();

    let summary = downloader
        .run(&request(&["BTC/USDT", "ETH/USDT"], dir.path(), "1h"), &NoProgress)
        .unwrap();

    assert_eq!(summary.failed, 2);
    assert!(summary
        .failures()
        .all(|f| matches!(f.error, DownloaderError::Cancelled { .. })));
    assert_eq!(ex.fetch_count(), 0);
    assert_eq!(ex.close_count(), 1);
}

#[test]
fn panicking_task_still_closes_client() {
    struct Boom;
    impl DownloadProgress for Boom {
        fn on_batch(&self, _symbol: &str, _batch: &[Kline]) {
            panic!("progress sink exploded");
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let ex = Arc::new(MemoryExchange::new().with_generated_series("BTC/USDT", Timeframe::H1, SEP_1_2020_MS, 24));
    let downloader = KlineDownloader::new(ex.clone()).with_options(options());
    let req = request(&["BTC/USDT"], dir.path(), "1h");

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| downloader.run(&req, &Boom)));
    assert!(result.is_err());
    assert_eq!(ex.close_count(), 1);
}

#[test]
fn progress_sees_every_transition() {
    let dir = tempfile::tempdir().unwrap();
    let ex = Arc::new(
        MemoryExchange::new()
            .with_generated_series("BTC/USDT", Timeframe::H1, SEP_1_2020_MS, 24)
            .with_script(
                "FOO/BAR",
                vec![Err(ExchangeError::UnknownSymbol {
                    symbol: "FOOBAR".into(),
                    reason: "Invalid symbol.".into(),
                })],
            ),
    );
    let recorder = Recorder::default();
    let opts = DownloadOptions {
        limit: 10,
        ..options()
    };

    KlineDownloader::new(ex)
        .with_options(opts)
        .run(&request(&["BTC/USDT", "FOO/BAR"], dir.path(), "1h"), &recorder)
        .unwrap();

    assert_eq!(
        recorder.states_for("BTC/USDT"),
        vec![SymbolState::Pending, SymbolState::Fetching, SymbolState::Completed]
    );
    assert_eq!(
        recorder.states_for("FOO/BAR"),
        vec![SymbolState::Pending, SymbolState::Fetching, SymbolState::Failed]
    );
    let sizes: Vec<usize> = recorder
        .batches
        .lock()
        .unwrap()
        .iter()
        .filter(|(s, _)| s == "BTC/USDT")
        .map(|(_, n)| *n)
        .collect();
    assert_eq!(sizes, vec![10, 10, 4]);
    assert_eq!(recorder.completed.lock().unwrap().len(), 2);
    assert_eq!(*recorder.runs.lock().unwrap(), 1);
}

#[test]
fn batches_can_be_dropped_after_writing() {
    let dir = tempfile::tempdir().unwrap();
    let ex = Arc::new(MemoryExchange::new().with_generated_series("BTC/USDT", Timeframe::M30, SEP_1_2020_MS, 48));
    let opts = DownloadOptions {
        limit: 7,
        retain_batches: false,
        max_concurrency: Some(1),
        ..options()
    };

    let summary = KlineDownloader::new(ex)
        .with_options(opts)
        .run(&request(&["BTC/USDT"], dir.path(), "30m"), &NoProgress)
        .unwrap();

    let download = summary.get("BTC/USDT").unwrap().as_ref().unwrap();
    assert!(download.batches.is_empty());
    assert_eq!(download.batch_count, 7);
    assert_eq!(download.kline_count, 48);
    assert_eq!(read_lines(&download.path).len(), 49);
}
