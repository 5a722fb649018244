//! In-memory exchange for tests, benchmarks and offline runs.
//!
//! Serves klines from per-symbol series the way the REST endpoint does
//! (rows at or after `since`, capped at `limit`), or replays scripted pages
//! verbatim. Every call is recorded so callers can assert on cursors and on
//! how often the client was closed.

use super::{Exchange, ExchangeError, OhlcvQuery};
use crate::domain::{Batch, Kline};
use crate::timeframe::Timeframe;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub struct MemoryExchange {
    markets: BTreeSet<String>,
    series: HashMap<String, Vec<Kline>>,
    scripts: Mutex<HashMap<String, VecDeque<Result<Batch, ExchangeError>>>>,
    market_error: Option<ExchangeError>,
    ignore_end_time: bool,
    calls: Mutex<Vec<OhlcvQuery>>,
    market_calls: AtomicUsize,
    close_calls: AtomicUsize,
    closed: AtomicBool,
}

impl MemoryExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// List a symbol without any klines.
    pub fn with_market(mut self, symbol: &str) -> Self {
        self.markets.insert(symbol.to_string());
        self
    }

    /// List a symbol and serve the given klines (sorted by timestamp).
    pub fn with_series(mut self, symbol: &str, mut klines: Vec<Kline>) -> Self {
        klines.sort_by_key(|k| k.timestamp);
        self.markets.insert(symbol.to_string());
        self.series.insert(symbol.to_string(), klines);
        self
    }

    /// List a symbol with `count` contiguous synthetic candles from `start_ms`.
    pub fn with_generated_series(
        self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        count: usize,
    ) -> Self {
        let step = timeframe.duration_ms();
        let klines = (0..count)
            .map(|i| {
                let close = 100.0 + (i as f64 * 0.1).sin() * 10.0;
                Kline::new(
                    start_ms + i as i64 * step,
                    close - 0.3,
                    close + 1.5,
                    close - 1.5,
                    close,
                    1_000.0 + (i % 500) as f64,
                )
            })
            .collect();
        self.with_series(symbol, klines)
    }

    /// List a symbol and answer its fetches with these pages, in order.
    /// Once the script runs out, every further fetch returns an empty page.
    pub fn with_script(mut self, symbol: &str, pages: Vec<Result<Batch, ExchangeError>>) -> Self {
        self.markets.insert(symbol.to_string());
        self.scripts
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(symbol.to_string(), pages.into());
        self
    }

    /// Make `list_markets` fail.
    pub fn with_market_error(mut self, err: ExchangeError) -> Self {
        self.market_error = Some(err);
        self
    }

    /// Serve rows past `end_time_ms`, like an endpoint that ignores the hint.
    pub fn ignoring_end_time(mut self) -> Self {
        self.ignore_end_time = true;
        self
    }

    /// Every fetch recorded so far, in call order.
    pub fn calls(&self) -> Vec<OhlcvQuery> {
        lock(&self.calls).clone()
    }

    /// Fetches issued for one symbol, in call order.
    pub fn calls_for(&self, symbol: &str) -> Vec<OhlcvQuery> {
        lock(&self.calls)
            .iter()
            .filter(|q| q.symbol == symbol)
            .cloned()
            .collect()
    }

    pub fn fetch_count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn market_list_count(&self) -> usize {
        self.market_calls.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Exchange for MemoryExchange {
    fn name(&self) -> &str {
        "memory"
    }

    fn list_markets(&self) -> Result<BTreeSet<String>, ExchangeError> {
        self.market_calls.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() {
            return Err(ExchangeError::Closed);
        }
        match &self.market_error {
            Some(err) => Err(err.clone()),
            None => Ok(self.markets.clone()),
        }
    }

    fn fetch_ohlcv(&self, query: &OhlcvQuery) -> Result<Batch, ExchangeError> {
        if self.is_closed() {
            return Err(ExchangeError::Closed);
        }
        lock(&self.calls).push(query.clone());

        if let Some(pages) = lock(&self.scripts).get_mut(&query.symbol) {
            return pages.pop_front().unwrap_or_else(|| Ok(Vec::new()));
        }

        if let Some(series) = self.series.get(&query.symbol) {
            let end = match (self.ignore_end_time, query.end_time_ms) {
                (false, Some(end)) => end,
                _ => i64::MAX,
            };
            let start = series.partition_point(|k| k.timestamp < query.since_ms);
            return Ok(series[start..]
                .iter()
                .take_while(|k| k.timestamp <= end)
                .take(query.limit as usize)
                .copied()
                .collect());
        }

        if self.markets.contains(&query.symbol) {
            Ok(Vec::new())
        } else {
            Err(ExchangeError::UnknownSymbol {
                symbol: query.symbol.clone(),
                reason: "Invalid symbol.".into(),
            })
        }
    }

    fn close(&self) -> Result<(), ExchangeError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
