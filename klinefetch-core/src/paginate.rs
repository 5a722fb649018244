//! Kline pagination engine.
//!
//! Turns a (symbol, timeframe, start, end) request into a lazy sequence of
//! batches by repeatedly asking the exchange for at most `limit` rows from a
//! cursor, then moving the cursor one millisecond past the last row received.
//! Nothing is fetched until the sequence is pulled.

use std::iter::FusedIterator;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::domain::{Batch, FetchRequest};
use crate::error::DownloaderError;
use crate::exchange::{Exchange, ExchangeError, OhlcvQuery};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::time::InstantInput;
use crate::timeframe::Timeframe;

/// Builds paginated kline sequences against one shared exchange.
#[derive(Clone)]
pub struct KlinePaginator {
    exchange: Arc<dyn Exchange>,
    limit: u32,
    retry: RetryPolicy,
    cancel: Option<Arc<AtomicBool>>,
}

impl KlinePaginator {
    /// Rows requested per call when not configured otherwise.
    pub const DEFAULT_LIMIT: u32 = 500;

    pub fn new(exchange: Arc<dyn Exchange>) -> Self {
        Self {
            exchange,
            limit: Self::DEFAULT_LIMIT,
            retry: RetryPolicy::default(),
            cancel: None,
        }
    }

    /// Rows per call. Zero is treated as one.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Stop before the next exchange call once `flag` is set.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn exchange(&self) -> &Arc<dyn Exchange> {
        &self.exchange
    }

    /// Validate the request and return its batch sequence.
    ///
    /// An unsupported `timeframe` fails here, before any exchange call.
    /// Instants without a timezone are taken as UTC.
    pub fn paginate(
        &self,
        symbol: &str,
        timeframe: &str,
        start: impl Into<InstantInput>,
        end: impl Into<InstantInput>,
    ) -> Result<KlinePages, DownloaderError> {
        let timeframe = timeframe.parse::<Timeframe>()?;
        let request = FetchRequest::with_timeframe(
            symbol,
            timeframe,
            start.into().to_utc(),
            end.into().to_utc(),
        );
        Ok(self.paginate_request(&request))
    }

    /// Batch sequence for an already validated request.
    pub fn paginate_request(&self, request: &FetchRequest) -> KlinePages {
        KlinePages {
            exchange: Arc::clone(&self.exchange),
            symbol: request.symbol().to_string(),
            timeframe: request.timeframe(),
            since: request.start_ms(),
            end_ms: request.end_ms(),
            limit: self.limit,
            retry: self.retry.clone(),
            cancel: self.cancel.clone(),
            calls: 0,
            done: false,
        }
    }
}

/// Lazy sequence of batches for one symbol.
///
/// Yielded batches are sorted, free of duplicate timestamps and confined to
/// `[start, end)`. Across batches, timestamps are strictly increasing. The
/// sequence ends on the first empty page, once the cursor reaches `end`, or
/// right after yielding an error.
pub struct KlinePages {
    exchange: Arc<dyn Exchange>,
    symbol: String,
    timeframe: Timeframe,
    since: i64,
    end_ms: i64,
    limit: u32,
    retry: RetryPolicy,
    cancel: Option<Arc<AtomicBool>>,
    calls: usize,
    done: bool,
}

impl KlinePages {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Timestamp the next call will start from.
    pub fn cursor(&self) -> i64 {
        self.since
    }

    pub fn end_ms(&self) -> i64 {
        self.end_ms
    }

    /// Exchange calls made so far, not counting retries.
    pub fn calls(&self) -> usize {
        self.calls
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn fetch_page(&self) -> Result<Batch, ExchangeError> {
        let query = OhlcvQuery {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            since_ms: self.since,
            limit: self.limit,
            end_time_ms: Some(self.end_ms),
        };
        retry_with_backoff(&self.retry, ExchangeError::retry_advice, || {
            self.exchange.fetch_ohlcv(&query)
        })
    }

    fn fail(&mut self, err: DownloaderError) -> Option<Result<Batch, DownloaderError>> {
        self.done = true;
        Some(Err(err))
    }
}

impl Iterator for KlinePages {
    type Item = Result<Batch, DownloaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done || self.since >= self.end_ms {
                self.done = true;
                return None;
            }
            if self.is_cancelled() {
                return self.fail(DownloaderError::Cancelled {
                    symbol: self.symbol.clone(),
                });
            }

            let mut batch = match self.fetch_page() {
                Ok(batch) => batch,
                Err(err) => {
                    let err = DownloaderError::from_exchange(&self.symbol, err);
                    return self.fail(err);
                }
            };
            self.calls += 1;

            if batch.is_empty() {
                debug!(symbol = %self.symbol, since = self.since, "empty page, data exhausted");
                self.done = true;
                return None;
            }

            batch.sort_by_key(|k| k.timestamp);
            let last_raw = batch[batch.len() - 1].timestamp;
            if last_raw < self.since {
                return self.fail(DownloaderError::CursorStalled {
                    symbol: self.symbol.clone(),
                    since: self.since,
                    last_timestamp: last_raw,
                });
            }

            let raw_len = batch.len();
            let (since, end_ms) = (self.since, self.end_ms);
            batch.retain(|k| k.timestamp >= since && k.timestamp < end_ms);
            batch.dedup_by_key(|k| k.timestamp);
            if batch.len() != raw_len {
                warn!(
                    symbol = %self.symbol,
                    dropped = raw_len - batch.len(),
                    "discarded duplicate or out-of-range rows"
                );
            }

            // A row at i64::MAX leaves nothing after it to fetch.
            match last_raw.checked_add(1) {
                Some(next) => self.since = next,
                None => self.done = true,
            }
            debug!(
                symbol = %self.symbol,
                rows = batch.len(),
                next_since = self.since,
                "fetched page"
            );

            if !batch.is_empty() {
                return Some(Ok(batch));
            }
            if self.done {
                return None;
            }
        }
    }
}

impl FusedIterator for KlinePages {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Kline;
    use crate::exchange::MemoryExchange;
    use chrono::{TimeZone, Utc};

    fn k(ts: i64) -> Kline {
        Kline::new(ts, 1.0, 2.0, 0.5, 1.5, 10.0)
    }

    fn no_retry(ex: Arc<MemoryExchange>) -> KlinePaginator {
        KlinePaginator::new(ex).with_retry(RetryPolicy::disabled())
    }

    #[test]
    fn nothing_is_fetched_until_pulled() {
        let ex = Arc::new(MemoryExchange::new().with_generated_series("A/B", Timeframe::M1, 0, 5));
        let pages = no_retry(ex.clone())
            .paginate("A/B", "1m", Utc.timestamp_opt(0, 0).unwrap(), Utc.timestamp_opt(600, 0).unwrap())
            .unwrap();
        assert_eq!(ex.fetch_count(), 0);
        drop(pages);
        assert_eq!(ex.fetch_count(), 0);
    }

    #[test]
    fn empty_range_makes_no_calls() {
        let ex = Arc::new(MemoryExchange::new().with_generated_series("A/B", Timeframe::M1, 0, 5));
        let t = Utc.timestamp_opt(60, 0).unwrap();
        let batches: Vec<_> = no_retry(ex.clone()).paginate("A/B", "1m", t, t).unwrap().collect();
        assert!(batches.is_empty());
        assert_eq!(ex.fetch_count(), 0);
    }

    #[test]
    fn unsorted_and_duplicate_rows_are_normalized() {
        let ex = Arc::new(
            MemoryExchange::new().with_script("A/B", vec![Ok(vec![k(3_000), k(1_000), k(2_000), k(2_000)])]),
        );
        let mut pages = no_retry(ex)
            .paginate("A/B", "1m", Utc.timestamp_opt(0, 0).unwrap(), Utc.timestamp_opt(60, 0).unwrap())
            .unwrap();
        let batch = pages.next().unwrap().unwrap();
        let ts: Vec<i64> = batch.iter().map(|k| k.timestamp).collect();
        assert_eq!(ts, vec![1_000, 2_000, 3_000]);
        assert_eq!(pages.cursor(), 3_001);
    }

    #[test]
    fn stalled_cursor_is_an_error() {
        let ex = Arc::new(MemoryExchange::new().with_script(
            "A/B",
            vec![Ok(vec![k(5_000)]), Ok(vec![k(4_000)])],
        ));
        let results: Vec<_> = no_retry(ex)
            .paginate("A/B", "1m", Utc.timestamp_opt(0, 0).unwrap(), Utc.timestamp_opt(60, 0).unwrap())
            .unwrap()
            .collect();
        assert_eq!(results.len(), 2);
        assert!(matches!(
            results[1],
            Err(DownloaderError::CursorStalled { since: 5_001, last_timestamp: 4_000, .. })
        ));
    }

    #[test]
    fn cancel_flag_stops_before_next_call() {
        let ex = Arc::new(MemoryExchange::new().with_generated_series("A/B", Timeframe::M1, 0, 10));
        let flag = Arc::new(AtomicBool::new(false));
        let mut pages = no_retry(ex.clone())
            .with_limit(2)
            .with_cancel_flag(flag.clone())
            .paginate("A/B", "1m", Utc.timestamp_opt(0, 0).unwrap(), Utc.timestamp_opt(600, 0).unwrap())
            .unwrap();
        assert!(pages.next().unwrap().is_ok());
        flag.store(true, Ordering::Relaxed);
        assert!(matches!(pages.next(), Some(Err(DownloaderError::Cancelled { .. }))));
        assert!(pages.next().is_none());
        assert_eq!(ex.fetch_count(), 1);
    }

    #[test]
    fn row_at_max_timestamp_ends_the_walk() {
        let ex = Arc::new(MemoryExchange::new().with_script(
            "A/B",
            vec![Ok(vec![k(1_000), k(i64::MAX)]), Ok(vec![k(2_000)])],
        ));
        let request = FetchRequest::with_timeframe(
            "A/B",
            Timeframe::M1,
            Utc.timestamp_opt(0, 0).unwrap(),
            Utc.timestamp_opt(60, 0).unwrap(),
        );
        let mut pages = no_retry(ex.clone()).paginate_request(&request);
        let batch = pages.next().unwrap().unwrap();
        assert_eq!(batch.iter().map(|k| k.timestamp).collect::<Vec<_>>(), vec![1_000]);
        assert!(pages.next().is_none());
        assert_eq!(ex.fetch_count(), 1);
    }

    #[test]
    fn zero_limit_is_clamped() {
        let ex = Arc::new(MemoryExchange::new());
        assert_eq!(KlinePaginator::new(ex).with_limit(0).limit(), 1);
    }
}
