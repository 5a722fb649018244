//! Kline domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DownloaderError;
use crate::time::to_epoch_millis;
use crate::timeframe::Timeframe;

/// One OHLCV candlestick.
///
/// `timestamp` is the bucket open time in milliseconds since the Unix epoch (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Kline {
    pub fn new(timestamp: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

/// One page of klines returned by a single exchange call, in time order.
pub type Batch = Vec<Kline>;

/// A validated (symbol, timeframe, start, end) download request.
///
/// Built once per symbol and never mutated. Construction is the only place
/// the timeframe string is checked, so an invalid value never reaches the
/// network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    symbol: String,
    timeframe: Timeframe,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl FetchRequest {
    pub fn new(
        symbol: impl Into<String>,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Self, DownloaderError> {
        let timeframe = timeframe.parse::<Timeframe>()?;
        Ok(Self::with_timeframe(symbol, timeframe, start, end))
    }

    pub fn with_timeframe(
        symbol: impl Into<String>,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            start,
            end,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Start of the range as epoch milliseconds (whole seconds).
    pub fn start_ms(&self) -> i64 {
        to_epoch_millis(self.start)
    }

    /// End of the range as epoch milliseconds (whole seconds, exclusive).
    pub fn end_ms(&self) -> i64 {
        to_epoch_millis(self.end)
    }
}
