//! Domain-level download errors.

use thiserror::Error;

use crate::exchange::ExchangeError;
use crate::sink::SinkError;
use crate::time::TimeError;

/// Failure of a single symbol's download.
///
/// Everything here is scoped to one fetch request. The orchestrator records
/// it against that symbol and lets sibling symbols carry on.
#[derive(Debug, Error)]
pub enum DownloaderError {
    #[error("invalid timeframe: {timeframe}. Available timeframes: {}", crate::timeframe::Timeframe::available())]
    InvalidTimeframe { timeframe: String },

    #[error("unknown symbol {symbol}: {reason}")]
    UnknownSymbol { symbol: String, reason: String },

    #[error("exchange request failed for {symbol}: {source}")]
    Exchange {
        symbol: String,
        #[source]
        source: ExchangeError,
    },

    #[error(
        "pagination stalled for {symbol}: batch ending at {last_timestamp} does not advance cursor {since}"
    )]
    CursorStalled {
        symbol: String,
        since: i64,
        last_timestamp: i64,
    },

    #[error("download of {symbol} cancelled")]
    Cancelled { symbol: String },

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Time(#[from] TimeError),
}

impl DownloaderError {
    /// Classify an adapter failure for `symbol`.
    pub fn from_exchange(symbol: &str, err: ExchangeError) -> Self {
        match err {
            ExchangeError::UnknownSymbol { reason, .. } => DownloaderError::UnknownSymbol {
                symbol: symbol.to_string(),
                reason,
            },
            source => DownloaderError::Exchange {
                symbol: symbol.to_string(),
                source,
            },
        }
    }

    /// True if retrying the same request later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            DownloaderError::Exchange { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}
