//! Exchange adapter trait and structured error types.
//!
//! The `Exchange` trait abstracts over the kline source (Binance REST, the
//! in-memory exchange used by tests and benches) so the pagination engine
//! never sees HTTP details.

pub mod binance;
pub mod circuit_breaker;
pub mod memory;
pub mod throttle;

pub use binance::{BinanceClient, BinanceConfig, Credentials};
pub use circuit_breaker::CircuitBreaker;
pub use memory::MemoryExchange;
pub use throttle::RequestThrottle;

use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;

use crate::domain::Batch;
use crate::retry::RetryAdvice;
use crate::timeframe::Timeframe;

/// Classified failure of a single adapter call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("unknown symbol {symbol}: {reason}")]
    UnknownSymbol { symbol: String, reason: String },

    #[error("network unreachable: {0}")]
    Network(String),

    #[error("rate limited by exchange (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("requests blocked by exchange: {0}")]
    Banned(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("response format changed: {0}")]
    ResponseFormat(String),

    #[error("hard stop: exchange has blocked requests (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("exchange client is closed")]
    Closed,

    #[error("exchange error: {0}")]
    Other(String),
}

impl ExchangeError {
    /// True for failures worth retrying: connectivity, rate limits, 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            ExchangeError::Network(_) | ExchangeError::RateLimited { .. } => true,
            ExchangeError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Retry advice for this failure. A rate limit waits out its `Retry-After`.
    pub fn retry_advice(&self) -> RetryAdvice {
        match self {
            ExchangeError::RateLimited { retry_after_secs } => {
                RetryAdvice::After(Duration::from_secs(*retry_after_secs))
            }
            e if e.is_transient() => RetryAdvice::Backoff,
            _ => RetryAdvice::Stop,
        }
    }
}

/// Parameters of one paginated klines call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OhlcvQuery {
    /// Unified symbol, e.g. `BTC/USDT`.
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Inclusive lower bound, epoch milliseconds.
    pub since_ms: i64,
    /// Maximum rows to return.
    pub limit: u32,
    /// Upper bound hint sent to the exchange. Not relied upon.
    pub end_time_ms: Option<i64>,
}

/// A kline source.
///
/// Implementations must be safe for concurrent calls from several symbol
/// tasks sharing one handle.
pub trait Exchange: Send + Sync {
    /// Human-readable name of this exchange.
    fn name(&self) -> &str;

    /// Unified symbols currently listed.
    fn list_markets(&self) -> Result<BTreeSet<String>, ExchangeError>;

    /// One page of klines starting at `query.since_ms`, oldest first.
    fn fetch_ohlcv(&self, query: &OhlcvQuery) -> Result<Batch, ExchangeError>;

    /// Release network resources. Safe to call more than once.
    fn close(&self) -> Result<(), ExchangeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ExchangeError::Network("timeout".into()).is_transient());
        assert!(ExchangeError::RateLimited {
            retry_after_secs: 1
        }
        .is_transient());
        assert!(ExchangeError::Http {
            status: 502,
            message: "bad gateway".into()
        }
        .is_transient());

        assert!(!ExchangeError::Http {
            status: 400,
            message: "bad request".into()
        }
        .is_transient());
        assert!(!ExchangeError::UnknownSymbol {
            symbol: "X".into(),
            reason: "Invalid symbol.".into()
        }
        .is_transient());
        assert!(!ExchangeError::Banned("418".into()).is_transient());
        assert!(!ExchangeError::CircuitBreakerTripped.is_transient());
        assert!(!ExchangeError::Closed.is_transient());
    }

    #[test]
    fn rate_limit_advice_carries_retry_after() {
        assert_eq!(
            ExchangeError::RateLimited { retry_after_secs: 7 }.retry_advice(),
            RetryAdvice::After(Duration::from_secs(7))
        );
        assert_eq!(
            ExchangeError::Network("reset".into()).retry_advice(),
            RetryAdvice::Backoff
        );
        assert_eq!(ExchangeError::CircuitBreakerTripped.retry_advice(), RetryAdvice::Stop);
    }
}
