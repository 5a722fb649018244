//! klinefetch core: kline types, exchange adapters, the pagination engine and CSV output.
//!
//! This crate contains everything needed to pull one symbol's history:
//! - Domain types (klines, batches, fetch requests, timeframes)
//! - The `Exchange` trait with a Binance REST client and an in-memory exchange
//! - Rate limiting, circuit breaking and retry with backoff
//! - A lazy pagination engine that walks a time range page by page
//! - An append-only CSV sink per symbol
//!
//! Fan-out across symbols lives in `klinefetch-runner`.

pub mod domain;
pub mod error;
pub mod exchange;
pub mod paginate;
pub mod retry;
pub mod sink;
pub mod time;
pub mod timeframe;

pub use domain::{Batch, FetchRequest, Kline};
pub use error::DownloaderError;
pub use exchange::{Exchange, ExchangeError, MemoryExchange, OhlcvQuery};
pub use paginate::{KlinePages, KlinePaginator};
pub use retry::{RetryAdvice, RetryPolicy};
pub use sink::{CsvKlineSink, SinkError};
pub use time::{InstantInput, TimestampStyle};
pub use timeframe::Timeframe;

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: everything shared across symbol tasks is Send + Sync.
    ///
    /// The runner hands one exchange to a thread pool and moves pages and
    /// sinks into worker closures. If any type fails this check, the build
    /// breaks immediately.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        // Domain types
        require_send::<Kline>();
        require_sync::<Kline>();
        require_send::<FetchRequest>();
        require_sync::<FetchRequest>();
        require_send::<Timeframe>();
        require_sync::<Timeframe>();

        // Exchanges
        require_send::<exchange::BinanceClient>();
        require_sync::<exchange::BinanceClient>();
        require_send::<MemoryExchange>();
        require_sync::<MemoryExchange>();
        require_send::<exchange::CircuitBreaker>();
        require_sync::<exchange::CircuitBreaker>();
        require_send::<exchange::RequestThrottle>();
        require_sync::<exchange::RequestThrottle>();

        // Engine and output
        require_send::<KlinePaginator>();
        require_sync::<KlinePaginator>();
        require_send::<KlinePages>();
        require_send::<CsvKlineSink>();

        // Errors cross thread boundaries inside reports
        require_send::<DownloaderError>();
        require_sync::<DownloaderError>();
    }

    /// The engine only ever sees the trait object, never a concrete client.
    #[test]
    fn exchange_trait_is_object_safe() {
        fn _takes_dyn(_: &dyn Exchange) {}
        let ex = MemoryExchange::new();
        _takes_dyn(&ex);
    }
}
