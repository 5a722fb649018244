//! Binance spot REST adapter.
//!
//! Fetches the market list from `/api/v3/exchangeInfo` and kline pages from
//! `/api/v3/klines`. Handles request spacing, error classification and the
//! shared circuit breaker. Retries are the pagination engine's job, not this
//! client's: a failed request is reported once, classified, and the breaker
//! only opens for bans and rate-limit streaks.

use super::circuit_breaker::CircuitBreaker;
use super::throttle::RequestThrottle;
use super::{Exchange, ExchangeError, OhlcvQuery};
use crate::domain::{Batch, Kline};
use serde::de::{self, IgnoredAny, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.binance.com";

/// Binance error code for an unknown trading pair.
const INVALID_SYMBOL_CODE: i64 = -1121;

/// Optional API key. The klines and exchange-info endpoints are public, so
/// none is needed; a key raises the account's rate limits. No signed endpoint
/// is called, so no secret is kept.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: Option<String>,
}

impl Credentials {
    /// Read `BINANCE_API_KEY`, ignoring an empty value.
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("BINANCE_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.api_key.is_none()
    }
}

// Never print the key.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Construction parameters for [`BinanceClient`].
#[derive(Debug, Clone)]
pub struct BinanceConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub min_request_interval: Duration,
    pub breaker_cooldown: Duration,
    pub credentials: Credentials,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            min_request_interval: Duration::from_millis(50),
            breaker_cooldown: Duration::from_secs(30 * 60),
            credentials: Credentials::default(),
        }
    }
}

/// `/api/v3/exchangeInfo` response (only the fields we use).
#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    base_asset: String,
    quote_asset: String,
}

/// Binance REST error payload, e.g. `{"code":-1121,"msg":"Invalid symbol."}`.
#[derive(Debug, Deserialize)]
struct BinanceApiError {
    code: i64,
    msg: String,
}

/// One kline row as returned by `/api/v3/klines`.
///
/// Binance returns positional arrays of mixed types:
/// `[open_time, open, high, low, close, volume, close_time, ...]`, with prices
/// as strings. Only the first six elements are kept.
#[derive(Debug, Clone, PartialEq)]
struct BinanceKlineRaw {
    open_time: i64,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: String,
}

impl<'de> Deserialize<'de> for BinanceKlineRaw {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct RawVisitor;

        impl<'de> Visitor<'de> for RawVisitor {
            type Value = BinanceKlineRaw;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a Binance kline array with at least 6 elements")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                fn next<'de, A, T>(seq: &mut A, idx: usize, field: &'static str) -> Result<T, A::Error>
                where
                    A: SeqAccess<'de>,
                    T: Deserialize<'de>,
                {
                    seq.next_element()?
                        .ok_or_else(|| de::Error::invalid_length(idx, &field))
                }

                let raw = BinanceKlineRaw {
                    open_time: next(&mut seq, 0, "open_time")?,
                    open: next(&mut seq, 1, "open")?,
                    high: next(&mut seq, 2, "high")?,
                    low: next(&mut seq, 3, "low")?,
                    close: next(&mut seq, 4, "close")?,
                    volume: next(&mut seq, 5, "volume")?,
                };
                // close_time, quote volume, trade count, taker volumes, unused
                while seq.next_element::<IgnoredAny>()?.is_some() {}
                Ok(raw)
            }
        }

        deserializer.deserialize_seq(RawVisitor)
    }
}

impl TryFrom<BinanceKlineRaw> for Kline {
    type Error = ExchangeError;

    fn try_from(raw: BinanceKlineRaw) -> Result<Self, Self::Error> {
        let parse = |field: &str, value: &str| {
            value.parse::<f64>().map_err(|e| {
                ExchangeError::ResponseFormat(format!("failed to parse {field} '{value}': {e}"))
            })
        };
        Ok(Kline {
            timestamp: raw.open_time,
            open: parse("open", &raw.open)?,
            high: parse("high", &raw.high)?,
            low: parse("low", &raw.low)?,
            close: parse("close", &raw.close)?,
            volume: parse("volume", &raw.volume)?,
        })
    }
}

/// Decode a klines response body.
fn parse_klines(body: &str) -> Result<Batch, ExchangeError> {
    let raw: Vec<BinanceKlineRaw> = serde_json::from_str(body)
        .map_err(|e| ExchangeError::ResponseFormat(format!("failed to parse klines: {e}")))?;
    raw.into_iter().map(Kline::try_from).collect()
}

/// Decode an exchange-info body into a unified-symbol → exchange-id map.
fn parse_markets(body: &str) -> Result<HashMap<String, String>, ExchangeError> {
    let info: ExchangeInfo = serde_json::from_str(body).map_err(|e| {
        ExchangeError::ResponseFormat(format!("failed to parse exchange info: {e}"))
    })?;
    Ok(info
        .symbols
        .into_iter()
        .map(|s| (format!("{}/{}", s.base_asset, s.quote_asset), s.symbol))
        .collect())
}

/// Map a non-success HTTP response to an [`ExchangeError`].
fn classify_failure(status: u16, retry_after: Option<u64>, body: &str, symbol: &str) -> ExchangeError {
    let api_error = serde_json::from_str::<BinanceApiError>(body).ok();

    if let Some(err) = &api_error {
        if err.code == INVALID_SYMBOL_CODE {
            return ExchangeError::UnknownSymbol {
                symbol: symbol.to_string(),
                reason: err.msg.clone(),
            };
        }
    }

    let message = api_error
        .map(|e| format!("code {}: {}", e.code, e.msg))
        .unwrap_or_else(|| body.chars().take(200).collect());

    match status {
        418 => ExchangeError::Banned(format!("IP auto-banned (HTTP 418): {message}")),
        403 => ExchangeError::Banned(format!("WAF limit violated (HTTP 403): {message}")),
        429 => ExchangeError::RateLimited {
            retry_after_secs: retry_after.unwrap_or(60),
        },
        _ => ExchangeError::Http { status, message },
    }
}

/// Binance spot REST client.
///
/// One instance is shared by every symbol task. Request spacing and the
/// circuit breaker are therefore global to the run.
pub struct BinanceClient {
    client: reqwest::blocking::Client,
    base_url: String,
    credentials: Credentials,
    circuit_breaker: Arc<CircuitBreaker>,
    throttle: RequestThrottle,
    /// Unified symbol → exchange id, filled by the first market listing.
    markets: RwLock<Option<HashMap<String, String>>>,
    closed: AtomicBool,
}

impl fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinanceClient")
            .field("base_url", &self.base_url)
            .field("credentials", &self.credentials)
            .field("throttle", &self.throttle)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl BinanceClient {
    pub fn new(config: BinanceConfig) -> Result<Self, ExchangeError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("klinefetch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ExchangeError::Other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials: config.credentials,
            circuit_breaker: Arc::new(CircuitBreaker::new(config.breaker_cooldown)),
            throttle: RequestThrottle::new(config.min_request_interval),
            markets: RwLock::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    /// Exchange id for a unified symbol.
    ///
    /// Once markets are loaded an unlisted symbol is rejected without a
    /// request; before that the slash is simply dropped (`BTC/USDT` → `BTCUSDT`).
    fn market_id(&self, symbol: &str) -> Result<String, ExchangeError> {
        let markets = self.markets.read().unwrap_or_else(PoisonError::into_inner);
        match markets.as_ref() {
            Some(map) => map
                .get(symbol)
                .cloned()
                .ok_or_else(|| ExchangeError::UnknownSymbol {
                    symbol: symbol.to_string(),
                    reason: "symbol is not listed on Binance".into(),
                }),
            None => Ok(symbol.replace('/', "")),
        }
    }

    /// Send a GET with spacing, breaker checks and error classification.
    /// Returns the response body of a successful request.
    fn get(&self, path: &str, query: &[(&str, String)], symbol: &str) -> Result<String, ExchangeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ExchangeError::Closed);
        }
        self.circuit_breaker.check()?;

        self.throttle.wait();

        let mut request = self.client.get(format!("{}{path}", self.base_url)).query(query);
        if let Some(key) = &self.credentials.api_key {
            request = request.header("X-MBX-APIKEY", key);
        }

        let response = request
            .send()
            .map_err(|e| ExchangeError::Network(e.to_string()))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = response
            .text()
            .map_err(|e| ExchangeError::Network(format!("failed to read response body: {e}")))?;

        if status.is_success() {
            self.circuit_breaker.record_success();
            return Ok(body);
        }

        let err = classify_failure(status.as_u16(), retry_after, &body, symbol);
        match &err {
            ExchangeError::Banned(_) => {
                warn!(%status, ?retry_after, "exchange blocked requests, holding all symbols");
                self.circuit_breaker
                    .record_ban(retry_after.map(Duration::from_secs));
            }
            ExchangeError::RateLimited { retry_after_secs } => {
                let wait = Duration::from_secs(*retry_after_secs);
                if self.circuit_breaker.record_rate_limit(wait) {
                    warn!(retry_after_secs, "repeated rate limiting, pausing all symbols");
                }
            }
            _ => {}
        }
        Err(err)
    }
}

impl Exchange for BinanceClient {
    fn name(&self) -> &str {
        "binance"
    }

    fn list_markets(&self) -> Result<BTreeSet<String>, ExchangeError> {
        info!("loading markets from Binance");
        let body = self.get("/api/v3/exchangeInfo", &[], "")?;
        let map = parse_markets(&body)?;
        let symbols: BTreeSet<String> = map.keys().cloned().collect();
        *self.markets.write().unwrap_or_else(PoisonError::into_inner) = Some(map);
        info!(count = symbols.len(), "markets loaded");
        Ok(symbols)
    }

    fn fetch_ohlcv(&self, query: &OhlcvQuery) -> Result<Batch, ExchangeError> {
        let market_id = self.market_id(&query.symbol)?;
        let mut params = vec![
            ("symbol", market_id),
            ("interval", query.timeframe.as_str().to_string()),
            ("startTime", query.since_ms.to_string()),
            ("limit", query.limit.to_string()),
        ];
        if let Some(end) = query.end_time_ms {
            params.push(("endTime", end.to_string()));
        }

        let body = self.get("/api/v3/klines", &params, &query.symbol)?;
        let batch = parse_klines(&body)?;
        debug!(symbol = %query.symbol, since = query.since_ms, rows = batch.len(), "klines page");
        Ok(batch)
    }

    fn close(&self) -> Result<(), ExchangeError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("binance client closed");
        }
        Ok(())
    }
}
