//! Run-wide hold on Binance requests after a ban or a rate-limit streak.
//!
//! Binance limits request weight per IP, so every symbol task shares one
//! breaker. Two things open it:
//! - a ban (HTTP 418 or 403): requests are refused with
//!   [`ExchangeError::CircuitBreakerTripped`] until the ban expires;
//! - consecutive HTTP 429 answers: requests are held back with a transient
//!   [`ExchangeError::RateLimited`] until the exchange's `Retry-After` passes,
//!   so sibling symbols wait instead of failing.
//!
//! Connection errors, timeouts and 5xx answers never open the breaker. They
//! are per-request failures and belong to the caller's retry budget.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::ExchangeError;

/// Consecutive 429 answers after which every task is held back.
pub const RATE_LIMIT_STREAK: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hold {
    Banned,
    RateLimited,
}

#[derive(Debug, Default)]
struct Inner {
    open: Option<(Hold, Instant)>,
    rate_limit_streak: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    ban_cooldown: Duration,
}

impl CircuitBreaker {
    /// `ban_cooldown` applies when a ban answer carries no `Retry-After`.
    pub fn new(ban_cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ban_cooldown,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `Ok` if a request may be sent now.
    pub fn check(&self) -> Result<(), ExchangeError> {
        let mut inner = self.lock();
        let Some((hold, until)) = inner.open else {
            return Ok(());
        };
        let now = Instant::now();
        if now >= until {
            inner.open = None;
            inner.rate_limit_streak = 0;
            return Ok(());
        }
        match hold {
            Hold::Banned => Err(ExchangeError::CircuitBreakerTripped),
            Hold::RateLimited => Err(ExchangeError::RateLimited {
                retry_after_secs: ceil_secs(until - now),
            }),
        }
    }

    /// Any successful answer ends a rate-limit streak.
    pub fn record_success(&self) {
        self.lock().rate_limit_streak = 0;
    }

    /// Count a 429. Returns true if this answer put the whole run on hold.
    pub fn record_rate_limit(&self, retry_after: Duration) -> bool {
        let mut inner = self.lock();
        inner.rate_limit_streak += 1;
        if inner.rate_limit_streak < RATE_LIMIT_STREAK {
            return false;
        }
        // A ban already in force outranks a rate-limit hold.
        if matches!(inner.open, Some((Hold::Banned, _))) {
            return false;
        }
        inner.open = Some((Hold::RateLimited, Instant::now() + retry_after));
        true
    }

    /// Refuse all requests for `retry_after`, or the ban cooldown if unknown.
    pub fn record_ban(&self, retry_after: Option<Duration>) {
        let cooldown = retry_after.unwrap_or(self.ban_cooldown);
        self.lock().open = Some((Hold::Banned, Instant::now() + cooldown));
    }

    /// Time left before requests are allowed again (zero when open for business).
    pub fn remaining_cooldown(&self) -> Duration {
        match self.lock().open {
            Some((_, until)) => until.saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}
