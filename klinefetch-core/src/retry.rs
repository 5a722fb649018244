//! Bounded retry with exponential backoff and jitter.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::warn;

/// Configuration for exponential backoff retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt. Zero disables retry.
    pub max_retries: u32,
    /// Backoff before the first retry.
    #[serde(with = "millis", rename = "initial_backoff_ms")]
    pub initial_backoff: Duration,
    /// Upper bound for any single backoff.
    #[serde(with = "millis", rename = "max_backoff_ms")]
    pub max_backoff: Duration,
    /// Multiplier applied after each failed attempt.
    pub multiplier: u32,
    /// Relative random spread applied to each delay (0.1 = ±10%).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (0-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Backoff with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        if self.jitter_factor <= 0.0 || base.is_zero() {
            return base;
        }
        let base_ms = base.as_millis() as f64;
        let spread = base_ms * self.jitter_factor;
        let jittered = base_ms + rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_millis(jittered.max(1.0) as u64)
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAdvice {
    /// Permanent failure: return it.
    Stop,
    /// Retry after the policy's backoff.
    Backoff,
    /// Retry after the policy's backoff or this long, whichever is greater.
    After(Duration),
}

/// Run `operation`, retrying with backoff while `advise` allows it.
///
/// Returns the first success, the first error advised as [`RetryAdvice::Stop`],
/// or the last error after `max_retries` retries.
pub fn retry_with_backoff<T, E, F>(
    policy: &RetryPolicy,
    advise: impl Fn(&E) -> RetryAdvice,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: fmt::Display,
{
    for attempt in 0..policy.max_retries {
        let err = match operation() {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        let floor = match advise(&err) {
            RetryAdvice::Stop => return Err(err),
            RetryAdvice::Backoff => Duration::ZERO,
            RetryAdvice::After(wait) => wait,
        };
        let delay = policy.delay(attempt).max(floor);
        warn!(
            attempt = attempt + 1,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient failure, retrying"
        );
        std::thread::sleep(delay);
    }

    operation()
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
