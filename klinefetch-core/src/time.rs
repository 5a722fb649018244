//! Instant normalization and timestamp rendering.
//!
//! Every instant that reaches the pagination engine is UTC. Callers may hand
//! in naive date-times (assumed UTC, with a warning) or instants carrying any
//! fixed offset (converted to UTC).

use chrono::{DateTime, FixedOffset, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

/// Date format used on the command line and in CSV output, e.g. `2019-11-16 23:16:15`.
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimeError {
    #[error("not a valid date: '{input}'. Expected format is YYYY-MM-DD HH:MM:SS or RFC 3339")]
    Unparseable { input: String },

    #[error("timestamp {millis} ms is out of range")]
    OutOfRange { millis: i64 },
}

/// A caller-supplied instant, before UTC normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstantInput {
    /// No timezone information.
    Naive(NaiveDateTime),
    /// Timezone-aware, possibly with a non-UTC offset.
    Zoned(DateTime<FixedOffset>),
}

impl InstantInput {
    /// Normalize to a UTC instant.
    ///
    /// Naive values are assumed to be UTC; non-zero offsets are converted.
    /// Both cases log a warning, a UTC-aware input passes through silently.
    pub fn to_utc(self) -> DateTime<Utc> {
        match self {
            InstantInput::Naive(naive) => {
                warn!(%naive, "the given date is not timezone aware, assuming UTC");
                naive.and_utc()
            }
            InstantInput::Zoned(zoned) => {
                if zoned.offset().local_minus_utc() != 0 {
                    warn!(%zoned, "the given date is not in UTC, converting to UTC");
                }
                zoned.with_timezone(&Utc)
            }
        }
    }

    /// True if the instant carries no timezone.
    pub fn is_naive(&self) -> bool {
        matches!(self, InstantInput::Naive(_))
    }
}

impl From<DateTime<Utc>> for InstantInput {
    fn from(dt: DateTime<Utc>) -> Self {
        InstantInput::Zoned(dt.fixed_offset())
    }
}

impl From<DateTime<FixedOffset>> for InstantInput {
    fn from(dt: DateTime<FixedOffset>) -> Self {
        InstantInput::Zoned(dt)
    }
}

impl From<NaiveDateTime> for InstantInput {
    fn from(dt: NaiveDateTime) -> Self {
        InstantInput::Naive(dt)
    }
}

impl FromStr for InstantInput {
    type Err = TimeError;

    /// Accepts RFC 3339 (`2020-09-01T00:00:00+02:00`), `YYYY-MM-DD HH:MM:SS`,
    /// `YYYY-MM-DDTHH:MM:SS` and a bare `YYYY-MM-DD` (midnight).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(zoned) = DateTime::parse_from_rfc3339(s) {
            return Ok(InstantInput::Zoned(zoned));
        }
        for fmt in [DATE_FORMAT, "%Y-%m-%dT%H:%M:%S"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
                return Ok(InstantInput::Naive(naive));
            }
        }
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(InstantInput::Naive)
            .ok_or_else(|| TimeError::Unparseable {
                input: s.to_string(),
            })
    }
}

/// Epoch milliseconds for a UTC instant, truncated to whole seconds.
pub fn to_epoch_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp() * 1000
}

/// How kline timestamps are rendered in output files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampStyle {
    /// The machine's local timezone.
    #[default]
    Local,
    Utc,
}

/// Render an epoch-millisecond timestamp as `YYYY-MM-DD HH:MM:SS`.
pub fn render_timestamp(millis: i64, style: TimestampStyle) -> Result<String, TimeError> {
    let utc = DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or(TimeError::OutOfRange { millis })?;
    let rendered = match style {
        TimestampStyle::Utc => utc.format(DATE_FORMAT).to_string(),
        TimestampStyle::Local => Local
            .from_utc_datetime(&utc.naive_utc())
            .format(DATE_FORMAT)
            .to_string(),
    };
    Ok(rendered)
}
