//! Minute-precision UTC timestamps
//!
//! Calendar events are scheduled to the minute. [`DateTime`] truncates
//! seconds and sub-second parts on construction, so equality and ordering
//! are at minute granularity everywhere in the pipeline.

use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;

use chrono::{NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Textual form used in payloads, configuration and logs
pub const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Error returned when a timestamp cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid date time '{input}': expected YYYY-MM-DD HH:MM or RFC 3339")]
pub struct ParseDateTimeError {
    input: String,
}

/// A UTC timestamp truncated to the minute
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DateTime(chrono::DateTime<Utc>);

impl DateTime {
    /// Current time, truncated to the minute
    pub fn now() -> Self {
        Self::from_chrono(Utc::now())
    }

    /// Wrap a chrono timestamp, dropping seconds and sub-second precision
    pub fn from_chrono(value: chrono::DateTime<Utc>) -> Self {
        let truncated = value
            .with_second(0)
            .and_then(|v| v.with_nanosecond(0))
            .unwrap_or(value);
        Self(truncated)
    }

    /// Build from calendar fields; `None` for out-of-range values
    pub fn from_ymd_hm(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, minute, 0)
            .single()
            .map(Self)
    }

    /// The underlying chrono value
    pub fn as_chrono(&self) -> chrono::DateTime<Utc> {
        self.0
    }

    /// Offset by a whole number of minutes, `None` on overflow
    pub fn checked_add_minutes(self, minutes: i64) -> Option<Self> {
        self.0
            .checked_add_signed(chrono::Duration::minutes(minutes))
            .map(Self)
    }
}

impl From<chrono::DateTime<Utc>> for DateTime {
    fn from(value: chrono::DateTime<Utc>) -> Self {
        Self::from_chrono(value)
    }
}

impl From<DateTime> for chrono::DateTime<Utc> {
    fn from(value: DateTime) -> Self {
        value.0
    }
}

impl Add<chrono::Duration> for DateTime {
    type Output = DateTime;

    fn add(self, rhs: chrono::Duration) -> Self::Output {
        Self::from_chrono(self.0 + rhs)
    }
}

impl Sub<chrono::Duration> for DateTime {
    type Output = DateTime;

    fn sub(self, rhs: chrono::Duration) -> Self::Output {
        Self::from_chrono(self.0 - rhs)
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(DATE_TIME_FORMAT))
    }
}

impl FromStr for DateTime {
    type Err = ParseDateTimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, DATE_TIME_FORMAT) {
            return Ok(Self::from_chrono(Utc.from_utc_datetime(&naive)));
        }
        chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| Self::from_chrono(dt.with_timezone(&Utc)))
            .map_err(|_| ParseDateTimeError {
                input: s.to_string(),
            })
    }
}

impl Serialize for DateTime {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DateTime {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
