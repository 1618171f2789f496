//! Conversion for the device's message timestamps.
//!
//! The message store records instants as nanoseconds since 2001-01-01T00:00:00Z.
//! A raw value of zero means "no value", not the reference instant itself.

use chrono::{DateTime, Utc};

/// 2001-01-01T00:00:00Z in Unix milliseconds.
pub const APPLE_EPOCH_UNIX_MS: i64 = 978_307_200_000;

const NANOS_PER_MILLI: i64 = 1_000_000;

pub fn apple_ns_to_datetime(raw: Option<i64>) -> Option<DateTime<Utc>> {
    let raw = raw.filter(|v| *v != 0)?;
    let millis = APPLE_EPOCH_UNIX_MS.checked_add(raw / NANOS_PER_MILLI)?;
    DateTime::from_timestamp_millis(millis)
}

/// Inverse of [`apple_ns_to_datetime`], truncated to millisecond precision.
pub fn datetime_to_apple_ns(value: DateTime<Utc>) -> i64 {
    (value.timestamp_millis() - APPLE_EPOCH_UNIX_MS).saturating_mul(NANOS_PER_MILLI)
}
