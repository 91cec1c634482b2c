//! Timestamp utilities

use chrono::{DateTime, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Current time as fractional seconds since the Unix epoch
///
/// Persisted documents store timestamps in this form so they stay readable
/// by tools that expect plain epoch seconds.
pub fn epoch_seconds() -> f64 {
    to_epoch_seconds(now())
}

/// Convert a UTC timestamp to fractional epoch seconds
pub fn to_epoch_seconds(ts: DateTime<Utc>) -> f64 {
    ts.timestamp() as f64 + f64::from(ts.timestamp_subsec_micros()) / 1_000_000.0
}

/// Convert milliseconds to duration
pub fn millis_to_duration(millis: u64) -> std::time::Duration {
    std::time::Duration::from_millis(millis)
}
