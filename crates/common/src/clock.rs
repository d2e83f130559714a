//! Wall-clock and timezone helpers
//!
//! Timestamps are unix epoch milliseconds throughout the system (the wire
//! format of the upstream token endpoints). Display formatting and the
//! statistics day boundary follow the configured IANA timezone, not UTC.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

/// Current time as unix epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Today's date in the given timezone, ISO `YYYY-MM-DD`.
///
/// This is the key under which usage statistics accumulate; a request served
/// at 23:59 local time counts toward the local day even when UTC has rolled
/// over.
pub fn today_iso(tz: Tz) -> String {
    Utc::now().with_timezone(&tz).format("%Y-%m-%d").to_string()
}

/// Format an epoch-millisecond timestamp as `YYYY-MM-DD HH:MM:SS` local time.
///
/// Out-of-range timestamps render as `"unknown"` rather than failing the
/// caller; these only ever reach display fields.
pub fn format_ms(tz: Tz, ms: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(dt) => dt
            .with_timezone(&tz)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        None => "unknown".to_string(),
    }
}
