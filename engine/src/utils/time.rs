//! Time utility functions
//!
//! All pipeline timestamps are integer milliseconds since the Unix epoch,
//! UTC. Activity windows are aligned to a fixed UTC grid.

use chrono::{DateTime, Utc};

/// Current wall-clock time in epoch milliseconds
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert epoch milliseconds to DateTime<Utc>
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(|| {
        tracing::warn!(ms, "Invalid timestamp, using epoch");
        DateTime::UNIX_EPOCH
    })
}

/// Floor a timestamp to the start of its activity window.
///
/// Windows are aligned to the UTC epoch grid, so two timestamps in the same
/// window always floor to the same value regardless of process restarts.
pub fn floor_to_window(ts_ms: i64, window_ms: i64) -> i64 {
    ts_ms - ts_ms.rem_euclid(window_ms)
}

/// Parse ISO 8601 / RFC 3339 timestamp string to epoch milliseconds
pub fn parse_iso_ms(ts: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
        .ok()
}
