//! Event model and timestamp conversions.
//!
//! Artifact readers encounter Windows FILETIME, Unix epochs, WebKit epochs
//! and pre-formatted strings; everything converges on a UTC instant rendered
//! with millisecond precision. The pre-formatted string path exists so a
//! reader can preserve an original millisecond rendering verbatim.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Offset between the Windows FILETIME epoch (1601-01-01) and the Unix
/// epoch, in 100-nanosecond ticks.
pub const EPOCH_AS_FILETIME: i64 = 116_444_736_000_000_000;

/// One forensic event, produced by an artifact reader and consumed by the
/// chunk writer. Never mutated after emission.
#[derive(Debug, Clone, Default)]
pub struct Event {
    /// Precise instant, if the source carries a machine timestamp.
    pub timestamp: Option<DateTime<Utc>>,
    /// Pre-formatted `YYYY-MM-DD HH:MM:SS.mmm` string; wins over
    /// `timestamp` when both are set.
    pub timestamp_str: Option<String>,
    /// Original artifact path as recorded at collection time, falling back
    /// to the staged path.
    pub source: String,
    /// Human-readable description; events with an empty description are
    /// dropped at emission.
    pub description: String,
}

/// Render an instant as `YYYY-MM-DD HH:MM:SS.mmm` (zero-padded, UTC).
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// The distinguished timestamp used when a source carries none.
pub fn epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

/// Convert a Windows FILETIME (100ns ticks since 1601-01-01) to UTC.
pub fn from_filetime(filetime: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros((filetime - EPOCH_AS_FILETIME) / 10)
}

/// Convert Unix epoch seconds to UTC.
pub fn from_unix_seconds(seconds: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(seconds, 0)
}

/// Convert Unix epoch microseconds to UTC.
pub fn from_unix_micros(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
}

/// Convert WebKit/Chromium microseconds since 1601-01-01 to UTC.
pub fn from_webkit_micros(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros - EPOCH_AS_FILETIME / 10)
}

/// Parse the `MM/DD/YYYY HH:MM:SS` strings AmCache stores, as UTC.
pub fn from_us_datetime(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, "%m/%d/%Y %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}
