//! Textual timestamps as consumed downstream: naive local time with millisecond
//! precision followed by an explicit `±HH:MM` offset, e.g. `2023-05-01T08:15:30.250-02:30`.
use chrono::{DateTime, NaiveDateTime, Utc};

const MINUTES_IN_HOUR: u32 = 60;
const NAIVE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Render an offset in minutes as `+HH:MM` or `-HH:MM`.
pub fn format_utc_offset(minutes: i32) -> String {
    let sign = if minutes < 0 { '-' } else { '+' };
    let magnitude = minutes.unsigned_abs();
    format!(
        "{}{:02}:{:02}",
        sign,
        magnitude / MINUTES_IN_HOUR,
        magnitude % MINUTES_IN_HOUR
    )
}

/// Combine a naive local time with the offset it was recorded in.
pub fn combine(naive: NaiveDateTime, utc_offset_minutes: i32) -> String {
    format!(
        "{}{}",
        naive.format(NAIVE_FORMAT),
        format_utc_offset(utc_offset_minutes)
    )
}

/// The shared timestamp of a poll batch, always rendered in UTC.
pub fn message_timestamp(now: DateTime<Utc>) -> String {
    combine(now.naive_utc(), 0)
}
