//! Tick timestamp arithmetic.
//!
//! GEP timestamps are *ticks*: 100-nanosecond intervals since
//! 0001-01-01 00:00:00 UTC. This module converts between ticks, Unix
//! second-of-century values, and `chrono` date-times, and provides the
//! 10-minute window size used for compact-measurement base-time offsets.

use chrono::{DateTime, TimeZone, Utc};

/// Ticks per second.
pub const PER_SECOND: i64 = 10_000_000;

/// Ticks per millisecond.
pub const PER_MILLISECOND: i64 = 10_000;

/// Tick count at the Unix epoch (1970-01-01 00:00:00 UTC).
pub const UNIX_EPOCH_OFFSET: i64 = 621_355_968_000_000_000;

/// Width of a base-time offset window: ten minutes of ticks.
pub const BASE_TIME_WINDOW: i64 = 600 * PER_SECOND;

/// Current UTC time expressed in ticks.
pub fn now() -> i64 {
    Utc::now().timestamp_micros() * 10 + UNIX_EPOCH_OFFSET
}

/// Converts ticks to Unix second-of-century plus the millisecond remainder.
pub fn to_unix_time(ticks: i64) -> (i64, u16) {
    let elapsed = ticks - UNIX_EPOCH_OFFSET;
    let soc = elapsed / PER_SECOND;
    let milliseconds = (elapsed % PER_SECOND) / PER_MILLISECOND;
    (soc, milliseconds as u16)
}

/// Converts a Unix second-of-century and millisecond pair back to ticks.
pub fn from_unix_time(soc: i64, milliseconds: u16) -> i64 {
    UNIX_EPOCH_OFFSET + soc * PER_SECOND + i64::from(milliseconds) * PER_MILLISECOND
}

/// Converts ticks to a `chrono` UTC date-time, truncated to microseconds.
pub fn to_datetime(ticks: i64) -> DateTime<Utc> {
    let micros = (ticks - UNIX_EPOCH_OFFSET) / 10;
    Utc.timestamp_micros(micros).single().unwrap_or_default()
}
