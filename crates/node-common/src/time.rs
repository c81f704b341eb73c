//! Calendar helpers for UNIX timestamps.

/// Seconds per day.
pub const SECONDS_PER_DAY: u32 = 86_400;

/// Microseconds per second.
pub const MICROS_PER_SECOND: u64 = 1_000_000;

/// Convert a UNIX time in microseconds to whole seconds.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn micros_to_secs(unix_time_us: u64) -> u32 {
    (unix_time_us / MICROS_PER_SECOND).min(u64::from(u32::MAX)) as u32
}

/// Next UNIX time (seconds, UTC) strictly after `now` at which the wall
/// clock shows `hour:minute:second`.
///
/// Returns `None` for an invalid time of day.
#[must_use]
pub fn next_time_at_daytime(now: u32, hour: u8, minute: u8, second: u8) -> Option<u32> {
    if hour > 23 || minute > 59 || second > 59 {
        return None;
    }
    let offset = u32::from(hour) * 3600 + u32::from(minute) * 60 + u32::from(second);
    let midnight = now - now % SECONDS_PER_DAY;
    let candidate = midnight.checked_add(offset)?;
    if candidate > now {
        Some(candidate)
    } else {
        candidate.checked_add(SECONDS_PER_DAY)
    }
}
