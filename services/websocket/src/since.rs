//! `since` durations for log replay: `<n><unit>` with units `m` (minutes),
//! `h`, `d`, `w` and `M` (30-day months).
use chrono::{DateTime, TimeDelta, Utc};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SinceError {
    #[error("since is empty")]
    Empty,
    #[error("since {0:?} does not start with a count")]
    InvalidCount(String),
    #[error("since {0:?} has an unknown unit; expected m, h, d, w or M")]
    UnknownUnit(String),
    #[error("since {0:?} is out of range")]
    OutOfRange(String),
}

pub fn parse_since(raw: &str) -> Result<TimeDelta, SinceError> {
    let raw = raw.trim();
    let Some(unit) = raw.chars().last() else {
        return Err(SinceError::Empty);
    };
    let count = &raw[..raw.len() - unit.len_utf8()];
    let count: i64 = count
        .parse()
        .ok()
        .filter(|count| *count >= 0)
        .ok_or_else(|| SinceError::InvalidCount(raw.to_string()))?;
    let minutes_per_unit = match unit {
        'm' => 1,
        'h' => 60,
        'd' => 60 * 24,
        'w' => 60 * 24 * 7,
        'M' => 60 * 24 * 30,
        _ => return Err(SinceError::UnknownUnit(raw.to_string())),
    };
    count
        .checked_mul(minutes_per_unit)
        .and_then(TimeDelta::try_minutes)
        .ok_or_else(|| SinceError::OutOfRange(raw.to_string()))
}

/// Absolute replay start for `since`, measured back from `now`.
pub fn start_time(raw: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, SinceError> {
    let delta = parse_since(raw)?;
    now.checked_sub_signed(delta)
        .ok_or_else(|| SinceError::OutOfRange(raw.to_string()))
}
