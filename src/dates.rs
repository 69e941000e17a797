//! Calendar-day arithmetic. Every date here is a UTC calendar day.

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};

use crate::limits::{MAX_VALID_YEAR, MIN_VALID_YEAR};
use crate::model::{Day, Timestamp};

/// Exact number of calendar days from `start` to `end`. Negative if `end < start`.
pub fn days_between(start: Day, end: Day) -> i64 {
    (end - start).num_days()
}

/// True iff `[a_start, a_end)` and `[b_start, b_end)` share at least one day.
/// Touching endpoints do not overlap: checkout day can be the next check-in day.
pub fn overlaps(a_start: Day, a_end: Day, b_start: Day, b_end: Day) -> bool {
    a_start < b_end && b_start < a_end
}

/// True if `date` is strictly before the UTC calendar day containing `now`.
pub fn is_past(date: Day, now: Timestamp) -> bool {
    date < today(now)
}

pub fn today(now: Timestamp) -> Day {
    now.date_naive()
}

pub fn add_days(day: Day, n: u32) -> Option<Day> {
    day.checked_add_days(Days::new(u64::from(n)))
}

/// "Feb 15, 2024"
pub fn display_day(day: Day) -> String {
    day.format("%b %-d, %Y").to_string()
}

/// "Feb 1, 2024 14:05 UTC"
pub fn display_instant(at: Timestamp) -> String {
    at.format("%b %-d, %Y %H:%M UTC").to_string()
}

/// Parse a wire date. Accepts `YYYY-MM-DD`, an RFC 3339 instant, or integer Unix
/// milliseconds; instants are reduced to their UTC calendar day.
pub fn parse_day(raw: &str) -> Result<Day, DateParseError> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(DateParseError::Empty);
    }

    let day = if is_integer(s) {
        let ms: i64 = s
            .parse()
            .map_err(|_| DateParseError::Unrecognized(s.to_string()))?;
        DateTime::<Utc>::from_timestamp_millis(ms)
            .ok_or_else(|| DateParseError::Unrecognized(s.to_string()))?
            .date_naive()
    } else if let Ok(day) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        day
    } else {
        DateTime::parse_from_rfc3339(s)
            .map_err(|_| DateParseError::Unrecognized(s.to_string()))?
            .with_timezone(&Utc)
            .date_naive()
    };

    if !(MIN_VALID_YEAR..=MAX_VALID_YEAR).contains(&day.year()) {
        return Err(DateParseError::OutOfRange(day));
    }
    Ok(day)
}

fn is_integer(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DateParseError {
    #[error("empty date")]
    Empty,
    #[error("unrecognized date: {0}")]
    Unrecognized(String),
    #[error("date out of supported range: {0}")]
    OutOfRange(Day),
}
