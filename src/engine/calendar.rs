use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};

use crate::limits::{MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::model::{Ms, Span};

use super::ScheduleError;

const DAY_MS: Ms = 24 * 60 * 60 * 1000;

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// Instant of `time` on `day` in the clinic's local offset.
pub(crate) fn local_instant(day: NaiveDate, time: NaiveTime, offset: FixedOffset) -> Ms {
    let naive_ms = day.and_time(time).and_utc().timestamp_millis();
    naive_ms - offset.local_minus_utc() as Ms * 1000
}

/// Local midnight to the next local midnight.
pub(crate) fn day_span(day: NaiveDate, offset: FixedOffset) -> Span {
    let start = local_instant(day, NaiveTime::MIN, offset);
    Span::new(start, start + DAY_MS)
}

/// `YYYY-MM-DD`, or an RFC 3339 timestamp whose local date is taken.
pub(crate) fn parse_day(field: &'static str, input: &str, offset: FixedOffset) -> Result<NaiveDate, ScheduleError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ScheduleError::validation(field, "missing date"));
    }
    let day = NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(input)
                .ok()
                .map(|dt| dt.with_timezone(&offset).date_naive())
        })
        .ok_or_else(|| ScheduleError::validation(field, format!("unparsable date: {input}")))?;
    check_range(field, day_span(day, offset).start)?;
    Ok(day)
}

/// RFC 3339, or a naive local date-time interpreted in `offset`.
pub(crate) fn parse_instant(field: &'static str, input: &str, offset: FixedOffset) -> Result<Ms, ScheduleError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ScheduleError::validation(field, "missing date"));
    }
    let ms = match DateTime::parse_from_rfc3339(input) {
        Ok(dt) => dt.timestamp_millis(),
        Err(_) => NAIVE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(input, fmt).ok())
            .map(|naive| local_instant(naive.date(), naive.time(), offset))
            .ok_or_else(|| ScheduleError::validation(field, format!("unparsable date-time: {input}")))?,
    };
    check_range(field, ms)?;
    Ok(ms)
}

fn check_range(field: &'static str, ms: Ms) -> Result<(), ScheduleError> {
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&ms) {
        return Err(ScheduleError::validation(field, "date out of range"));
    }
    Ok(())
}
