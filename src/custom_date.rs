use chrono::format::strftime::StrftimeItems;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

#[derive(Debug, thiserror::Error)]
pub enum DateError {
    #[error("invalid date {0:?}: {1}")]
    Parse(String, chrono::ParseError),
    #[error("date {0:?} has no midnight in {1}")]
    NoMidnight(String, Tz),
}

/// Atom timestamp, always UTC, always exactly three fractional digits and a
/// literal `Z`: `2024-04-01T09:30:00.125Z`.
pub fn format_iso8601_millis(datetime: DateTime<Utc>) -> String {
    let format = StrftimeItems::new("%Y-%m-%dT%H:%M:%S%.3fZ");
    datetime.format_with_items(format).to_string()
}

/// Parses a GitLab `due_date` (`2024-04-01`) as midnight in `tz`.
pub fn parse_due_date(date_str: &str, tz: Tz) -> Result<DateTime<Utc>, DateError> {
    let date_str = date_str.trim_matches('"');

    let date = NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
        .map_err(|e| DateError::Parse(date_str.to_string(), e))?;
    let datetime = date.and_time(NaiveTime::MIN);

    // A DST jump can skip midnight entirely, earliest() covers the ambiguous case
    let local = tz
        .from_local_datetime(&datetime)
        .earliest()
        .ok_or_else(|| DateError::NoMidnight(date_str.to_string(), tz))?;

    Ok(local.with_timezone(&Utc))
}

/// Half-open poll window check: `start < when <= end`.
pub fn is_within_window(when: DateTime<Utc>, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    start < when && when <= end
}
