//! Hour calendar helpers shared by gap detection, fetch and standardize.
//!
//! All hours are UTC and truncated to the top of the hour. Artifact file
//! names are the hour rendered with [`HOUR_FILE_FORMAT`], which sorts
//! lexicographically in time order so bounded prefix listings work.

use chrono::{DateTime, Duration, NaiveDateTime, Timelike, Utc};

/// File name format for hourly artifacts, e.g. `2024-03-01T13:00:00`.
pub const HOUR_FILE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Numeric hour key consumed by the warehouse loader, e.g. `2024030113`.
pub const HOUR_ID_FORMAT: &str = "%Y%m%d%H";

pub fn truncate_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

/// The `window` hour starts ending at (and including) the run's own hour,
/// ascending. An unaligned run time `now` therefore covers every hour start
/// inside `[now - window, now]`.
pub fn expected_hours(run_time: DateTime<Utc>, window: u32) -> Vec<DateTime<Utc>> {
    let last = truncate_hour(run_time);
    (0..window as i64)
        .rev()
        .map(|back| last - Duration::hours(back))
        .collect()
}

pub fn hour_file_name(hour: DateTime<Utc>) -> String {
    hour.format(HOUR_FILE_FORMAT).to_string()
}

/// Parse a file name produced by [`hour_file_name`]. Anything else is `None`.
pub fn parse_hour_file_name(name: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(name, HOUR_FILE_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

pub fn hour_id(hour: DateTime<Utc>) -> i64 {
    // Always ten ASCII digits, so the parse cannot fail.
    hour.format(HOUR_ID_FORMAT).to_string().parse().unwrap_or_default()
}

/// Last second of the hour starting at `start`.
pub fn hour_end(start: DateTime<Utc>) -> DateTime<Utc> {
    start + Duration::minutes(59) + Duration::seconds(59)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn window_ends_at_run_hour() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 37, 12).unwrap();
        let hours = expected_hours(now, 24);
        assert_eq!(hours.len(), 24);
        assert_eq!(hours.last().copied(), Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()));
        assert_eq!(hours[0], Utc.with_ymd_and_hms(2024, 2, 29, 11, 0, 0).unwrap());
        assert!(hours.windows(2).all(|w| w[1] - w[0] == Duration::hours(1)));
    }

    #[test]
    fn empty_window() {
        assert!(expected_hours(Utc::now(), 0).is_empty());
    }

    #[test]
    fn file_name_parses_back() {
        let h = Utc.with_ymd_and_hms(2023, 12, 31, 23, 0, 0).unwrap();
        assert_eq!(hour_file_name(h), "2023-12-31T23:00:00");
        assert_eq!(parse_hour_file_name("2023-12-31T23:00:00"), Some(h));
        assert_eq!(parse_hour_file_name("updates-1-2023"), None);
    }

    #[test]
    fn hour_id_and_end() {
        let h = Utc.with_ymd_and_hms(2024, 1, 5, 7, 0, 0).unwrap();
        assert_eq!(hour_id(h), 2024010507);
        assert_eq!(hour_end(h), Utc.with_ymd_and_hms(2024, 1, 5, 7, 59, 59).unwrap());
    }
}
