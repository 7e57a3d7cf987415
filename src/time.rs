// This file is part of apw. Copyright © 2025 apw contributors.
// apw is licensed under the GNU AGPL v3.0 or any later version. See LICENSE file for full text.

//! Wall clock helpers. Cache renewal and deal windows are unix seconds; the daily request quota rolls over at local
//! midnight.

use jiff::civil::{Date, DateTime, Time};
use jiff::tz::TimeZone;
use jiff::{Timestamp, Zoned};

/// Current unix time in seconds
pub fn unix_now() -> i64 {
    Timestamp::now().as_second()
}

/// Current unix time in milliseconds
pub fn unix_now_millis() -> i64 {
    Timestamp::now().as_millisecond()
}

/// The local calendar day as `YYYYMMDD`
pub fn today() -> String {
    day_key(&Zoned::now())
}

pub fn day_key(zoned: &Zoned) -> String {
    zoned.strftime("%Y%m%d").to_string()
}

/// Parse a date/time from the deal feed into unix seconds.
///
/// Accepts RFC 3339 timestamps, civil date-times with an optional trailing `UTC`/`GMT` (local time zone when absent),
/// and bare dates (local midnight).
pub fn parse_feed_time(input: &str) -> Option<i64> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(timestamp) = input.parse::<Timestamp>() {
        return Some(timestamp.as_second());
    }
    if let Ok(zoned) = input.parse::<Zoned>() {
        return Some(zoned.timestamp().as_second());
    }

    let (civil, tz) = match input.strip_suffix(" UTC").or_else(|| input.strip_suffix(" GMT")) {
        Some(civil) => (civil.trim_end(), TimeZone::UTC),
        None => (input, TimeZone::system()),
    };
    let datetime = civil
        .parse::<DateTime>()
        .ok()
        .or_else(|| civil.parse::<Date>().ok().map(|date| date.to_datetime(Time::midnight())))?;
    datetime.to_zoned(tz).ok().map(|zoned| zoned.timestamp().as_second())
}

/// Format unix seconds as an RFC 2822 date in the local time zone
pub fn format_rfc2822(unix_seconds: i64) -> Option<String> {
    let zoned = Timestamp::from_second(unix_seconds).ok()?.to_zoned(TimeZone::system());
    jiff::fmt::rfc2822::to_string(&zoned).ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_rfc3339() {
        assert_eq!(parse_feed_time("2024-01-01T00:00:00Z"), Some(1_704_067_200));
        assert_eq!(parse_feed_time("2024-01-01T01:00:00+01:00"), Some(1_704_067_200));
    }

    #[test]
    fn test_parse_utc_suffix() {
        assert_eq!(parse_feed_time("2024-01-01 00:00:00 UTC"), Some(1_704_067_200));
        assert_eq!(parse_feed_time("2024-01-01T00:00:00 GMT"), Some(1_704_067_200));
    }

    #[test]
    fn test_parse_local() {
        assert!(parse_feed_time("2024-06-14 17:30:00").is_some());
        assert!(parse_feed_time("2024-06-14").is_some());
    }

    #[test]
    fn test_parse_garbage() {
        assert_eq!(parse_feed_time(""), None);
        assert_eq!(parse_feed_time("   "), None);
        assert_eq!(parse_feed_time("next tuesday"), None);
    }

    #[test]
    fn test_day_key() {
        let zoned: Zoned = "2024-03-09T23:59:59[UTC]".parse().expect("valid zoned datetime");
        assert_eq!(day_key(&zoned), "20240309");
    }

    #[test]
    fn test_rfc2822_roundtrips_instant() {
        let formatted = format_rfc2822(1_704_067_200).expect("in-range timestamp");
        let parsed = jiff::fmt::rfc2822::parse(&formatted).expect("valid rfc2822");
        assert_eq!(parsed.timestamp().as_second(), 1_704_067_200);
    }
}
