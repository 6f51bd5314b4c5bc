//! Durations and timestamps in query text.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};

const NANOS_PER_SEC: f64 = 1e9;

/// Parses `5m`, `1h30m`, `500ms`, `1.5h`, `7d`, `2w`, `1y` into nanoseconds.
/// A leading `-` negates.
pub fn parse_duration(s: &str) -> Option<i64> {
    let s = s.trim();
    let (negative, mut rest) = match s.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, s),
    };
    if rest.is_empty() {
        return None;
    }
    let mut total = 0f64;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_end == 0 {
            return None;
        }
        let n: f64 = rest[..num_end].parse().ok()?;
        rest = &rest[num_end..];
        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let mul = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => NANOS_PER_SEC,
            "m" => 60.0 * NANOS_PER_SEC,
            "h" => 3600.0 * NANOS_PER_SEC,
            "d" => 86_400.0 * NANOS_PER_SEC,
            "w" => 7.0 * 86_400.0 * NANOS_PER_SEC,
            "y" => 365.0 * 86_400.0 * NANOS_PER_SEC,
            _ => return None,
        };
        total += n * mul;
        rest = &rest[unit_end..];
    }
    if !total.is_finite() || total > i64::MAX as f64 {
        return None;
    }
    let nanos = total as i64;
    Some(if negative { -nanos } else { nanos })
}

/// Parses an absolute or relative point in time into nanoseconds:
/// RFC 3339, `YYYY-MM-DD`, `YYYY-MM-DDTHH:MM:SS` (UTC), unix seconds,
/// `now`, or a duration meaning that long before `now`.
pub fn parse_time(s: &str, now: i64) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if s == "now" {
        return Some(now);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.timestamp_nanos_opt();
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return dt.and_utc().timestamp_nanos_opt();
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0)?.and_utc().timestamp_nanos_opt();
    }
    if let Ok(secs) = s.parse::<f64>() {
        if secs.is_finite() && secs.abs() < i64::MAX as f64 / NANOS_PER_SEC {
            return Some((secs * NANOS_PER_SEC).round() as i64);
        }
        return None;
    }
    let ago = parse_duration(s.strip_prefix("now-").unwrap_or(s))?;
    now.checked_sub(ago)
}

/// RFC 3339 in UTC with as many fractional digits as needed.
pub fn format_time(ts: i64) -> String {
    Utc.timestamp_nanos(ts).to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Unix seconds as a JSON number: an integer when whole, a float otherwise.
pub fn unix_seconds(ts: i64) -> serde_json::Value {
    if ts % 1_000_000_000 == 0 {
        serde_json::json!(ts / 1_000_000_000)
    } else {
        serde_json::json!(ts as f64 / NANOS_PER_SEC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: i64 = 1_000_000_000;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("5m"), Some(300 * SEC));
        assert_eq!(parse_duration("1h30m"), Some(5400 * SEC));
        assert_eq!(parse_duration("500ms"), Some(SEC / 2));
        assert_eq!(parse_duration("1.5h"), Some(5400 * SEC));
        assert_eq!(parse_duration("7d"), Some(7 * 86_400 * SEC));
        assert_eq!(parse_duration("-1s"), Some(-SEC));
        assert_eq!(parse_duration("5"), None);
        assert_eq!(parse_duration("m"), None);
        assert_eq!(parse_duration("5parsecs"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn test_parse_time_forms() {
        let now = 1_000 * SEC;
        assert_eq!(parse_time("1970-01-01T00:00:01Z", now), Some(SEC));
        assert_eq!(parse_time("1970-01-01T00:00:01.5+00:00", now), Some(SEC + SEC / 2));
        assert_eq!(parse_time("1970-01-02", now), Some(86_400 * SEC));
        assert_eq!(parse_time("1970-01-01T00:01:00", now), Some(60 * SEC));
        assert_eq!(parse_time("12.5", now), Some(12 * SEC + SEC / 2));
        assert_eq!(parse_time("now", now), Some(now));
        assert_eq!(parse_time("10s", now), Some(990 * SEC));
        assert_eq!(parse_time("now-10s", now), Some(990 * SEC));
        assert_eq!(parse_time("yesterday", now), None);
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(0), "1970-01-01T00:00:00Z");
        assert_eq!(format_time(1_500_000_000), "1970-01-01T00:00:01.500Z");
        assert_eq!(format_time(1), "1970-01-01T00:00:00.000000001Z");
    }

    #[test]
    fn test_unix_seconds() {
        assert_eq!(unix_seconds(5 * SEC), serde_json::json!(5));
        assert_eq!(unix_seconds(SEC / 2), serde_json::json!(0.5));
    }
}
