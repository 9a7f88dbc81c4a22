//! # Timestamp
//!
//! Instant parsing and the fixed-width, sortable key fragment derived from an instant.
//! Report items are range-queried by this key, so it must sort lexicographically in the
//! same order as the instants it was derived from.
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, SecondsFormat, Timelike, Utc};

/// Layout of the sortable key fragment: `YYYYMMDDTHHMMSS`, always in UTC.
const SORT_KEY_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Formats accepted for civil date-times that carry no offset. These are read as UTC.
const CIVIL_DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
];

/// Parse an ISO-8601 instant.
///
/// This function tries parsing in order of preference:
/// 1. RFC3339 (`2024-05-19T10:00:00Z`, `2024-05-19T12:00:00.123+02:00`).
/// 2. ISO-8601 with a compact offset or without seconds (`2024-05-19T12:00:00+0200`,
///    `2024-05-19T12:00+02:00`).
/// 3. Civil date-times, read as UTC (`2024-05-19T10:00:00`, `2024-05-19T10:00Z`).
/// 4. A bare date, read as midnight UTC (`2024-05-19`).
///
/// Leap seconds are rejected, as are instants outside of years 0 through 9999 so that every
/// key stays fixed-width.
pub fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let parsed = DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M%:z"))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| parse_civil(value))?;

    // chrono keeps a leap second as a nanosecond count past one second.
    if parsed.nanosecond() >= 1_000_000_000 {
        return None;
    }

    if (0..=9999).contains(&parsed.year()) {
        Some(parsed)
    } else {
        None
    }
}

fn parse_civil(value: &str) -> Option<DateTime<Utc>> {
    let date_time = value.strip_suffix(&['Z', 'z'][..]).unwrap_or(value);

    CIVIL_DATE_TIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(date_time, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc())
}

/// Serialize an instant in canonical form: UTC, millisecond precision, `Z` suffix.
pub fn canonical(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Encode an instant as a `YYYYMMDDTHHMMSS` key fragment.
/// Sub-second precision is dropped, so instants within the same second share a key.
pub fn sort_key_timestamp(instant: &DateTime<Utc>) -> String {
    instant.format(SORT_KEY_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_parse_instant_accepts_iso_variants() {
        let expected = "2024-05-19T10:00:00.000Z";

        for input in [
            "2024-05-19T10:00:00Z",
            "2024-05-19T10:00:00.000Z",
            "2024-05-19T12:00:00+02:00",
            "2024-05-19T12:00:00+0200",
            "2024-05-19T10:00:00",
            " 2024-05-19T10:00:00Z ",
            "2024-05-19 10:00:00",
            "2024-05-19T10:00Z",
            "2024-05-19T12:00+02:00",
            "2024-05-19T10:00",
        ] {
            let parsed = parse_instant(input).unwrap_or_else(|| panic!("failed to parse {input}"));
            assert_eq!(canonical(&parsed), expected, "input: {input}");
        }

        let midnight = parse_instant("2024-05-19").unwrap();
        assert_eq!(canonical(&midnight), "2024-05-19T00:00:00.000Z");
    }

    #[test]
    fn test_parse_instant_rejects_garbage() {
        assert_eq!(parse_instant(""), None);
        assert_eq!(parse_instant("   "), None);
        assert_eq!(parse_instant("yesterday"), None);
        assert_eq!(parse_instant("2024-13-40T10:00:00Z"), None);
        assert_eq!(parse_instant("+10000-01-01T00:00:00Z"), None);
        assert_eq!(parse_instant("2024-05-19Z"), None);
        assert_eq!(parse_instant("2016-12-31T23:59:60Z"), None);
        assert_eq!(parse_instant("2016-12-31T23:59:60.500"), None);
    }

    #[test]
    fn test_canonical_truncates_to_milliseconds() {
        let parsed = parse_instant("2024-05-20T12:34:56.789123Z").unwrap();
        assert_eq!(canonical(&parsed), "2024-05-20T12:34:56.789Z");
    }

    #[test]
    fn test_sort_key_timestamp() {
        let parsed = parse_instant("2024-05-19T10:00:00Z").unwrap();
        assert_eq!(sort_key_timestamp(&parsed), "20240519T100000");

        let parsed = parse_instant("2024-01-02T03:04:05.999+00:00").unwrap();
        assert_eq!(sort_key_timestamp(&parsed), "20240102T030405");

        let parsed = parse_instant("0099-01-01T00:00:00Z").unwrap();
        assert_eq!(sort_key_timestamp(&parsed), "00990101T000000");
    }

    #[test]
    fn test_sort_key_timestamp_is_stable() {
        let parsed = parse_instant("2024-05-20T23:59:59+05:30").unwrap();
        let first = sort_key_timestamp(&parsed);
        for _ in 0..10 {
            assert_eq!(sort_key_timestamp(&parsed), first);
        }
        assert_eq!(first, "20240520T182959");
    }

    #[test]
    fn test_sort_key_timestamp_preserves_order() {
        let mut instant = parse_instant("1999-12-31T23:58:00Z").unwrap();
        let mut previous = sort_key_timestamp(&instant);

        // Step across minute, day, month and year boundaries with uneven increments.
        for step in 0..5_000 {
            instant += Duration::milliseconds(137 + (step % 7) * 251);
            let key = sort_key_timestamp(&instant);

            assert_eq!(key.len(), 15);
            assert!(key >= previous, "{key} sorted before {previous}");
            previous = key;
        }
    }
}
