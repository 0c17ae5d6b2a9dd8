//! Timestamp formats used on the wire.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// Format used for `updated_since` and lock tokens: `YYYY-MM-DDTHH:MM:SS.sssZ`.
pub fn format_api_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Parse a timestamp returned by the API.
///
/// Accepts RFC 3339 and the bare `YYYY-MM-DD HH:MM:SS` form some endpoints emit.
pub fn parse_api_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Parse an HTTP `Date` header.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

/// Render a timestamp as an HTTP `Date` header value.
pub fn format_http_date(ts: &DateTime<Utc>) -> String {
    ts.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Unix epoch, used when a checkpoint has to be discarded entirely.
pub fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_format_has_millis_and_z() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        assert_eq!(format_api_timestamp(&ts), "2024-03-05T07:08:09.000Z");
    }

    #[test]
    fn test_parse_api_variants() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        assert_eq!(parse_api_timestamp("2024-03-05T07:08:09.000Z"), Some(expected));
        assert_eq!(parse_api_timestamp("2024-03-05T09:08:09+02:00"), Some(expected));
        assert_eq!(parse_api_timestamp("2024-03-05 07:08:09"), Some(expected));
        assert_eq!(parse_api_timestamp("yesterday"), None);
    }

    #[test]
    fn test_http_date_round_trip() {
        let ts = Utc.with_ymd_and_hms(2024, 11, 15, 8, 12, 31).unwrap();
        let header = format_http_date(&ts);
        assert_eq!(header, "Fri, 15 Nov 2024 08:12:31 GMT");
        assert_eq!(parse_http_date(&header), Some(ts));
        assert_eq!(parse_http_date("Fri, 15 Nov 2024 08:12:31 +0000"), Some(ts));
    }

    #[test]
    fn test_epoch() {
        assert_eq!(epoch().timestamp(), 0);
    }
}
