//! Timestamp helpers shared by the serialized forms of events and states

use chrono::{DateTime, SecondsFormat, Utc};

/// Render a UTC timestamp as ISO 8601 with a `+00:00` offset
pub fn isoformat(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, false)
}

/// Parse an ISO 8601 / RFC 3339 timestamp into UTC
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_isoformat_uses_offset() {
        let dt = Utc.with_ymd_and_hms(2021, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(isoformat(&dt), "2021-03-01T12:00:00+00:00");
    }

    #[test]
    fn test_parse_keeps_subsecond_precision() {
        let now = Utc::now();
        assert_eq!(parse_datetime(&isoformat(&now)), Some(now));
        assert_eq!(parse_datetime("not a date"), None);
    }
}
