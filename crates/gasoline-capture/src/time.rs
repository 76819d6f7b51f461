use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

/// Parses an RFC3339 timestamp (nanosecond precision allowed).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn rfc3339(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_rfc3339() -> String {
    rfc3339(Utc::now())
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Saturates past 2262, where `i64` nanoseconds run out.
pub fn now_nanos() -> i64 {
    let now = Utc::now();
    now.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Converts epoch milliseconds (the unit actions carry) into a timestamp.
pub fn from_epoch_ms(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339_and_nano_precision() {
        let a = parse_timestamp("2026-05-01T12:00:00Z").expect("seconds");
        let b = parse_timestamp("2026-05-01T12:00:00.123456789Z").expect("nanos");
        let c = parse_timestamp("2026-05-01T14:00:00+02:00").expect("offset");
        assert!(b > a);
        assert_eq!(a, c);
        assert!(parse_timestamp("yesterday").is_none());
        assert!(parse_timestamp("").is_none());
    }

    #[test]
    fn epoch_clocks_agree() {
        let ms = now_ms();
        let nanos = now_nanos();
        assert!(ms > 1_700_000_000_000);
        assert!((nanos / 1_000_000 - ms).abs() < 1_000);
        assert_eq!(from_epoch_ms(ms).map(|dt| dt.timestamp_millis()), Some(ms));
    }
}
