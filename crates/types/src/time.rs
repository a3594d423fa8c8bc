//! RFC 3339 timestamp helpers.
//!
//! Record timestamps are UTC RFC 3339 strings with millisecond
//! resolution (`2026-08-02T10:30:00.123Z`). The string form sorts
//! lexicographically in time order, which the `updated` secondary index
//! relies on.

use chrono::{DateTime, Duration, SecondsFormat, Utc};

/// Returns the current UTC time as an RFC 3339 millisecond string.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Returns a timestamp strictly after `prev`.
///
/// Normally this is just "now"; when the clock has not advanced past
/// `prev` (sub-millisecond update bursts, or a clock step backwards),
/// the result is `prev + 1 ms` so that `updated` strictly advances on
/// every successful mutation.
pub fn strictly_after(prev: &str) -> String {
    let now = now_rfc3339();
    if now.as_str() > prev {
        return now;
    }
    match DateTime::parse_from_rfc3339(prev) {
        Ok(parsed) => (parsed.with_timezone(&Utc) + Duration::milliseconds(1))
            .to_rfc3339_opts(SecondsFormat::Millis, true),
        // Unparseable previous stamp: fall back to the wall clock.
        Err(_) => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_shape() {
        let now = now_rfc3339();
        assert!(now.ends_with('Z'));
        assert!(DateTime::parse_from_rfc3339(&now).is_ok());
        // Millisecond resolution: "....sss Z"
        assert_eq!(now.len(), "2026-08-02T10:30:00.123Z".len());
    }

    #[test]
    fn test_strictly_after_advances() {
        let t0 = now_rfc3339();
        let t1 = strictly_after(&t0);
        assert!(t1.as_str() > t0.as_str());
    }

    #[test]
    fn test_strictly_after_future_stamp_bumps_one_milli() {
        // A stored stamp ahead of the wall clock still advances.
        let future = (Utc::now() + Duration::seconds(60))
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        let next = strictly_after(&future);
        assert!(next.as_str() > future.as_str());
        let gap = DateTime::parse_from_rfc3339(&next).unwrap().timestamp_millis()
            - DateTime::parse_from_rfc3339(&future).unwrap().timestamp_millis();
        assert_eq!(gap, 1);
    }

    #[test]
    fn test_lexicographic_order_matches_time_order() {
        let a = "2026-08-02T10:30:00.123Z";
        let b = "2026-08-02T10:30:00.124Z";
        let c = "2026-08-02T10:30:01.000Z";
        assert!(a < b && b < c);
    }
}
