//! Timestamp helpers for the database layer.
//!
//! Timestamps are stored as `INTEGER` Unix epoch milliseconds (UTC).

use chrono::{DateTime, TimeZone, Utc};

#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[inline]
pub fn datetime_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Due times round up to the next millisecond so a stored instance never
/// reads as due before its actual due time.
#[inline]
pub fn due_to_ms(dt: DateTime<Utc>) -> i64 {
    let ms = dt.timestamp_millis();
    if dt.timestamp_subsec_nanos() % 1_000_000 == 0 {
        ms
    } else {
        ms.saturating_add(1)
    }
}

/// Convert epoch milliseconds back to a timestamp, clamping values outside
/// chrono's range.
#[inline]
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or(if ms.is_negative() {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

pub fn opt_ms_to_datetime(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(ms_to_datetime)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_and_clamp() {
        let now = Utc::now();
        assert_eq!(ms_to_datetime(datetime_to_ms(now)).timestamp_millis(), now.timestamp_millis());
        assert_eq!(ms_to_datetime(i64::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(ms_to_datetime(i64::MIN), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn test_due_times_round_up() {
        let exact = Utc.timestamp_millis_opt(4_000_000_000_000).single().unwrap();
        assert_eq!(due_to_ms(exact), 4_000_000_000_000);

        let sub_ms = exact + chrono::TimeDelta::microseconds(900);
        assert_eq!(datetime_to_ms(sub_ms), 4_000_000_000_000);
        assert_eq!(due_to_ms(sub_ms), 4_000_000_000_001);
    }
}
