//! Wall-clock ↔ absolute time conversion.
//!
//! Callers speak in local date/time strings paired with an IANA zone name; the
//! engine stores and compares Unix milliseconds. Everything that crosses that
//! boundary goes through here.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use thiserror::Error;

use crate::limits::{MAX_QUERY_DAYS, MAX_ZONE_NAME_LEN};
use crate::model::{DayKey, Ms};

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATETIME_OUT: &str = "%Y-%m-%d %H:%M";
const CLOCK_OUT: &str = "%H:%M";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    #[error("invalid time zone: {0}")]
    InvalidTimeZone(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("date range too wide: {0} days")]
    RangeTooWide(i64),
}

pub fn parse_zone(name: &str) -> Result<Tz, TimeError> {
    if name.is_empty() || name.len() > MAX_ZONE_NAME_LEN {
        return Err(TimeError::InvalidTimeZone(name.to_string()));
    }
    name.parse::<Tz>()
        .map_err(|_| TimeError::InvalidTimeZone(name.to_string()))
}

pub fn parse_date(s: &str) -> Result<NaiveDate, TimeError> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
        .map_err(|_| TimeError::InvalidTimestamp(format!("bad date '{s}' (expected YYYY-MM-DD)")))
}

/// `HH:MM` or `HH:MM:SS`.
pub fn parse_clock(s: &str) -> Result<NaiveTime, TimeError> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|_| TimeError::InvalidTimestamp(format!("bad time '{s}' (expected HH:MM)")))
}

/// End of a slot declared on `date`. `00:00` and `24:00` mean the midnight
/// that closes the date.
pub fn slot_end(date: NaiveDate, s: &str) -> Result<NaiveDateTime, TimeError> {
    let midnight = matches!(s.trim(), "24:00" | "24:00:00") || parse_clock(s)? == NaiveTime::MIN;
    if !midnight {
        return Ok(date.and_time(parse_clock(s)?));
    }
    date.succ_opt()
        .map(|next| next.and_time(NaiveTime::MIN))
        .ok_or_else(|| TimeError::InvalidTimestamp(format!("no date follows {date}")))
}

/// `YYYY-MM-DD HH:MM[:SS]`, with either a space or `T` between date and time.
pub fn parse_local(s: &str) -> Result<NaiveDateTime, TimeError> {
    let s = s.trim();
    let (date, clock) = s
        .split_once(' ')
        .or_else(|| s.split_once('T'))
        .ok_or_else(|| {
            TimeError::InvalidTimestamp(format!("bad date-time '{s}' (expected YYYY-MM-DD HH:MM)"))
        })?;
    Ok(parse_date(date)?.and_time(parse_clock(clock)?))
}

/// Resolve a wall-clock reading in `tz` to an instant.
///
/// Ambiguous readings (clocks turned back) take the earlier instant. Readings
/// inside a spring-forward gap never happened and are rejected.
pub fn resolve(local: NaiveDateTime, tz: Tz) -> Result<Ms, TimeError> {
    tz.from_local_datetime(&local)
        .earliest()
        .map(|dt| dt.timestamp_millis())
        .ok_or_else(|| {
            TimeError::InvalidTimestamp(format!("{local} does not exist in {}", tz.name()))
        })
}

/// `normalize(localDateTime, zoneName) -> Instant`.
pub fn normalize(local: &str, zone: &str) -> Result<Ms, TimeError> {
    let tz = parse_zone(zone)?;
    resolve(parse_local(local)?, tz)
}

/// `dayKeyOf(localDateTime, zoneName) -> CalendarDay`: the local calendar date
/// the reading falls on, as that date's UTC midnight.
pub fn day_key_of(local: &str, zone: &str) -> Result<DayKey, TimeError> {
    parse_zone(zone)?;
    Ok(day_key(parse_local(local)?.date()))
}

pub fn day_key(date: NaiveDate) -> DayKey {
    date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

pub fn date_of_key(key: DayKey) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp_millis(key).map(|dt| dt.date_naive())
}

pub fn format_date(key: DayKey) -> String {
    match date_of_key(key) {
        Some(date) => date.format(DATE_FORMAT).to_string(),
        None => key.to_string(),
    }
}

fn to_zone(ms: Ms, tz: Tz) -> Option<DateTime<Tz>> {
    DateTime::<Utc>::from_timestamp_millis(ms).map(|dt| dt.with_timezone(&tz))
}

/// `YYYY-MM-DD HH:MM` as seen in `tz`.
pub fn format_local(ms: Ms, tz: Tz) -> String {
    match to_zone(ms, tz) {
        Some(dt) => dt.format(DATETIME_OUT).to_string(),
        None => ms.to_string(),
    }
}

/// `HH:MM` when the instant falls on `date` in `tz`, otherwise the full
/// `YYYY-MM-DD HH:MM` so a slot read back in another zone stays unambiguous.
pub fn format_clock_on(ms: Ms, tz: Tz, date: Option<NaiveDate>) -> String {
    match to_zone(ms, tz) {
        Some(dt) if Some(dt.date_naive()) == date => dt.format(CLOCK_OUT).to_string(),
        Some(dt) => dt.format(DATETIME_OUT).to_string(),
        None => ms.to_string(),
    }
}

/// Day keys for every date in `[from, to]`.
pub fn day_range(from: NaiveDate, to: NaiveDate) -> Result<Vec<DayKey>, TimeError> {
    if to < from {
        return Err(TimeError::InvalidTimestamp(format!(
            "range end {to} is before start {from}"
        )));
    }
    let days = (to - from).num_days() + 1;
    if days > MAX_QUERY_DAYS {
        return Err(TimeError::RangeTooWide(days));
    }
    Ok(from
        .iter_days()
        .take(days as usize)
        .map(day_key)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const H: Ms = 3_600_000;

    #[test]
    fn parse_known_and_unknown_zones() {
        assert!(parse_zone("America/New_York").is_ok());
        assert!(parse_zone("UTC").is_ok());
        assert_eq!(
            parse_zone("Mars/Olympus_Mons"),
            Err(TimeError::InvalidTimeZone("Mars/Olympus_Mons".into()))
        );
        assert!(parse_zone("").is_err());
    }

    #[test]
    fn parse_local_accepts_space_and_t() {
        let a = parse_local("2024-03-10 09:30").unwrap();
        let b = parse_local("2024-03-10T09:30:00").unwrap();
        assert_eq!(a, b);
        assert!(matches!(parse_local("2024-03-10"), Err(TimeError::InvalidTimestamp(_))));
        assert!(matches!(parse_local("yesterday 9am"), Err(TimeError::InvalidTimestamp(_))));
        assert!(matches!(parse_local("2024-02-30 10:00"), Err(TimeError::InvalidTimestamp(_))));
    }

    #[test]
    fn slot_end_midnight_closes_the_date() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        let next = NaiveDate::from_ymd_opt(2024, 6, 11).unwrap().and_time(NaiveTime::MIN);
        assert_eq!(slot_end(date, "00:00").unwrap(), next);
        assert_eq!(slot_end(date, "24:00").unwrap(), next);
        assert_eq!(slot_end(date, " 24:00:00 ").unwrap(), next);
        assert_eq!(
            slot_end(date, "17:30").unwrap(),
            date.and_time(NaiveTime::from_hms_opt(17, 30, 0).unwrap())
        );
        assert!(slot_end(date, "24:30").is_err());
    }

    #[test]
    fn normalize_utc() {
        let ms = normalize("2024-01-01 10:00", "UTC").unwrap();
        assert_eq!(ms, day_key(parse_date("2024-01-01").unwrap()) + 10 * H);
    }

    #[test]
    fn normalize_applies_dst_for_the_given_date() {
        // New York is UTC-5 in January and UTC-4 in July.
        let winter = normalize("2024-01-15 09:00", "America/New_York").unwrap();
        let summer = normalize("2024-07-15 09:00", "America/New_York").unwrap();
        assert_eq!(winter, day_key(parse_date("2024-01-15").unwrap()) + 14 * H);
        assert_eq!(summer, day_key(parse_date("2024-07-15").unwrap()) + 13 * H);
    }

    #[test]
    fn spring_forward_gap_is_rejected() {
        // 2024-03-10 02:30 never happened in New York.
        let result = normalize("2024-03-10 02:30", "America/New_York");
        assert!(matches!(result, Err(TimeError::InvalidTimestamp(_))));
    }

    #[test]
    fn fall_back_takes_earlier_instant() {
        // 2024-11-03 01:30 happens twice in New York; first at UTC-4.
        let ms = normalize("2024-11-03 01:30", "America/New_York").unwrap();
        assert_eq!(ms, day_key(parse_date("2024-11-03").unwrap()) + 5 * H + 30 * 60_000);
    }

    #[test]
    fn day_key_is_local_date() {
        // Late evening in Los Angeles is already tomorrow in UTC; the key stays local.
        let key = day_key_of("2024-05-01 23:00", "America/Los_Angeles").unwrap();
        assert_eq!(format_date(key), "2024-05-01");
        assert!(day_key_of("2024-05-01 23:00", "Nowhere/Land").is_err());
    }

    #[test]
    fn format_round_trip() {
        let tz = parse_zone("Europe/Berlin").unwrap();
        let ms = normalize("2024-03-31 10:15", "Europe/Berlin").unwrap();
        assert_eq!(format_local(ms, tz), "2024-03-31 10:15");
        let date = parse_date("2024-03-31").ok();
        assert_eq!(format_clock_on(ms, tz, date), "10:15");
        let other = parse_date("2024-03-30").ok();
        assert_eq!(format_clock_on(ms, tz, other), "2024-03-31 10:15");
    }

    #[test]
    fn day_range_inclusive_and_capped() {
        let from = parse_date("2024-02-28").unwrap();
        let to = parse_date("2024-03-01").unwrap();
        let keys = day_range(from, to).unwrap();
        assert_eq!(keys.len(), 3); // leap year
        assert_eq!(format_date(keys[1]), "2024-02-29");

        assert!(day_range(to, from).is_err());
        let far = parse_date("2026-01-01").unwrap();
        assert!(matches!(day_range(from, far), Err(TimeError::RangeTooWide(_))));
    }

    fn arb_zone() -> impl Strategy<Value = &'static str> {
        prop_oneof![
            Just("UTC"),
            Just("America/New_York"),
            Just("Europe/London"),
            Just("Australia/Sydney"),
            Just("Asia/Kolkata"),
        ]
    }

    proptest! {
        #[test]
        fn local_round_trip(
            zone in arb_zone(),
            y in 2024i32..=2026,
            m in 1u32..=12,
            d in 1u32..=28,
            h in 0u32..=23,
            min in 0u32..=59,
        ) {
            let local = format!("{y:04}-{m:02}-{d:02} {h:02}:{min:02}");
            let tz = parse_zone(zone).unwrap();
            match normalize(&local, zone) {
                Ok(ms) => {
                    // Ambiguous readings resolve to the earlier instant, which
                    // formats back to the same wall-clock text.
                    prop_assert_eq!(format_local(ms, tz), local);
                }
                Err(TimeError::InvalidTimestamp(_)) => {} // DST gap
                Err(e) => prop_assert!(false, "unexpected error {e}"),
            }
        }
    }
}
