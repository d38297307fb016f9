//! Minimal 5-field cron expressions: `minute hour day month weekday`.
//!
//! Each field accepts `*`, `*/N`, exact values, ranges `a-b`, stepped ranges
//! `a-b/N`, and comma-separated lists of those. Weekday runs 0-6 from Sunday;
//! 7 is accepted as Sunday. A time matches when all five fields match. All
//! evaluation is in UTC.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, DurationRound, Timelike, Utc};

/// Upper bound on the minute-by-minute search for the next match.
pub const MAX_SCAN_MINUTES: i64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    #[error("expected 5 fields, found {0}")]
    FieldCount(usize),

    #[error("invalid {field} field '{value}'")]
    Invalid { field: &'static str, value: String },

    #[error("{field} value {value} outside {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
}

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23 };
const DAY: FieldSpec = FieldSpec { name: "day", min: 1, max: 31 };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12 };
const WEEKDAY: FieldSpec = FieldSpec { name: "weekday", min: 0, max: 7 };

/// Set of allowed values for one field, as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field(u64);

impl Field {
    fn contains(&self, value: u32) -> bool {
        self.0 & (1u64 << value) != 0
    }

    fn parse(raw: &str, spec: FieldSpec) -> Result<Self, CronError> {
        let invalid = || CronError::Invalid {
            field: spec.name,
            value: raw.to_string(),
        };
        let number = |s: &str| -> Result<u32, CronError> {
            let v: u32 = s.parse().map_err(|_| invalid())?;
            if v < spec.min || v > spec.max {
                return Err(CronError::OutOfRange {
                    field: spec.name,
                    value: v,
                    min: spec.min,
                    max: spec.max,
                });
            }
            Ok(v)
        };

        let mut bits = 0u64;
        for item in raw.split(',') {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step.parse().map_err(|_| invalid())?;
                    if step == 0 || step > spec.max {
                        return Err(invalid());
                    }
                    (range, step)
                }
                None => (item, 1),
            };

            let (lo, hi) = if range == "*" {
                (spec.min, spec.max)
            } else if let Some((a, b)) = range.split_once('-') {
                let (a, b) = (number(a)?, number(b)?);
                if a > b {
                    return Err(invalid());
                }
                (a, b)
            } else {
                let v = number(range)?;
                // `5/10` means "from 5, every 10".
                if step > 1 { (v, spec.max) } else { (v, v) }
            };

            let mut v = lo;
            while v <= hi {
                bits |= 1u64 << v;
                let Some(next) = v.checked_add(step) else { break };
                v = next;
            }
        }
        Ok(Field(bits))
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: Field,
    hours: Field,
    days: Field,
    months: Field,
    weekdays: Field,
}

impl FromStr for CronExpr {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        let &[minute, hour, day, month, weekday] = fields.as_slice() else {
            return Err(CronError::FieldCount(fields.len()));
        };

        let mut weekdays = Field::parse(weekday, WEEKDAY)?;
        if weekdays.contains(7) {
            weekdays.0 = (weekdays.0 & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: fields.join(" "),
            minutes: Field::parse(minute, MINUTE)?,
            hours: Field::parse(hour, HOUR)?,
            days: Field::parse(day, DAY)?,
            months: Field::parse(month, MONTH)?,
            weekdays,
        })
    }
}

impl std::fmt::Display for CronExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

impl CronExpr {
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.minutes.contains(at.minute())
            && self.hours.contains(at.hour())
            && self.days.contains(at.day())
            && self.months.contains(at.month())
            && self.weekdays.contains(at.weekday().num_days_from_sunday())
    }

    /// First matching minute strictly after `now`, searching at most
    /// [`MAX_SCAN_MINUTES`] minutes ahead.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = now.duration_trunc(Duration::minutes(1)).ok()? + Duration::minutes(1);
        (0..MAX_SCAN_MINUTES)
            .map(|i| start + Duration::minutes(i))
            .find(|t| self.matches(*t))
    }
}

/// Next run for a cron string; malformed or far-off expressions run one
/// minute from now.
pub fn next_cron_run(expression: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    expression
        .parse::<CronExpr>()
        .ok()
        .and_then(|cron| cron.next_after(now))
        .unwrap_or_else(|| now + Duration::minutes(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn parses_supported_syntax() {
        let cron: CronExpr = "0,30 9-17/2 1 */3 1-5".parse().unwrap();
        assert!(cron.matches(at(2024, 1, 1, 9, 30))); // Monday
        assert!(cron.matches(at(2024, 4, 1, 11, 0)));
        assert!(!cron.matches(at(2024, 1, 1, 10, 0)));
        assert!(!cron.matches(at(2024, 2, 1, 9, 0)));
    }

    #[test]
    fn all_fields_must_match() {
        // 13th of the month AND a Friday.
        let cron: CronExpr = "0 0 13 * 5".parse().unwrap();
        assert!(cron.matches(at(2024, 9, 13, 0, 0)));
        assert!(!cron.matches(at(2024, 8, 13, 0, 0))); // Tuesday
        assert!(!cron.matches(at(2024, 9, 6, 0, 0))); // Friday the 6th
    }

    #[test]
    fn weekday_seven_is_sunday() {
        let cron: CronExpr = "0 12 * * 7".parse().unwrap();
        let zero: CronExpr = "0 12 * * 0".parse().unwrap();
        assert!(cron.matches(at(2024, 6, 2, 12, 0))); // Sunday
        for day in 1..=7 {
            let t = at(2024, 6, day, 12, 0);
            assert_eq!(cron.matches(t), zero.matches(t));
        }
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert_eq!("* * * *".parse::<CronExpr>().unwrap_err(), CronError::FieldCount(4));
        assert!(matches!("60 * * * *".parse::<CronExpr>(), Err(CronError::OutOfRange { .. })));
        assert!(matches!("*/0 * * * *".parse::<CronExpr>(), Err(CronError::Invalid { .. })));
        assert!(matches!("5-1 * * * *".parse::<CronExpr>(), Err(CronError::Invalid { .. })));
        assert!(matches!("a * * * *".parse::<CronExpr>(), Err(CronError::Invalid { .. })));
    }

    #[test]
    fn oversized_steps_are_rejected() {
        assert!(matches!("59/4294967295 * * * *".parse::<CronExpr>(), Err(CronError::Invalid { .. })));
        assert!(matches!("*/60 * * * *".parse::<CronExpr>(), Err(CronError::Invalid { .. })));
        assert!(matches!("0 0-23/24 * * *".parse::<CronExpr>(), Err(CronError::Invalid { .. })));

        let now = at(2024, 5, 5, 10, 0);
        assert_eq!(next_cron_run("59/4294967295 * * * *", now), now + Duration::minutes(1));

        // Largest allowed step still yields just the start value.
        let cron: CronExpr = "59/59 * * * *".parse().unwrap();
        assert!(cron.matches(at(2024, 5, 5, 10, 59)));
        assert!(!cron.matches(at(2024, 5, 5, 10, 0)));
    }

    #[test]
    fn next_run_starts_at_next_whole_minute() {
        let now = Utc.with_ymd_and_hms(2024, 5, 5, 10, 14, 59).unwrap();
        assert_eq!(next_cron_run("* * * * *", now), at(2024, 5, 5, 10, 15));
        assert_eq!(next_cron_run("*/15 * * * *", now), at(2024, 5, 5, 10, 15));
        assert_eq!(next_cron_run("0 * * * *", now), at(2024, 5, 5, 11, 0));
    }

    #[test]
    fn unreachable_or_malformed_falls_back_to_one_minute() {
        let now = at(2024, 5, 5, 10, 0);
        // Feb 30th never happens.
        assert_eq!(next_cron_run("0 0 30 2 *", now), now + Duration::minutes(1));
        assert_eq!(next_cron_run("bogus", now), now + Duration::minutes(1));
    }

    proptest! {
        #[test]
        fn every_minute_matches_star(secs in 0i64..4_000_000_000) {
            let t = DateTime::from_timestamp(secs, 0).unwrap();
            let cron: CronExpr = "* * * * *".parse().unwrap();
            prop_assert!(cron.matches(t));
        }

        #[test]
        fn quarter_hours_only(secs in 0i64..4_000_000_000) {
            let t = DateTime::from_timestamp(secs, 0).unwrap();
            let cron: CronExpr = "*/15 * * * *".parse().unwrap();
            prop_assert_eq!(cron.matches(t), t.minute() % 15 == 0);
        }

        #[test]
        fn next_run_is_the_first_later_match(secs in 0i64..4_000_000_000, minute in 0u32..60) {
            let now = DateTime::from_timestamp(secs, 0).unwrap();
            let next = next_cron_run(&format!("{minute} * * * *"), now);
            prop_assert!(next > now);
            prop_assert!(next <= now + Duration::minutes(60));
            prop_assert_eq!(next.second(), 0);
            prop_assert_eq!(next.minute(), minute);
        }
    }
}
