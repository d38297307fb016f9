use std::time::Duration;

use chrono::{DateTime, Utc};

use super::SchedulerError;
use super::cron::CronExpr;

/// When a task runs: a fixed interval or a cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Interval(Duration),
    Cron(CronExpr),
}

impl Schedule {
    /// Parse `<n>ms|s|m|h|d` (e.g. `5m`, `30s`) or a 5-field cron expression.
    pub fn parse(raw: &str) -> Result<Self, SchedulerError> {
        let raw = raw.trim();
        let invalid = |reason: String| SchedulerError::InvalidSchedule {
            schedule: raw.to_string(),
            reason,
        };

        if !raw.contains(char::is_whitespace) {
            let digits = raw.chars().take_while(char::is_ascii_digit).count();
            if digits > 0 {
                let (n, unit) = raw.split_at(digits);
                let n: u64 = n.parse().map_err(|e| invalid(format!("{e}")))?;
                let unit_ms = match unit {
                    "ms" => 1,
                    "s" => 1_000,
                    "m" => 60_000,
                    "h" => 3_600_000,
                    "d" => 86_400_000,
                    other => return Err(invalid(format!("unknown interval unit '{other}'"))),
                };
                let ms = n
                    .checked_mul(unit_ms)
                    .filter(|ms| *ms > 0)
                    .ok_or_else(|| invalid("interval must be positive".into()))?;
                return Ok(Schedule::Interval(Duration::from_millis(ms)));
            }
        }

        raw.parse::<CronExpr>()
            .map(Schedule::Cron)
            .map_err(|e| invalid(e.to_string()))
    }

    pub fn interval_ms(&self) -> Option<u64> {
        match self {
            Schedule::Interval(d) => Some(d.as_millis() as u64),
            Schedule::Cron(_) => None,
        }
    }

    pub fn cron_expression(&self) -> Option<String> {
        match self {
            Schedule::Interval(_) => None,
            Schedule::Cron(c) => Some(c.to_string()),
        }
    }

    pub fn next_run(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Schedule::Interval(d) => chrono::Duration::from_std(*d)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            Schedule::Cron(c) => c
                .next_after(now)
                .unwrap_or_else(|| now + chrono::Duration::minutes(1)),
        }
    }
}
