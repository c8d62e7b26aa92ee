//! Cron expression evaluation in a named time zone.

use std::fmt;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use croner::Cron;
use thiserror::Error;

use crate::store::JobStoreError;

/// Errors raised while configuring or sweeping schedules.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("unknown time zone '{0}'")]
    UnknownTimezone(String),

    #[error("cron expression '{0}' has no upcoming occurrence")]
    NoOccurrence(String),

    #[error("webhook path '/{path}' is already bound to plan '{plan_id}'")]
    WebhookPathConflict { path: String, plan_id: String },

    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Parsed cron expression bound to an IANA time zone.
///
/// Occurrences are computed in local time, so `0 9 * * *` in
/// `America/New_York` tracks 09:00 across daylight-saving changes.
pub struct CronSchedule {
    expression: String,
    timezone: Tz,
    cron: Cron,
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronSchedule")
            .field("expression", &self.expression)
            .field("timezone", &self.timezone.name())
            .finish()
    }
}

impl CronSchedule {
    pub fn parse(expression: &str, timezone: &str) -> Result<Self, ScheduleError> {
        let timezone_name = timezone.trim();
        let timezone: Tz = timezone_name
            .parse()
            .map_err(|_| ScheduleError::UnknownTimezone(timezone_name.to_string()))?;
        let expression = expression.trim();
        let cron = Cron::new(expression).parse().map_err(|error| ScheduleError::InvalidCron {
            expression: expression.to_string(),
            reason: error.to_string(),
        })?;
        Ok(Self {
            expression: expression.to_string(),
            timezone,
            cron,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// First occurrence strictly after `instant`.
    pub fn next_after(&self, instant: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        let local = instant.with_timezone(&self.timezone);
        self.cron
            .find_next_occurrence(&local, false)
            .map(|next| next.with_timezone(&Utc))
            .map_err(|_| ScheduleError::NoOccurrence(self.expression.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(text: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(text).expect("timestamp").with_timezone(&Utc)
    }

    #[test]
    fn daily_schedule_advances_one_day_at_a_time() {
        let schedule = CronSchedule::parse("0 9 * * *", "UTC").expect("schedule");
        let first = schedule.next_after(at("2024-01-01T08:00:00Z")).expect("next");
        assert_eq!(first, at("2024-01-01T09:00:00Z"));
        let second = schedule.next_after(first).expect("next");
        assert_eq!(second, at("2024-01-02T09:00:00Z"));
    }

    #[test]
    fn occurrences_follow_the_local_time_zone() {
        let schedule = CronSchedule::parse("0 9 * * *", "America/New_York").expect("schedule");
        assert_eq!(schedule.next_after(at("2024-01-15T00:00:00Z")).expect("winter"), at("2024-01-15T14:00:00Z"));
        assert_eq!(schedule.next_after(at("2024-07-15T00:00:00Z")).expect("summer"), at("2024-07-15T13:00:00Z"));
    }

    #[test]
    fn rejects_bad_expressions_and_zones() {
        assert!(matches!(
            CronSchedule::parse("not a cron", "UTC"),
            Err(ScheduleError::InvalidCron { .. })
        ));
        assert!(matches!(
            CronSchedule::parse("0 9 * * *", "Mars/Olympus"),
            Err(ScheduleError::UnknownTimezone(zone)) if zone == "Mars/Olympus"
        ));
    }
}
