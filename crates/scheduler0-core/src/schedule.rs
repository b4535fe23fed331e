//! Cron parsing and next-fire computation under IANA timezones.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use scheduler0_commons::SchedulerError;

/// Parse an IANA timezone name.
pub fn parse_timezone(timezone: &str) -> Result<Tz, SchedulerError> {
    Tz::from_str(timezone)
        .map_err(|_| SchedulerError::validation(format!("invalid timezone {timezone:?}")))
}

/// Parse a cron expression.
pub fn parse_spec(spec: &str) -> Result<Schedule, SchedulerError> {
    Schedule::from_str(spec)
        .map_err(|e| SchedulerError::validation(format!("invalid cron spec {spec:?}: {e}")))
}

/// Validate `(spec, timezone)` as a pair; used at job creation.
pub fn validate(spec: &str, timezone: &str) -> Result<(), SchedulerError> {
    parse_spec(spec)?;
    parse_timezone(timezone)?;
    Ok(())
}

/// The first fire instant strictly after `after`, evaluated in the job's
/// timezone and returned in UTC. `None` when the schedule is exhausted.
pub fn next_fire(schedule: &Schedule, tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn accepts_standard_expressions() {
        assert!(validate("*/5 * * * * *", "UTC").is_ok());
        assert!(validate("0 0 9 * * Mon-Fri", "America/New_York").is_ok());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_spec("not a cron").is_err());
        assert!(parse_timezone("Mars/Olympus").is_err());
    }

    #[test]
    fn next_fire_is_strictly_after() {
        let schedule = parse_spec("0 * * * * *").unwrap(); // every minute, second 0
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let next = next_fire(&schedule, chrono_tz::UTC, at).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 9, 1, 0).unwrap());
    }

    #[test]
    fn next_fire_respects_timezone() {
        // 09:00 every day in New York; from 12:00 UTC (07:00 EST) the next
        // fire is 14:00 UTC that same day.
        let schedule = parse_spec("0 0 9 * * *").unwrap();
        let tz = parse_timezone("America/New_York").unwrap();
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
        let next = next_fire(&schedule, tz, at).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap());
    }
}
