use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use cron::Schedule;

/// Parse a seconds-resolution cron expression (`sec min hour dom mon dow`).
pub fn parse(expr: &str) -> Result<Schedule> {
    Schedule::from_str(expr).map_err(|e| anyhow!("invalid cron expression '{}': {}", expr, e))
}

/// First fire time strictly after `after`.
pub fn next_after(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Every fire time in `(from, from + hours]`, for dry-run previews.
pub fn preview(expr: &str, from: DateTime<Utc>, hours: u64) -> Result<Vec<DateTime<Utc>>> {
    let schedule = parse(expr)?;
    let end = from + Duration::hours(hours as i64);
    Ok(schedule.after(&from).take_while(|t| *t <= end).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_hourly_preview() {
        let from = Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 0).unwrap();
        let runs = preview("0 0 * * * *", from, 3).unwrap();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0], Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap());
        assert_eq!(runs[2], Utc.with_ymd_and_hms(2024, 3, 1, 13, 0, 0).unwrap());
    }

    #[test]
    fn test_next_after_is_strict() {
        let schedule = parse("0 */15 * * * *").unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 0).unwrap();
        assert_eq!(
            next_after(&schedule, at),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_rejects_garbage() {
        let err = parse("every tuesday").unwrap_err();
        assert!(err.to_string().contains("invalid cron expression"));
    }
}
