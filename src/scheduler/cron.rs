//! Cron planning: expression validation and timezone-aware fire times.
//!
//! Accepts the classic 5-field form (`minute hour day month weekday`) and the
//! 6-field form with a leading seconds column. Evaluation happens in the
//! job's IANA timezone and results are converted back to UTC, so a schedule
//! like `0 0 * * *` in `Europe/Berlin` fires at local midnight.

use std::str::FromStr;

use ::cron::Schedule as CronSchedule;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::error::{Result, SchedulerError};

const WEEKDAYS: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

/// Reject malformed expressions before they reach storage.
pub fn validate(expr: &str) -> Result<()> {
    parse(expr).map(|_| ())
}

/// Resolve an IANA timezone name. Unknown names are an error, never UTC.
pub fn parse_timezone(timezone: &str) -> Result<Tz> {
    timezone
        .parse::<Tz>()
        .map_err(|_| SchedulerError::UnknownTimezone(timezone.to_string()))
}

/// Validate a full schedule: expression, timezone, and at least one future fire.
pub fn validate_schedule(expr: &str, timezone: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    next_fire_time(expr, timezone, now)
}

/// The first fire time strictly after `after`.
pub fn next_fire_time(expr: &str, timezone: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let tz = parse_timezone(timezone)?;
    let schedule = parse(expr)?;
    let local = after.with_timezone(&tz);
    schedule
        .after(&local)
        .next()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| SchedulerError::NoUpcomingFire(expr.to_string()))
}

/// Every fire time in `(from, until]`, capped at `cap` entries.
pub fn upcoming(
    expr: &str,
    timezone: &str,
    from: DateTime<Utc>,
    until: DateTime<Utc>,
    cap: usize,
) -> Result<Vec<DateTime<Utc>>> {
    let tz = parse_timezone(timezone)?;
    let schedule = parse(expr)?;
    let local = from.with_timezone(&tz);
    Ok(schedule
        .after(&local)
        .map(|t| t.with_timezone(&Utc))
        .take_while(|t| *t <= until)
        .take(cap)
        .collect())
}

fn parse(expr: &str) -> Result<CronSchedule> {
    let normalized = normalize(expr)?;
    CronSchedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Rewrite a 5-field expression into the seconds-first form the evaluator
/// expects. Numeric weekdays use POSIX numbering (0 and 7 are Sunday).
fn normalize(expr: &str) -> Result<String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        5 => {
            let weekday = rewrite_weekday_field(fields[4]);
            Ok(format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], fields[2], fields[3], weekday
            ))
        }
        6 => Ok(fields.join(" ")),
        n => Err(SchedulerError::InvalidCron {
            expr: expr.to_string(),
            reason: format!("expected 5 or 6 fields, found {}", n),
        }),
    }
}

fn rewrite_weekday_field(field: &str) -> String {
    field
        .split(',')
        .map(rewrite_weekday_item)
        .collect::<Vec<_>>()
        .join(",")
}

fn rewrite_weekday_item(item: &str) -> String {
    let (base, step) = match item.split_once('/') {
        Some((b, s)) => (b, Some(s)),
        None => (item, None),
    };

    // Numeric ranges and stepped starts are expanded to a name list, so `7`
    // folds onto Sunday wherever it appears in the walk.
    let numeric_step = match step {
        Some(s) => match s.parse::<usize>() {
            Ok(n) if n > 0 => Some(n),
            _ => return item.to_string(),
        },
        None => None,
    };
    let bounds = match base.split_once('-') {
        Some((start, end)) => weekday_number(start).zip(weekday_number(end)),
        None if numeric_step.is_some() => weekday_number(base).map(|start| (start, 7)),
        None => None,
    };
    if let Some((start, mut end)) = bounds {
        // `5-0` wraps the same way `5-7` does.
        if end == 0 && start > 0 {
            end = 7;
        }
        if start <= end {
            return expand_weekdays(start, end, numeric_step.unwrap_or(1));
        }
    }

    let base = match base.split_once('-') {
        Some((start, end)) => format!("{}-{}", weekday_name(start), weekday_name(end)),
        None => weekday_name(base),
    };
    match step {
        Some(s) => format!("{}/{}", base, s),
        None => base,
    }
}

fn expand_weekdays(start: usize, end: usize, step: usize) -> String {
    let mut days = [false; 7];
    for n in (start..=end).step_by(step) {
        days[n % 7] = true;
    }
    days.iter()
        .enumerate()
        .filter(|(_, on)| **on)
        .map(|(n, _)| WEEKDAYS[n])
        .collect::<Vec<_>>()
        .join(",")
}

fn weekday_number(token: &str) -> Option<usize> {
    token.parse::<usize>().ok().filter(|n| *n < WEEKDAYS.len())
}

fn weekday_name(token: &str) -> String {
    match token.parse::<usize>() {
        Ok(n) if n < WEEKDAYS.len() => WEEKDAYS[n].to_string(),
        _ => token.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike};

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_validate_accepts_five_and_six_fields() {
        assert!(validate("*/5 * * * *").is_ok());
        assert!(validate("30 */5 * * * *").is_ok());
        assert!(validate("0 9 * * MON-FRI").is_ok());
    }

    #[test]
    fn test_validate_rejects_garbage() {
        assert!(matches!(
            validate("every tuesday"),
            Err(SchedulerError::InvalidCron { .. })
        ));
        assert!(matches!(
            validate("61 * * * *"),
            Err(SchedulerError::InvalidCron { .. })
        ));
        assert!(validate("").is_err());
    }

    #[test]
    fn test_unknown_timezone_is_an_error() {
        let err = next_fire_time("* * * * *", "Mars/Olympus_Mons", at(2024, 1, 1, 0, 0)).unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownTimezone(_)));
    }

    #[test]
    fn test_next_fire_is_strictly_after_reference() {
        let on_boundary = at(2024, 3, 1, 12, 5);
        let next = next_fire_time("*/5 * * * *", "UTC", on_boundary).unwrap();
        assert_eq!(next, at(2024, 3, 1, 12, 10));
    }

    #[test]
    fn test_next_fire_is_deterministic() {
        let reference = at(2024, 6, 15, 8, 17);
        for expr in ["*/5 * * * *", "0 3 * * *", "15 10 1 * *", "0 4 * * 0"] {
            let a = next_fire_time(expr, "America/New_York", reference).unwrap();
            let b = next_fire_time(expr, "America/New_York", reference).unwrap();
            assert_eq!(a, b, "{expr}");
            assert!(a > reference, "{expr}");
        }
    }

    #[test]
    fn test_local_midnight_respects_timezone() {
        // 2024-01-10 20:00 UTC is 21:00 in Berlin (CET, UTC+1).
        let next = next_fire_time("0 0 * * *", "Europe/Berlin", at(2024, 1, 10, 20, 0)).unwrap();
        assert_eq!(next, at(2024, 1, 10, 23, 0));

        // Summer time shifts the same local midnight to 22:00 UTC.
        let summer = next_fire_time("0 0 * * *", "Europe/Berlin", at(2024, 7, 10, 12, 0)).unwrap();
        assert_eq!(summer, at(2024, 7, 10, 22, 0));
    }

    #[test]
    fn test_posix_sunday_numbering() {
        // 2024-06-12 is a Wednesday; next Sunday is the 16th.
        let next = next_fire_time("0 4 * * 0", "UTC", at(2024, 6, 12, 0, 0)).unwrap();
        assert_eq!(next.weekday(), chrono::Weekday::Sun);
        assert_eq!(next.day(), 16);
        assert_eq!(next.hour(), 4);

        let seven = next_fire_time("0 4 * * 7", "UTC", at(2024, 6, 12, 0, 0)).unwrap();
        assert_eq!(seven, next);
    }

    #[test]
    fn test_posix_ranges_ending_on_sunday() {
        // 2024-06-10 is a Monday.
        let from = at(2024, 6, 10, 0, 0);
        let until = at(2024, 6, 17, 0, 0);
        let weekdays = |expr: &str| -> Vec<chrono::Weekday> {
            upcoming(expr, "UTC", from, until, 100)
                .unwrap()
                .into_iter()
                .map(|t| t.weekday())
                .collect()
        };

        assert_eq!(weekdays("0 4 * * 0-7").len(), 7);
        assert_eq!(weekdays("0 4 * * 0-6").len(), 7);
        assert_eq!(weekdays("0 4 * * 1-7").len(), 7);

        use chrono::Weekday::{Fri, Mon, Sat, Sun, Wed};
        assert_eq!(weekdays("0 4 * * 1-7/2"), vec![Mon, Wed, Fri, Sun]);
        assert_eq!(weekdays("0 4 * * 5-7"), vec![Fri, Sat, Sun]);
    }

    #[test]
    fn test_weekday_rewrite() {
        assert_eq!(rewrite_weekday_field("1-5"), "MON,TUE,WED,THU,FRI");
        assert_eq!(rewrite_weekday_field("0,6"), "SUN,SAT");
        assert_eq!(rewrite_weekday_field("5-7"), "SUN,FRI,SAT");
        assert_eq!(rewrite_weekday_field("5-0"), "SUN,FRI,SAT");
        assert_eq!(rewrite_weekday_field("0-7"), "SUN,MON,TUE,WED,THU,FRI,SAT");
        assert_eq!(rewrite_weekday_field("1-7/2"), "SUN,MON,WED,FRI");
        assert_eq!(rewrite_weekday_field("1/3"), "SUN,MON,THU");
        assert_eq!(rewrite_weekday_field("*/2"), "*/2");
        assert_eq!(rewrite_weekday_field("MON"), "MON");
        assert_eq!(rewrite_weekday_field("MON-FRI"), "MON-FRI");
    }

    #[test]
    fn test_upcoming_window() {
        let from = at(2024, 1, 1, 0, 0);
        let until = at(2024, 1, 1, 1, 0);
        let runs = upcoming("*/15 * * * *", "UTC", from, until, 100).unwrap();
        assert_eq!(runs.len(), 4);
        assert_eq!(runs[0], at(2024, 1, 1, 0, 15));
        assert_eq!(runs[3], at(2024, 1, 1, 1, 0));

        let capped = upcoming("* * * * *", "UTC", from, until, 10).unwrap();
        assert_eq!(capped.len(), 10);
    }

    #[test]
    fn test_wrong_field_count() {
        let err = validate("* * * *").unwrap_err();
        match err {
            SchedulerError::InvalidCron { reason, .. } => assert!(reason.contains("found 4")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
