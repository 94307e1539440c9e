use chrono::{DateTime, Utc};

use crate::store::ScheduleError;

/// Validate a cron expression and return its parsed form.
pub fn validate_cron_expr(expr: &str) -> Result<croner::Cron, ScheduleError> {
    croner::Cron::new(expr)
        .parse()
        .map_err(|e| ScheduleError::CronInvalid(format!("{e}")))
}

/// Validate a timezone string against the IANA database.
pub fn validate_timezone(tz: &str) -> Result<chrono_tz::Tz, ScheduleError> {
    tz.parse::<chrono_tz::Tz>()
        .map_err(|_| ScheduleError::CronInvalid(format!("invalid timezone: {tz}")))
}

/// Compute the next occurrence of `cron` after `after`, evaluated in the
/// given timezone (UTC when none is configured), returned in UTC.
///
/// Returns `None` when the expression has no future occurrence.
#[must_use]
pub fn next_occurrence(
    cron: &croner::Cron,
    timezone: Option<chrono_tz::Tz>,
    after: &DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match timezone {
        Some(tz) => {
            let after_tz = after.with_timezone(&tz);
            cron.find_next_occurrence(&after_tz, false)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }
        None => cron.find_next_occurrence(after, false).ok(),
    }
}

/// Validate `expr` (and optional timezone) and compute the next run from
/// now. Convenience used by create/update/sync paths.
pub fn next_run_from_now(
    expr: &str,
    timezone: Option<&str>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let cron = validate_cron_expr(expr)?;
    let tz = timezone.map(validate_timezone).transpose()?;
    Ok(next_occurrence(&cron, tz, &Utc::now()))
}
