use std::{fmt::Display, str::FromStr};

use chrono::{NaiveDateTime, Timelike};
use jobqueue_crontab_types::CronTimer;
pub use nom::error::ErrorKind;
use nom_cron_timer::nom_cron_timer;
use thiserror::Error;
use tracing::warn;

mod nom_cron_timer;

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum CronParseError {
    #[error("Unknown cron alias `{0}`")]
    UnknownAlias(String),
    #[error("Malformed cron expression `{input}` : {msg}")]
    Malformed {
        input: String,
        msg: String,
        error_kind: ErrorKind,
    },
}

impl CronParseError {
    fn malformed(input: &str, e: nom::Err<nom::error::Error<&str>>) -> Self {
        let msg = format!("{e:?}");
        let error_kind = match e {
            // Should not happen (only for streams)
            nom::Err::Incomplete(_) => ErrorKind::Fail,
            nom::Err::Error(e) | nom::Err::Failure(e) => e.code,
        };
        CronParseError::Malformed {
            input: input.to_string(),
            msg,
            error_kind,
        }
    }
}

/// Named schedules usable in place of a 5-field expression (`Every.FiveMinutes`, `Every.Hour`, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Every {
    Minute,
    FiveMinutes,
    TenMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl Every {
    /// Canonical 5-field form
    pub fn as_cron(&self) -> &'static str {
        match self {
            Every::Minute => "* * * * *",
            Every::FiveMinutes => "*/5 * * * *",
            Every::TenMinutes => "*/10 * * * *",
            Every::FifteenMinutes => "*/15 * * * *",
            Every::ThirtyMinutes => "*/30 * * * *",
            Every::Hour => "0 * * * *",
            Every::Day => "0 0 * * *",
            Every::Week => "0 0 * * 0",
            Every::Month => "0 0 1 * *",
            Every::Year => "0 0 1 1 *",
        }
    }

    fn from_unit(unit: &str) -> Option<Self> {
        let every = match unit {
            "minute" => Every::Minute,
            "fiveminutes" => Every::FiveMinutes,
            "tenminutes" => Every::TenMinutes,
            "fifteenminutes" => Every::FifteenMinutes,
            "thirtyminutes" => Every::ThirtyMinutes,
            "hour" => Every::Hour,
            "day" => Every::Day,
            "week" => Every::Week,
            "month" => Every::Month,
            "year" => Every::Year,
            _ => return None,
        };
        Some(every)
    }
}

impl Display for Every {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_cron())
    }
}

/// Expands aliases to their canonical 5-field form, case-insensitively.
///
/// * `@yearly` / `@annually` - `0 0 1 1 *`
/// * `@monthly` - `0 0 1 * *`
/// * `@weekly` - `0 0 * * 0`
/// * `@daily` / `@midnight` - `0 0 * * *`
/// * `@hourly` - `0 * * * *`
/// * `Every.Minute`, `Every.FiveMinutes`, `Every.TenMinutes`, `Every.FifteenMinutes`,
///   `Every.ThirtyMinutes`, `Every.Hour`, `Every.Day`, `Every.Week`, `Every.Month`, `Every.Year`
///
/// Anything that is not an alias is returned trimmed, it is not validated here.
///
/// ```rust
/// use jobqueue_crontab_parser::expand_alias;
///
/// assert_eq!(expand_alias("@daily").unwrap(), "0 0 * * *");
/// assert_eq!(expand_alias("@HOURLY").unwrap(), "0 * * * *");
/// assert_eq!(expand_alias("Every.FiveMinutes").unwrap(), "*/5 * * * *");
/// assert_eq!(expand_alias(" 5 4 * * * ").unwrap(), "5 4 * * *");
/// assert!(expand_alias("@fortnightly").is_err());
/// ```
pub fn expand_alias(expression: &str) -> Result<String, CronParseError> {
    let trimmed = expression.trim();
    let lowercase = trimmed.to_ascii_lowercase();

    let expanded = match lowercase.as_str() {
        "@yearly" | "@annually" => "0 0 1 1 *",
        "@monthly" => "0 0 1 * *",
        "@weekly" => "0 0 * * 0",
        "@daily" | "@midnight" => "0 0 * * *",
        "@hourly" => "0 * * * *",
        alias if alias.starts_with('@') => {
            return Err(CronParseError::UnknownAlias(trimmed.to_string()))
        }
        alias => match alias.strip_prefix("every.") {
            Some(unit) => Every::from_unit(unit)
                .ok_or_else(|| CronParseError::UnknownAlias(trimmed.to_string()))?
                .as_cron(),
            None => return Ok(trimmed.to_string()),
        },
    };

    Ok(expanded.to_string())
}

/// Parse a cron expression or alias into a timer
///
/// Supported syntax per field: `*`, exact numbers, comma lists, `a-b` ranges,
/// `*/n` and `a-b/n` steps.
///
/// ```cron
/// ┌───────────── minute (0 - 59)
/// │ ┌───────────── hour (0 - 23)
/// │ │ ┌───────────── day of the month (1 - 31)
/// │ │ │ ┌───────────── month (1 - 12)
/// │ │ │ │ ┌───────────── day of the week (0 - 6, sunday is 0 or 7)
/// │ │ │ │ │
/// * * * * *
/// ```
pub fn parse_cron(expression: &str) -> Result<CronTimer, CronParseError> {
    let canonical = expand_alias(expression)?;
    let (_, timer) =
        nom_cron_timer(&canonical).map_err(|e| CronParseError::malformed(&canonical, e))?;
    Ok(timer)
}

/// A parsed schedule remembering the expression it was written with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    canonical: String,
    timer: CronTimer,
}

impl FromStr for CronSchedule {
    type Err = CronParseError;

    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        let canonical = expand_alias(expression)?;
        let (_, timer) =
            nom_cron_timer(&canonical).map_err(|e| CronParseError::malformed(&canonical, e))?;
        Ok(CronSchedule {
            expression: expression.trim().to_string(),
            canonical,
            timer,
        })
    }
}

impl CronSchedule {
    /// Expression as written, e.g. `@hourly`
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Expanded 5-field form, e.g. `0 * * * *`
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    pub fn timer(&self) -> &CronTimer {
        &self.timer
    }

    /// Whether the schedule fires at `now`, given when it last ran.
    /// Never fires twice within the same minute.
    pub fn should_run(&self, now: &NaiveDateTime, last_run: Option<&NaiveDateTime>) -> bool {
        if let Some(last_run) = last_run {
            if same_minute(now, last_run) {
                return false;
            }
        }
        self.timer.should_run_at(now)
    }

    /// Next fire time strictly after `after`
    pub fn next_run_after(&self, after: &NaiveDateTime) -> Option<NaiveDateTime> {
        self.timer.next_run_after(after)
    }
}

fn same_minute(a: &NaiveDateTime, b: &NaiveDateTime) -> bool {
    a.date() == b.date() && a.hour() == b.hour() && a.minute() == b.minute()
}

/// Evaluates `expression` (5 fields or alias) at `now`.
///
/// An invalid expression never matches and is logged as a warning.
///
/// # Arguments
///
/// * `expression` - Cron expression or alias.
/// * `now` - Point in time to evaluate, seconds are ignored.
/// * `last_run` - When the schedule last fired, if ever. Sharing the minute of `now` prevents firing.
///
/// ```rust
/// use jobqueue_crontab_parser::should_run;
///
/// let now = "2024-03-10T11:00:20".parse().unwrap();
/// let earlier = "2024-03-10T11:00:05".parse().unwrap();
/// assert!(should_run("@hourly", &now, None));
/// assert!(!should_run("@hourly", &now, Some(&earlier)));
/// assert!(!should_run("not a cron", &now, None));
/// ```
pub fn should_run(expression: &str, now: &NaiveDateTime, last_run: Option<&NaiveDateTime>) -> bool {
    match expression.parse::<CronSchedule>() {
        Ok(schedule) => schedule.should_run(now, last_run),
        Err(e) => {
            warn!(expression, error = %e, "Invalid cron expression, it will never run");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use chrono::Duration;

    #[test]
    fn aliases_expand_to_canonical_form() -> Result<()> {
        assert_eq!(expand_alias("@daily")?, "0 0 * * *");
        assert_eq!(expand_alias("@midnight")?, "0 0 * * *");
        assert_eq!(expand_alias("@hourly")?, "0 * * * *");
        assert_eq!(expand_alias("@yearly")?, "0 0 1 1 *");
        assert_eq!(expand_alias("@annually")?, "0 0 1 1 *");
        assert_eq!(expand_alias("@monthly")?, "0 0 1 * *");
        assert_eq!(expand_alias("@weekly")?, "0 0 * * 0");
        assert_eq!(expand_alias("@Weekly")?, "0 0 * * 0");
        assert_eq!(expand_alias("Every.Minute")?, "* * * * *");
        assert_eq!(expand_alias("every.tenminutes")?, "*/10 * * * *");
        assert_eq!(expand_alias("Every.FifteenMinutes")?, "*/15 * * * *");
        assert_eq!(expand_alias("Every.ThirtyMinutes")?, "*/30 * * * *");
        assert_eq!(expand_alias("Every.Hour")?, "0 * * * *");
        assert_eq!(expand_alias("Every.Day")?, "0 0 * * *");
        assert_eq!(expand_alias("Every.Week")?, "0 0 * * 0");
        assert_eq!(expand_alias("Every.Month")?, "0 0 1 * *");
        assert_eq!(expand_alias("Every.Year")?, "0 0 1 1 *");
        Ok(())
    }

    #[test]
    fn unknown_aliases_are_errors() {
        assert_eq!(
            expand_alias("@reboot"),
            Err(CronParseError::UnknownAlias("@reboot".to_string()))
        );
        assert_eq!(
            expand_alias("Every.Fortnight"),
            Err(CronParseError::UnknownAlias("Every.Fortnight".to_string()))
        );
    }

    #[test]
    fn every_enum_matches_aliases() -> Result<()> {
        assert_eq!(Every::FiveMinutes.to_string(), expand_alias("Every.FiveMinutes")?);
        assert_eq!(Every::Week.as_cron(), expand_alias("@weekly")?);
        Ok(())
    }

    #[test]
    fn every_minute_always_runs_without_last_run() -> Result<()> {
        let mut now: NaiveDateTime = "2023-12-31T23:00:00".parse()?;
        for _ in 0..3000 {
            assert!(should_run("* * * * *", &now, None));
            now += Duration::seconds(97);
        }
        Ok(())
    }

    #[test]
    fn never_runs_twice_in_same_minute() -> Result<()> {
        let now: NaiveDateTime = "2024-01-01T00:00:45".parse()?;
        let last_run: NaiveDateTime = "2024-01-01T00:00:01".parse()?;
        assert!(!should_run("* * * * *", &now, Some(&last_run)));
        assert!(!should_run("@yearly", &now, Some(&last_run)));

        let previous_minute: NaiveDateTime = "2023-12-31T23:59:59".parse()?;
        assert!(should_run("* * * * *", &now, Some(&previous_minute)));
        Ok(())
    }

    #[test]
    fn same_clock_minute_on_another_day_is_not_blocked() -> Result<()> {
        let now: NaiveDateTime = "2024-02-01T00:00:10".parse()?;
        let last_month: NaiveDateTime = "2024-01-01T00:00:10".parse()?;
        assert!(should_run("@monthly", &now, Some(&last_month)));
        Ok(())
    }

    #[test]
    fn malformed_expressions_never_match() -> Result<()> {
        let now: NaiveDateTime = "2024-01-01T00:00:00".parse()?;
        assert!(!should_run("* * *", &now, None));
        assert!(!should_run("@sometimes", &now, None));
        assert!(!should_run("Every.Decade", &now, None));
        assert!(matches!(
            parse_cron("61 * * * *"),
            Err(CronParseError::Malformed { .. })
        ));
        Ok(())
    }

    #[test]
    fn schedule_keeps_expression_and_canonical() -> Result<()> {
        let schedule: CronSchedule = "@Hourly".parse()?;
        assert_eq!(schedule.expression(), "@Hourly");
        assert_eq!(schedule.canonical(), "0 * * * *");
        assert_eq!(
            schedule.next_run_after(&"2024-05-05T10:59:30".parse()?),
            Some("2024-05-05T11:00:00".parse()?)
        );
        Ok(())
    }
}
