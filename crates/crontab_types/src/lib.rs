use chrono::prelude::*;
use chrono::{Duration, NaiveDate};
use getset::Getters;

/// How far ahead [`CronTimer::next_run_after`] looks before giving up (covers leap days)
const NEXT_RUN_HORIZON_DAYS: i64 = 366 * 5;

/// One of the 5 fields of a cron expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronField {
    Minute,
    Hour,
    DayOfMonth,
    Month,
    /// 0 and 7 both mean sunday
    DayOfWeek,
}

impl CronField {
    /// Inclusive bounds accepted for the field
    pub fn boundaries(&self) -> (u32, u32) {
        match self {
            CronField::Minute => (0, 59),
            CronField::Hour => (0, 23),
            CronField::DayOfMonth => (1, 31),
            CronField::Month => (1, 12),
            CronField::DayOfWeek => (0, 7),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CronField::Minute => "minute",
            CronField::Hour => "hour",
            CronField::DayOfMonth => "day of month",
            CronField::Month => "month",
            CronField::DayOfWeek => "day of week",
        }
    }
}

/// A cron value can be a number, a range, a step, a stepped range or any value.
/// When specifying numbers they should be valid for the field (e.g. 0-59 for minutes, 0-23 for hours, etc.)
#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub enum CronValue {
    /// `5`
    Number(u32),
    /// `1-5`
    Range(u32, u32),
    /// `*/15`
    Step(u32),
    /// `10-40/10`
    RangeStep(u32, u32, u32),
    /// `*`
    #[default]
    Any,
}

impl CronValue {
    /// Check if `value` matches this cron value.
    /// `field_min` is the first value of the field, where `*/n` steps start counting from.
    pub fn matches(&self, value: u32, field_min: u32) -> bool {
        match self {
            CronValue::Number(n) => value == *n,
            CronValue::Range(low, high) => value >= *low && value <= *high,
            CronValue::Step(n) => *n > 0 && value >= field_min && (value - field_min) % n == 0,
            CronValue::RangeStep(low, high, n) => {
                *n > 0 && value >= *low && value <= *high && (value - low) % n == 0
            }
            CronValue::Any => true,
        }
    }
}

/// A cron timer is a set of cron values for each field (minutes, hours, days, months, days of week).
/// A field matches when any of its values matches, the timer matches when all 5 fields match.
#[derive(Debug, PartialEq, Eq, Clone, Getters)]
#[getset(get = "pub")]
pub struct CronTimer {
    pub minutes: Vec<CronValue>,
    pub hours: Vec<CronValue>,
    pub days: Vec<CronValue>,
    pub months: Vec<CronValue>,
    /// Days of week
    pub dows: Vec<CronValue>,
}

impl Default for CronTimer {
    fn default() -> Self {
        Self {
            minutes: vec![CronValue::default()],
            hours: vec![CronValue::default()],
            days: vec![CronValue::default()],
            months: vec![CronValue::default()],
            dows: vec![CronValue::default()],
        }
    }
}

fn any_match(values: &[CronValue], value: u32, field_min: u32) -> bool {
    values.iter().any(|v| v.matches(value, field_min))
}

impl CronTimer {
    /// Check if the timer should run at specified date. Seconds are ignored.
    ///
    /// ```rust
    /// use jobqueue_crontab_types::{CronValue, CronTimer};
    ///
    /// let timer = CronTimer {
    ///     minutes: vec![CronValue::Number(30)],
    ///     hours: vec![CronValue::Range(8, 10)],
    ///     days: vec![CronValue::Step(4)],
    ///     ..Default::default()
    /// };
    /// assert!(timer.should_run_at(&"2012-12-17T08:30:12".parse().unwrap()));
    /// assert!(timer.should_run_at(&"2015-02-05T09:30:00".parse().unwrap()));
    ///
    /// assert!(!timer.should_run_at(&"2012-12-17T11:30:59".parse().unwrap()));
    /// assert!(!timer.should_run_at(&"2015-02-05T09:31:00".parse().unwrap()));
    /// ```
    pub fn should_run_at(&self, at: &NaiveDateTime) -> bool {
        any_match(&self.minutes, at.minute(), 0)
            && any_match(&self.hours, at.hour(), 0)
            && self.matches_date(at.date())
    }

    fn matches_date(&self, date: NaiveDate) -> bool {
        let dow = date.weekday().num_days_from_sunday();
        any_match(&self.days, date.day(), 1)
            && any_match(&self.months, date.month(), 1)
            && (any_match(&self.dows, dow, 0) || (dow == 0 && any_match(&self.dows, 7, 0)))
    }

    /// Exact next minute strictly after `after` at which the timer matches
    ///
    /// # Returns
    ///
    /// `None` when nothing matches within the next 5 years (e.g. `0 0 31 2 *`).
    ///
    /// ```rust
    /// use jobqueue_crontab_types::{CronValue, CronTimer};
    ///
    /// let hourly = CronTimer {
    ///     minutes: vec![CronValue::Number(0)],
    ///     ..Default::default()
    /// };
    /// let next = hourly.next_run_after(&"2024-03-10T10:15:42".parse().unwrap());
    /// assert_eq!(next, Some("2024-03-10T11:00:00".parse().unwrap()));
    /// ```
    pub fn next_run_after(&self, after: &NaiveDateTime) -> Option<NaiveDateTime> {
        let mut candidate = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let horizon = *after + Duration::days(NEXT_RUN_HORIZON_DAYS);

        while candidate <= horizon {
            if !any_match(&self.months, candidate.month(), 1) {
                let (year, month) = match candidate.month() {
                    12 => (candidate.year() + 1, 1),
                    m => (candidate.year(), m + 1),
                };
                candidate = NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.matches_date(candidate.date()) {
                candidate = candidate.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !any_match(&self.hours, candidate.hour(), 0) {
                candidate = candidate.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !any_match(&self.minutes, candidate.minute(), 0) {
                candidate += Duration::minutes(1);
                continue;
            }
            return Some(candidate);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    pub fn cron_timer_should_run_at() -> Result<()> {
        let timer = CronTimer {
            minutes: vec![CronValue::Number(30)],
            hours: vec![CronValue::Range(8, 10)],
            days: vec![CronValue::Step(4)],
            ..Default::default()
        };

        assert!(timer.should_run_at(&"2012-12-17T08:30:12".parse()?));
        assert!(timer.should_run_at(&"2015-02-05T09:30:00".parse()?));
        assert!(timer.should_run_at(&"1998-10-13T10:30:59".parse()?));

        assert!(!timer.should_run_at(&"2012-12-17T11:30:59".parse()?));
        assert!(!timer.should_run_at(&"2015-02-05T09:31:00".parse()?));
        assert!(!timer.should_run_at(&"2012-12-13T08:29:12".parse()?));
        assert!(!timer.should_run_at(&"1998-10-04T10:30:59".parse()?));

        Ok(())
    }

    #[test]
    pub fn cron_value_matches() {
        assert!(CronValue::Number(30).matches(30, 0));
        assert!(CronValue::Range(8, 10).matches(8, 0));
        assert!(!CronValue::Range(8, 10).matches(7, 0));
        assert!(CronValue::Step(4).matches(5, 1));
        assert!(!CronValue::Step(4).matches(4, 1));
        assert!(CronValue::Step(15).matches(45, 0));
        assert!(!CronValue::Step(15).matches(50, 0));
        assert!(CronValue::Step(1).matches(17, 1));
        assert!(!CronValue::Step(0).matches(0, 0));
        assert!(CronValue::RangeStep(10, 40, 10).matches(30, 0));
        assert!(!CronValue::RangeStep(10, 40, 10).matches(50, 0));
        assert!(!CronValue::RangeStep(10, 40, 10).matches(35, 0));
        assert!(CronValue::Any.matches(16, 0));
    }

    #[test]
    pub fn sunday_matches_zero_and_seven() -> Result<()> {
        // 2024-03-10 is a sunday
        let sunday_zero = CronTimer {
            dows: vec![CronValue::Number(0)],
            ..Default::default()
        };
        let sunday_seven = CronTimer {
            dows: vec![CronValue::Range(5, 7)],
            ..Default::default()
        };
        assert!(sunday_zero.should_run_at(&"2024-03-10T12:00:00".parse()?));
        assert!(sunday_seven.should_run_at(&"2024-03-10T12:00:00".parse()?));
        assert!(!sunday_zero.should_run_at(&"2024-03-11T12:00:00".parse()?));
        Ok(())
    }

    #[test]
    pub fn next_run_after_is_exact() -> Result<()> {
        let every_minute = CronTimer::default();
        assert_eq!(
            every_minute.next_run_after(&"2024-03-10T10:15:42".parse()?),
            Some("2024-03-10T10:16:00".parse()?)
        );

        let yearly = CronTimer {
            minutes: vec![CronValue::Number(0)],
            hours: vec![CronValue::Number(0)],
            days: vec![CronValue::Number(1)],
            months: vec![CronValue::Number(1)],
            ..Default::default()
        };
        assert_eq!(
            yearly.next_run_after(&"2024-03-10T10:15:00".parse()?),
            Some("2025-01-01T00:00:00".parse()?)
        );

        let weekly = CronTimer {
            minutes: vec![CronValue::Number(0)],
            hours: vec![CronValue::Number(0)],
            dows: vec![CronValue::Number(0)],
            ..Default::default()
        };
        assert_eq!(
            weekly.next_run_after(&"2024-03-10T00:00:00".parse()?),
            Some("2024-03-17T00:00:00".parse()?)
        );

        let leap_day = CronTimer {
            minutes: vec![CronValue::Number(0)],
            hours: vec![CronValue::Number(12)],
            days: vec![CronValue::Number(29)],
            months: vec![CronValue::Number(2)],
            ..Default::default()
        };
        assert_eq!(
            leap_day.next_run_after(&"2024-03-01T00:00:00".parse()?),
            Some("2028-02-29T12:00:00".parse()?)
        );
        Ok(())
    }

    #[test]
    pub fn next_run_after_impossible_date() -> Result<()> {
        let never = CronTimer {
            days: vec![CronValue::Number(31)],
            months: vec![CronValue::Number(2)],
            ..Default::default()
        };
        assert_eq!(never.next_run_after(&"2024-03-01T00:00:00".parse()?), None);
        Ok(())
    }
}
