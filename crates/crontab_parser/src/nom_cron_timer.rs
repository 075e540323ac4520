use nom::{
    branch::alt,
    character::complete::{self, char, space0, space1},
    combinator::{all_consuming, map, opt, verify},
    multi::separated_list1,
    sequence::{delimited, pair, preceded, separated_pair, terminated},
    IResult,
};

use jobqueue_crontab_types::{CronField, CronTimer, CronValue};

/// Attempts to parse a number within the field boundaries
fn cron_number<'a>(field: CronField) -> impl Fn(&'a str) -> IResult<&'a str, u32> {
    let (min, max) = field.boundaries();
    move |input| verify(complete::u32, |v| *v >= min && *v <= max)(input)
}

/// Attempts to parse the `/n` suffix of a step
fn cron_step<'a>(field: CronField) -> impl Fn(&'a str) -> IResult<&'a str, u32> {
    let (_, max) = field.boundaries();
    move |input| preceded(char('/'), verify(complete::u32, |v| *v >= 1 && *v <= max))(input)
}

/// Attempts to parse a range, optionally stepped (`1-5`, `10-40/10`)
fn cron_range<'a>(field: CronField) -> impl Fn(&'a str) -> IResult<&'a str, CronValue> {
    move |input| {
        map(
            pair(
                verify(
                    separated_pair(cron_number(field), char('-'), cron_number(field)),
                    |(low, high)| low <= high,
                ),
                opt(cron_step(field)),
            ),
            |((low, high), step)| match step {
                Some(step) => CronValue::RangeStep(low, high, step),
                None => CronValue::Range(low, high),
            },
        )(input)
    }
}

/// Attempts to parse `*` or `*/n`
fn cron_wildcard<'a>(field: CronField) -> impl Fn(&'a str) -> IResult<&'a str, CronValue> {
    move |input| {
        map(preceded(char('*'), opt(cron_step(field))), |step| match step {
            Some(step) => CronValue::Step(step),
            None => CronValue::Any,
        })(input)
    }
}

/// Attempts to parse a single value of a field
fn cron_value<'a>(field: CronField) -> impl Fn(&'a str) -> IResult<&'a str, CronValue> {
    move |input| {
        alt((
            cron_range(field),
            cron_wildcard(field),
            map(cron_number(field), CronValue::Number),
        ))(input)
    }
}

/// Attempts to parse comma separated values of a field
fn cron_values<'a>(field: CronField) -> impl Fn(&'a str) -> IResult<&'a str, Vec<CronValue>> {
    move |input| separated_list1(char(','), cron_value(field))(input)
}

/// Parse the 5 fields of a cron expression, the whole input must be consumed
pub(crate) fn nom_cron_timer(input: &str) -> IResult<&str, CronTimer> {
    all_consuming(delimited(space0, cron_timer_fields, space0))(input)
}

fn cron_timer_fields(input: &str) -> IResult<&str, CronTimer> {
    let (input, minutes) = terminated(cron_values(CronField::Minute), space1)(input)?;
    let (input, hours) = terminated(cron_values(CronField::Hour), space1)(input)?;
    let (input, days) = terminated(cron_values(CronField::DayOfMonth), space1)(input)?;
    let (input, months) = terminated(cron_values(CronField::Month), space1)(input)?;
    let (input, dows) = cron_values(CronField::DayOfWeek)(input)?;

    Ok((
        input,
        CronTimer {
            minutes,
            hours,
            days,
            months,
            dows,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cron_timer_all_wildcard() {
        assert_eq!(
            Ok(("", CronTimer::default())),
            nom_cron_timer("* * * * *"),
        );
    }

    #[test]
    fn cron_timer_complex_comma_separated_list() {
        assert_eq!(
            Ok((
                "",
                CronTimer {
                    minutes: vec![
                        CronValue::Step(7),
                        CronValue::Number(8),
                        CronValue::Range(30, 35)
                    ],
                    hours: vec![CronValue::RangeStep(8, 18, 2)],
                    days: vec![CronValue::Number(3), CronValue::Step(4)],
                    months: vec![CronValue::Any],
                    dows: vec![CronValue::Range(1, 5), CronValue::Number(0)],
                }
            )),
            nom_cron_timer("*/7,8,30-35 8-18/2 3,*/4 * 1-5,0"),
        );
    }

    #[test]
    fn cron_timer_tolerates_surrounding_and_repeated_spaces() {
        assert!(nom_cron_timer("  0   *  * *  * ").is_ok());
    }

    #[test]
    fn cron_timer_errors() {
        assert!(nom_cron_timer("*/7!,8,30-35 * 3,*/4 * *").is_err());
        assert!(nom_cron_timer("60 * * * *").is_err());
        assert!(nom_cron_timer("* 24 * * *").is_err());
        assert!(nom_cron_timer("* * 0 * *").is_err());
        assert!(nom_cron_timer("* * * 13 *").is_err());
        assert!(nom_cron_timer("* * * * 8").is_err());
        assert!(nom_cron_timer("*/0 * * * *").is_err());
        assert!(nom_cron_timer("10-5 * * * *").is_err());
        assert!(nom_cron_timer("* * * *").is_err());
        assert!(nom_cron_timer("* * * * * *").is_err());
        assert!(nom_cron_timer("* * * * * foo").is_err());
        assert!(nom_cron_timer("").is_err());
    }
}
