// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cron expression helpers.
//!
//! Trigger configuration uses five-field cron expressions (minute, hour,
//! day-of-month, month, day-of-week); the underlying `cron` crate wants a
//! seconds field, so expressions are normalized before parsing. Matching
//! is done at minute granularity, in the trigger's timezone when one is
//! configured.

use std::str::FromStr;

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::error::TriggerError;

/// Upper bound on missed occurrences considered during catch-up.
const MAX_MISSED: usize = 1_000;

/// Parse a cron expression, accepting the five-field form.
pub fn parse(expr: &str) -> Result<Schedule, TriggerError> {
    let normalized = match expr.split_whitespace().count() {
        5 => format!("0 {}", expr),
        _ => expr.to_string(),
    };
    Schedule::from_str(&normalized).map_err(|e| TriggerError::InvalidCron {
        expr: expr.to_string(),
        message: e.to_string(),
    })
}

fn parse_tz(name: &str) -> Result<Tz, TriggerError> {
    name.parse::<Tz>()
        .map_err(|_| TriggerError::UnknownTimezone(name.to_string()))
}

fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at - Duration::seconds(at.second() as i64) - Duration::nanoseconds(at.nanosecond() as i64)
}

/// Whether a clock tick falls on an occurrence of the expression.
pub fn matches(expr: &str, timezone: Option<&str>, tick: DateTime<Utc>) -> Result<bool, TriggerError> {
    let schedule = parse(expr)?;
    let minute = truncate_to_minute(tick);
    let just_before = minute - Duration::seconds(1);

    match timezone {
        Some(name) => {
            let tz = parse_tz(name)?;
            let next = schedule.after(&just_before.with_timezone(&tz)).next();
            Ok(next == Some(minute.with_timezone(&tz)))
        }
        None => {
            let next = schedule.after(&just_before).next();
            Ok(next == Some(minute))
        }
    }
}

/// The next `n` occurrence times, in UTC.
pub fn upcoming(
    expr: &str,
    timezone: Option<&str>,
    n: usize,
) -> Result<Vec<DateTime<Utc>>, TriggerError> {
    upcoming_after(expr, timezone, Utc::now(), n)
}

/// The next `n` occurrence times after a reference instant, in UTC.
pub fn upcoming_after(
    expr: &str,
    timezone: Option<&str>,
    after: DateTime<Utc>,
    n: usize,
) -> Result<Vec<DateTime<Utc>>, TriggerError> {
    let schedule = parse(expr)?;
    match timezone {
        Some(name) => {
            let tz = parse_tz(name)?;
            Ok(schedule
                .after(&after.with_timezone(&tz))
                .take(n)
                .map(|t| t.with_timezone(&Utc))
                .collect())
        }
        None => Ok(schedule.after(&after).take(n).collect()),
    }
}

/// Occurrences strictly between `after` and `until`, oldest first.
///
/// Used for schedule catch-up; capped so a stale last-run timestamp on a
/// high-frequency schedule cannot produce an unbounded backlog.
pub fn missed_occurrences(
    expr: &str,
    timezone: Option<&str>,
    after: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<Vec<DateTime<Utc>>, TriggerError> {
    let schedule = parse(expr)?;
    match timezone {
        Some(name) => {
            let tz = parse_tz(name)?;
            Ok(schedule
                .after(&after.with_timezone(&tz))
                .map(|t| t.with_timezone(&Utc))
                .take_while(|t| *t < until)
                .take(MAX_MISSED)
                .collect())
        }
        None => Ok(schedule
            .after(&after)
            .take_while(|t| *t < until)
            .take(MAX_MISSED)
            .collect()),
    }
}

// ============================================================================
// Plain-words description
// ============================================================================

/// Describe a five-field cron expression in words.
///
/// Covers the forms that show up in agent configuration; anything more
/// exotic falls back to quoting the expression.
pub fn describe(expr: &str) -> Result<String, TriggerError> {
    // Validate first so the caller gets a real error for garbage input.
    parse(expr)?;

    let fields: Vec<&str> = expr.split_whitespace().collect();
    let (minute, hour, dom, month, dow) = match fields.as_slice() {
        [m, h, dom, mon, dow] => (*m, *h, *dom, *mon, *dow),
        // Six or seven fields: drop seconds (and year) for the description.
        [_, m, h, dom, mon, dow, ..] => (*m, *h, *dom, *mon, *dow),
        _ => return Ok(format!("cron schedule '{}'", expr)),
    };

    // `daily` marks a specific time of day, which reads better with an
    // explicit "every day" when no day fields narrow it.
    let (description, daily) = match (minute, hour) {
        ("*", "*") => ("every minute".to_string(), false),
        (m, "*") if m.starts_with("*/") => (format!("every {} minutes", &m[2..]), false),
        (m, "*") => (format!("at minute {} of every hour", m), false),
        (m, h) if h.starts_with("*/") => {
            (format!("every {} hours at minute {}", &h[2..], m), false)
        }
        (m, h) => match (m.parse::<u32>(), h.parse::<u32>()) {
            (Ok(minute), Ok(hour)) => (format!("at {:02}:{:02}", hour, minute), true),
            _ => return Ok(format!("cron schedule '{}'", expr)),
        },
    };

    let mut parts = vec![description];

    if dow != "*" {
        if let Some(days) = describe_field(dow, day_name) {
            parts.push(format!("on {}", days));
        }
    } else if dom != "*" {
        parts.push(format!("on day {} of the month", dom));
    }

    if month != "*" {
        if let Some(months) = describe_field(month, month_name) {
            parts.push(format!("in {}", months));
        }
    }

    if daily && dow == "*" && dom == "*" && month == "*" {
        parts.insert(1, "every day".to_string());
    }

    Ok(parts.join(" "))
}

/// Expand a list/range field (`1,3,5` or `1-5`) through a naming function.
fn describe_field(field: &str, name: fn(&str) -> Option<&'static str>) -> Option<String> {
    if let Some((start, end)) = field.split_once('-') {
        return Some(format!("{} through {}", name(start)?, name(end)?));
    }
    let names: Option<Vec<&str>> = field.split(',').map(name).collect();
    let names = names?;
    Some(match names.len() {
        1 => names[0].to_string(),
        2 => format!("{} and {}", names[0], names[1]),
        _ => {
            let (last, rest) = names.split_last()?;
            format!("{} and {}", rest.join(", "), last)
        }
    })
}

fn day_name(field: &str) -> Option<&'static str> {
    Some(match field.to_ascii_uppercase().as_str() {
        "0" | "7" | "SUN" => "Sunday",
        "1" | "MON" => "Monday",
        "2" | "TUE" => "Tuesday",
        "3" | "WED" => "Wednesday",
        "4" | "THU" => "Thursday",
        "5" | "FRI" => "Friday",
        "6" | "SAT" => "Saturday",
        _ => return None,
    })
}

fn month_name(field: &str) -> Option<&'static str> {
    Some(match field.to_ascii_uppercase().as_str() {
        "1" | "JAN" => "January",
        "2" | "FEB" => "February",
        "3" | "MAR" => "March",
        "4" | "APR" => "April",
        "5" | "MAY" => "May",
        "6" | "JUN" => "June",
        "7" | "JUL" => "July",
        "8" | "AUG" => "August",
        "9" | "SEP" => "September",
        "10" | "OCT" => "October",
        "11" | "NOV" => "November",
        "12" | "DEC" => "December",
        _ => return None,
    })
}
