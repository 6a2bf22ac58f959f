//! Preference resolver: turns a user's cadence settings into concrete
//! publish instants.

use chrono::{DateTime, Datelike, Days, FixedOffset, NaiveTime, Offset, TimeZone, Utc, Weekday};
use tracing::warn;

use crate::error::{CadenceError, Result};
use crate::types::SchedulingPreference;

/// How far ahead the resolver looks for matching weekdays
pub const LOOKAHEAD_DAYS: u64 = 14;

/// Next `posts_per_week` publish instants strictly after `from`
///
/// Walks forward day by day from `from`'s local date for up to two weeks,
/// placing `posting_time` on every configured weekday. Returns fewer
/// instants than requested when the window runs out.
pub fn next_run_times<Tz: TimeZone>(
    posting_days: &[Weekday],
    posting_time: NaiveTime,
    posts_per_week: u32,
    from: &DateTime<Tz>,
) -> Vec<DateTime<Utc>> {
    let target = posts_per_week as usize;
    let mut times = Vec::with_capacity(target);
    if target == 0 || posting_days.is_empty() {
        return times;
    }

    let tz = from.timezone();
    let start = from.date_naive();

    for offset in 0..LOOKAHEAD_DAYS {
        let Some(date) = start.checked_add_days(Days::new(offset)) else {
            break;
        };
        if !posting_days.contains(&date.weekday()) {
            continue;
        }

        // Local times skipped by a DST gap have no instant; skip the day.
        let Some(candidate) = tz
            .from_local_datetime(&date.and_time(posting_time))
            .earliest()
        else {
            continue;
        };

        if candidate > *from {
            times.push(candidate.with_timezone(&Utc));
            if times.len() == target {
                break;
            }
        }
    }

    times
}

/// [`next_run_times`] evaluated in the user's configured timezone
pub fn next_run_times_for(prefs: &SchedulingPreference, from: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    let tz = resolve_timezone(&prefs.timezone);
    next_run_times(
        &prefs.posting_days,
        prefs.posting_time,
        prefs.posts_per_week,
        &from.with_timezone(&tz),
    )
}

/// Interpret a stored timezone
///
/// Accepts `UTC`/`Z`/empty and fixed offsets (`+05:30`, `-0800`). Region
/// names cannot be resolved without a tz database and fall back to UTC.
pub fn resolve_timezone(name: &str) -> FixedOffset {
    let utc = Utc.fix();
    let trimmed = name.trim();

    if trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("utc")
        || trimmed.eq_ignore_ascii_case("gmt")
        || trimmed == "Z"
    {
        return utc;
    }

    let offset = trimmed
        .strip_prefix("UTC")
        .or_else(|| trimmed.strip_prefix("GMT"))
        .unwrap_or(trimmed);

    match offset.parse::<FixedOffset>() {
        Ok(tz) => tz,
        Err(_) => {
            warn!(timezone = %name, "unrecognised timezone, scheduling in UTC");
            utc
        }
    }
}

/// Weekday for a Sunday-based index (0 = Sunday .. 6 = Saturday)
pub fn weekday_from_index(index: u32) -> Option<Weekday> {
    match index {
        0 => Some(Weekday::Sun),
        1 => Some(Weekday::Mon),
        2 => Some(Weekday::Tue),
        3 => Some(Weekday::Wed),
        4 => Some(Weekday::Thu),
        5 => Some(Weekday::Fri),
        6 => Some(Weekday::Sat),
        _ => None,
    }
}

/// Parse a comma separated weekday list (`"1,3,5"` or `"mon,wed,fri"`)
///
/// The result is de-duplicated and ordered Sunday first.
pub fn parse_posting_days(input: &str) -> Result<Vec<Weekday>> {
    let mut days = Vec::new();

    for part in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let day = match part.parse::<u32>() {
            Ok(index) => weekday_from_index(index),
            Err(_) => part.parse::<Weekday>().ok(),
        }
        .ok_or_else(|| CadenceError::InvalidInput(format!("Invalid weekday: '{}'", part)))?;

        if !days.contains(&day) {
            days.push(day);
        }
    }

    days.sort_by_key(|d| d.num_days_from_sunday());
    Ok(days)
}

/// Inverse of [`parse_posting_days`], as stored in the database
pub fn format_posting_days(days: &[Weekday]) -> String {
    let mut indices: Vec<u32> = days.iter().map(|d| d.num_days_from_sunday()).collect();
    indices.sort_unstable();
    indices.dedup();
    indices
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse `HH:MM` or `HH:MM:SS`
pub fn parse_posting_time(input: &str) -> Result<NaiveTime> {
    let trimmed = input.trim();
    NaiveTime::parse_from_str(trimmed, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M:%S"))
        .map_err(|_| CadenceError::InvalidInput(format!("Invalid time of day: '{}'", input)))
}
