//! Parsing of operator-entered publish times
//!
//! Used when a post is scheduled by hand (`cadence-queue schedule`), as
//! opposed to the generation pass which derives times from preferences.

use chrono::{DateTime, Duration, Utc};

use crate::{CadenceError, Result};

/// Parse a schedule string into an instant strictly after `now`
///
/// Supports:
/// - Relative durations: "90m", "2h", "1d 6h"
/// - Natural language: "tomorrow 9am", "next monday 10:30"
/// - RFC 3339 instants: "2026-11-02T09:00:00Z"
///
/// # Errors
///
/// Returns `InvalidInput` if the input cannot be parsed or lies in the past.
pub fn parse_schedule(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CadenceError::InvalidInput(
            "Schedule string cannot be empty".to_string(),
        ));
    }

    let parsed = parse_rfc3339(input)
        .or_else(|| parse_duration(input).map(|d| now + d))
        .or_else(|| parse_natural_language(input, now))
        .ok_or_else(|| {
            CadenceError::InvalidInput(format!("Could not parse schedule string: {}", input))
        })?;

    if parsed <= now {
        return Err(CadenceError::InvalidInput(format!(
            "Scheduled time {} is not in the future",
            parsed.to_rfc3339()
        )));
    }

    Ok(parsed)
}

fn parse_rfc3339(input: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(input)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_duration(input: &str) -> Option<Duration> {
    let std_duration = humantime::parse_duration(input).ok()?;
    let seconds = i64::try_from(std_duration.as_secs()).ok()?;
    Duration::try_seconds(seconds)
}

fn parse_natural_language(input: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    chrono_english::parse_date_string(input, now, chrono_english::Dialect::Us).ok()
}
