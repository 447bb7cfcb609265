//! Parsing of human-readable schedule times
//!
//! Accepts relative durations (`30m`, `2h`, `1d`), RFC 3339 timestamps and
//! natural language (`tomorrow`, `next monday 10am`). The result must lie in
//! the future.

use crate::{CastlineError, Result};
use chrono::{DateTime, Duration, Utc};

/// Parse a schedule string relative to `now` into a Unix timestamp
///
/// # Errors
///
/// Returns `CastlineError::InvalidInput` if the string is empty, cannot be
/// parsed, or names a time that is not after `now`.
pub fn parse_schedule(input: &str, now: DateTime<Utc>) -> Result<i64> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CastlineError::InvalidInput(
            "Schedule string cannot be empty".to_string(),
        ));
    }

    let at = if let Ok(duration) = parse_duration(input) {
        now + duration
    } else if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        dt.with_timezone(&Utc)
    } else if let Ok(dt) = parse_natural_language(input, now) {
        dt
    } else {
        return Err(CastlineError::InvalidInput(format!(
            "Could not parse schedule string: {}",
            input
        )));
    };

    if at <= now {
        return Err(CastlineError::InvalidInput(format!(
            "Scheduled time {} is not in the future",
            at.to_rfc3339()
        )));
    }

    Ok(at.timestamp())
}

fn parse_duration(input: &str) -> Result<Duration> {
    let std_duration = humantime::parse_duration(input)
        .map_err(|e| CastlineError::InvalidInput(format!("Could not parse duration: {}", e)))?;

    let seconds = i64::try_from(std_duration.as_secs())
        .map_err(|_| CastlineError::InvalidInput("Duration out of range".to_string()))?;

    Duration::try_seconds(seconds)
        .ok_or_else(|| CastlineError::InvalidInput("Duration out of range".to_string()))
}

fn parse_natural_language(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    chrono_english::parse_date_string(input, now, chrono_english::Dialect::Us)
        .map_err(|e| CastlineError::InvalidInput(format!("Could not parse time: {}", e)))
}
