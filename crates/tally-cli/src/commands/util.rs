//! Shared helpers for CLI commands.

use std::sync::LazyLock;

use anyhow::Context;
use chrono::{DateTime, TimeDelta, Utc};
use regex::Regex;

/// Pre-compiled regex for relative time phrases.
static RELATIVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\s+(minute|hour|day|week)s?\s+ago$").unwrap());

/// Parses a point in time as either ISO 8601 or a relative phrase.
///
/// Accepts "2024-03-01T10:00:00Z" style timestamps as well as
/// "30 minutes ago", "2 hours ago", "1 day ago" and "1 week ago".
pub fn parse_datetime(input: &str) -> anyhow::Result<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(input) {
        return Ok(parsed.with_timezone(&Utc));
    }

    let caps = RELATIVE_RE.captures(input).with_context(|| {
        format!("invalid time {input:?}, expected ISO 8601 or e.g. \"2 hours ago\"")
    })?;
    let count: i64 = caps[1].parse().context("relative time count out of range")?;
    let minutes_per_unit = match &caps[2] {
        "minute" => 1,
        "hour" => 60,
        "day" => 60 * 24,
        _ => 60 * 24 * 7,
    };
    count
        .checked_mul(minutes_per_unit)
        .and_then(TimeDelta::try_minutes)
        .and_then(|offset| Utc::now().checked_sub_signed(offset))
        .with_context(|| format!("relative time {input:?} is too far in the past"))
}
