//! Shared utilities for CLI commands.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use oee_core::{EquipmentId, TimeWindow};
use regex::Regex;

static RELATIVE_TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\s+(minute|hour|day|week)s?\s+ago$").expect("relative time pattern is valid")
});

/// Conservative bounds for relative time parsing (~1000 years in minutes).
const MAX_RELATIVE_MINUTES: i64 = 1000 * 365 * 24 * 60;

/// Parses RFC 3339, a bare `YYYY-MM-DD` (UTC midnight) or "N units ago".
pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    parse_datetime_at(s, Utc::now())
}

/// Like [`parse_datetime`], resolving relative times against `now`.
pub fn parse_datetime_at(s: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Some(midnight) = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
    {
        return Ok(midnight.and_utc());
    }

    let Some(caps) = RELATIVE_TIME_RE.captures(s) else {
        anyhow::bail!(
            "Invalid datetime: {s}. Use RFC 3339 (e.g., 2025-03-03T06:00:00Z), a date (2025-03-03) or relative (e.g., '2 hours ago')"
        );
    };

    let n: i64 = caps[1]
        .parse()
        .context("failed to parse number in relative time")?;

    let (max_for_unit, minutes_per_unit) = match &caps[2] {
        "minute" => (MAX_RELATIVE_MINUTES, 1),
        "hour" => (MAX_RELATIVE_MINUTES / 60, 60),
        "day" => (MAX_RELATIVE_MINUTES / (60 * 24), 60 * 24),
        "week" => (MAX_RELATIVE_MINUTES / (60 * 24 * 7), 60 * 24 * 7),
        unit => anyhow::bail!("Unknown time unit: {unit}"),
    };
    if n > max_for_unit {
        anyhow::bail!("Relative time value too large: {n} {}", &caps[2]);
    }

    Ok(now - Duration::minutes(n * minutes_per_unit))
}

/// Parses a `[start, end)` pair.
pub fn parse_window(start: &str, end: &str) -> Result<TimeWindow> {
    let now = Utc::now();
    let start = parse_datetime_at(start, now)?;
    let end = parse_datetime_at(end, now)?;
    TimeWindow::new(start, end).context("invalid time range")
}

pub fn parse_equipment(id: &str) -> Result<EquipmentId> {
    EquipmentId::new(id).with_context(|| format!("invalid equipment id {id:?}"))
}

/// Formats milliseconds as "Xh Ym", or "Ym" below one hour.
pub fn format_duration(ms: i64) -> String {
    let total_minutes = ms.max(0) / 60_000;
    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;
    if hours >= 1 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

/// Formats a ratio as a percentage with one decimal.
pub fn percent(ratio: f64) -> String {
    format!("{:.1}%", ratio * 100.0)
}

/// A 10-character bar for a share between 0 and 1.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn share_bar(share: f64) -> String {
    let filled = if share > 0.0 && share < 0.05 {
        1
    } else {
        (share.clamp(0.0, 1.0) * 10.0).round() as usize
    };
    format!("{}{}", "█".repeat(filled), "░".repeat(10 - filled))
}
