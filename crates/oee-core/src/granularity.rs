//! Rollup granularities as the single source of truth for level strings.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ValidationError;
use crate::window::TimeWindow;

/// Time resolution of an OEE record.
///
/// Ordered from finest to coarsest. Every level except [`Granularity::Raw`]
/// has a fixed width and windows aligned to multiples of that width since the
/// Unix epoch (so days start at UTC midnight).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Granularity {
    /// Computed directly from raw events over an arbitrary window.
    Raw,
    Minute,
    FiveMinute,
    Hour,
    Day,
}

/// Materialized rollup levels, finest first.
pub const ROLLUP_LEVELS: [Granularity; 4] = [
    Granularity::Minute,
    Granularity::FiveMinute,
    Granularity::Hour,
    Granularity::Day,
];

impl Granularity {
    /// String representation for database storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Minute => "1min",
            Self::FiveMinute => "5min",
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }

    /// Window width in milliseconds. `None` for `Raw`.
    #[must_use]
    pub const fn step_ms(&self) -> Option<i64> {
        match self {
            Self::Raw => None,
            Self::Minute => Some(60_000),
            Self::FiveMinute => Some(300_000),
            Self::Hour => Some(3_600_000),
            Self::Day => Some(86_400_000),
        }
    }

    /// Window width as a duration. `None` for `Raw`.
    #[must_use]
    pub fn step(&self) -> Option<Duration> {
        self.step_ms().map(Duration::milliseconds)
    }

    /// The level this one is aggregated from.
    #[must_use]
    pub const fn finer(&self) -> Option<Self> {
        match self {
            Self::Raw => None,
            Self::Minute => Some(Self::Raw),
            Self::FiveMinute => Some(Self::Minute),
            Self::Hour => Some(Self::FiveMinute),
            Self::Day => Some(Self::Hour),
        }
    }

    /// The level aggregated from this one.
    #[must_use]
    pub const fn coarser(&self) -> Option<Self> {
        match self {
            Self::Raw => Some(Self::Minute),
            Self::Minute => Some(Self::FiveMinute),
            Self::FiveMinute => Some(Self::Hour),
            Self::Hour => Some(Self::Day),
            Self::Day => None,
        }
    }

    /// Floors `ts` to the start of the window containing it.
    ///
    /// `Raw` has no boundaries and returns `ts` unchanged.
    #[must_use]
    pub fn align(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let Some(step) = self.step_ms() else {
            return ts;
        };
        let ms = ts.timestamp_millis();
        let floored = ms - ms.rem_euclid(step);
        DateTime::from_timestamp_millis(floored).unwrap_or(ts)
    }

    /// The window of this granularity that starts at `start`.
    ///
    /// Returns `None` for `Raw` or when `start` is not on a boundary.
    #[must_use]
    pub fn window_at(&self, start: DateTime<Utc>) -> Option<TimeWindow> {
        let step = self.step()?;
        if self.align(start) != start {
            return None;
        }
        TimeWindow::new(start, start + step).ok()
    }

    /// Windows of this granularity that intersect `[start, end)`, in order.
    #[must_use]
    pub fn windows_covering(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<TimeWindow> {
        let Some(step) = self.step() else {
            return Vec::new();
        };
        let mut windows = Vec::new();
        let mut cursor = self.align(start);
        while cursor < end {
            windows.push(TimeWindow {
                start: cursor,
                end: cursor + step,
            });
            cursor += step;
        }
        windows
    }

    /// How many windows of the finer level make up one window of this level.
    #[must_use]
    pub fn children_per_window(&self) -> Option<i64> {
        let finer = self.finer()?;
        Some(self.step_ms()? / finer.step_ms()?)
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(Self::Raw),
            "1min" | "minute" => Ok(Self::Minute),
            "5min" => Ok(Self::FiveMinute),
            "hour" | "1h" => Ok(Self::Hour),
            "day" | "1d" => Ok(Self::Day),
            _ => Err(ValidationError::InvalidVariant {
                field: "granularity",
                value: s.to_string(),
            }),
        }
    }
}

impl Serialize for Granularity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Granularity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
