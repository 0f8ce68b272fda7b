//! Half-open time windows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ValidationError;

/// A half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Creates a window, rejecting empty or inverted ranges.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, ValidationError> {
        if end <= start {
            return Err(ValidationError::NonPositiveInterval { start, end });
        }
        Ok(Self { start, end })
    }

    /// Length of the window in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        (self.end - self.start).num_milliseconds()
    }

    /// Whether `ts` falls inside the window.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Milliseconds of `[start, end)` that fall inside this window.
    pub fn overlap_ms(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
        overlap_ms(self.start, self.end, start, end)
    }

    /// Whether `[start, end)` shares any time with this window.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.overlap_ms(start, end) > 0
    }
}

/// Milliseconds shared by two half-open ranges. Zero when they are disjoint.
pub fn overlap_ms(
    a_start: DateTime<Utc>,
    a_end: DateTime<Utc>,
    b_start: DateTime<Utc>,
    b_end: DateTime<Utc>,
) -> i64 {
    let start = a_start.max(b_start);
    let end = a_end.min(b_end);
    if end <= start {
        return 0;
    }
    (end - start).num_milliseconds()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn ts(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 6, 0, 0)
            .single()
            .expect("valid test timestamp")
            + Duration::minutes(minutes)
    }

    #[test]
    fn new_rejects_inverted_and_empty() {
        assert!(TimeWindow::new(ts(10), ts(5)).is_err());
        assert!(TimeWindow::new(ts(5), ts(5)).is_err());
        assert!(TimeWindow::new(ts(5), ts(6)).is_ok());
    }

    #[test]
    fn contains_is_half_open() {
        let window = TimeWindow::new(ts(0), ts(1)).unwrap();
        assert!(window.contains(ts(0)));
        assert!(!window.contains(ts(1)));
    }

    #[test]
    fn overlap_clips_to_both_ranges() {
        let window = TimeWindow::new(ts(0), ts(10)).unwrap();
        assert_eq!(window.overlap_ms(ts(-5), ts(3)), 3 * 60_000);
        assert_eq!(window.overlap_ms(ts(8), ts(20)), 2 * 60_000);
        assert_eq!(window.overlap_ms(ts(10), ts(20)), 0);
        assert!(!window.overlaps(ts(-5), ts(0)));
    }
}
