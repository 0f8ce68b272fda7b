//! Shift calendar: planned production time per equipment.
//!
//! A shift instance covers `[planned_start, planned_end)` and contains one
//! break of `break_minutes`. The break sits at `break_start` when given,
//! otherwise it is centred on the shift midpoint. Planned time of any window
//! is its overlap with the shift minus its overlap with the break, so a
//! window covering the whole shift sees exactly
//! `planned_minutes - break_minutes`.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::master::EquipmentSpec;
use crate::types::{ShiftId, ValidationError};
use crate::window::{TimeWindow, overlap_ms};

/// One concrete occurrence of a scheduled shift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftInstance {
    pub id: ShiftId,
    /// Equipment ID or site ID the shift applies to.
    pub scope: String,
    pub date: NaiveDate,
    pub planned_start: DateTime<Utc>,
    pub planned_end: DateTime<Utc>,
    pub planned_minutes: i64,
    #[serde(default)]
    pub break_minutes: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub break_start: Option<DateTime<Utc>>,
}

/// A stretch of planned, non-break time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedSegment {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl PlannedSegment {
    pub fn duration_ms(&self) -> i64 {
        (self.end - self.start).num_milliseconds()
    }
}

impl ShiftInstance {
    /// Checks span, planned minutes and break placement.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.scope.trim().is_empty() {
            return Err(ValidationError::Empty {
                field: "shift scope",
            });
        }
        for (field, value) in [
            ("planned_minutes", self.planned_minutes),
            ("break_minutes", self.break_minutes),
        ] {
            if value < 0 {
                return Err(ValidationError::Negative { field, value });
            }
        }
        let span_minutes = (self.planned_end - self.planned_start).num_minutes();
        if span_minutes != self.planned_minutes
            || self.planned_end < self.planned_start
            || (self.planned_end - self.planned_start).num_seconds() % 60 != 0
        {
            return Err(ValidationError::ShiftSpanMismatch {
                span_minutes,
                planned_minutes: self.planned_minutes,
            });
        }
        let (break_start, break_end) = self.break_interval();
        if self.break_minutes > self.planned_minutes
            || break_start < self.planned_start
            || break_end > self.planned_end
        {
            return Err(ValidationError::BreakOutsideShift {
                break_minutes: self.break_minutes,
            });
        }
        Ok(())
    }

    /// `planned_minutes - break_minutes`, in milliseconds.
    pub const fn planned_time_ms(&self) -> i64 {
        (self.planned_minutes - self.break_minutes) * 60_000
    }

    /// The break as a half-open interval.
    pub fn break_interval(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let length = Duration::minutes(self.break_minutes);
        let start = self.break_start.unwrap_or_else(|| {
            let midpoint = self.planned_start + (self.planned_end - self.planned_start) / 2;
            midpoint - length / 2
        });
        (start, start + length)
    }

    /// Whether the shift shares time with `window`.
    pub fn overlaps(&self, window: &TimeWindow) -> bool {
        window.overlaps(self.planned_start, self.planned_end)
    }

    /// Planned, non-break time of this shift inside `window`.
    pub fn planned_ms_in(&self, window: &TimeWindow) -> i64 {
        self.planned_segments_in(window)
            .iter()
            .map(PlannedSegment::duration_ms)
            .sum()
    }

    /// The (at most two) planned segments of this shift inside `window`.
    pub fn planned_segments_in(&self, window: &TimeWindow) -> Vec<PlannedSegment> {
        let (break_start, break_end) = self.break_interval();
        [
            (self.planned_start, break_start),
            (break_end, self.planned_end),
        ]
        .into_iter()
        .filter_map(|(start, end)| {
            let start = start.max(window.start);
            let end = end.min(window.end);
            (end > start).then_some(PlannedSegment { start, end })
        })
        .collect()
    }
}

/// The shifts that apply to one equipment unit, ordered by start.
#[derive(Debug, Clone, Default)]
pub struct ShiftCalendar {
    shifts: Vec<ShiftInstance>,
}

impl ShiftCalendar {
    /// Builds a calendar from explicit shifts.
    pub fn new(mut shifts: Vec<ShiftInstance>) -> Self {
        shifts.sort_by(|a, b| {
            a.planned_start
                .cmp(&b.planned_start)
                .then_with(|| a.id.cmp(&b.id))
        });
        Self { shifts }
    }

    /// Selects the shifts that apply to `equipment`.
    ///
    /// Shifts scoped to the equipment itself take precedence: when any exist,
    /// site-wide shifts are ignored so the two never double-count.
    pub fn for_equipment(all: &[ShiftInstance], equipment: &EquipmentSpec) -> Self {
        let own: Vec<ShiftInstance> = all
            .iter()
            .filter(|s| s.scope == equipment.id.as_str())
            .cloned()
            .collect();
        if !own.is_empty() {
            return Self::new(own);
        }
        let site: Vec<ShiftInstance> = equipment
            .site_id
            .as_deref()
            .map(|site| all.iter().filter(|s| s.scope == site).cloned().collect())
            .unwrap_or_default();
        Self::new(site)
    }

    /// Whether no shift applies at all.
    pub fn is_empty(&self) -> bool {
        self.shifts.is_empty()
    }

    pub fn shifts(&self) -> &[ShiftInstance] {
        &self.shifts
    }

    /// Shifts that share time with `window`.
    pub fn overlapping<'a>(
        &'a self,
        window: &'a TimeWindow,
    ) -> impl Iterator<Item = &'a ShiftInstance> + 'a {
        self.shifts.iter().filter(move |s| s.overlaps(window))
    }

    /// All planned, non-break segments inside `window`, in time order.
    pub fn planned_segments(&self, window: &TimeWindow) -> Vec<PlannedSegment> {
        let mut segments: Vec<PlannedSegment> = self
            .overlapping(window)
            .flat_map(|s| s.planned_segments_in(window))
            .collect();
        segments.sort_by_key(|s| s.start);
        segments
    }

    /// Total planned time inside `window`.
    pub fn planned_ms(&self, window: &TimeWindow) -> i64 {
        self.planned_segments(window)
            .iter()
            .map(PlannedSegment::duration_ms)
            .sum()
    }

    /// Returns the first pair of shifts whose planned spans overlap.
    ///
    /// Each shift is compared with the furthest-reaching shift before it, so
    /// an empty or nested shift in between cannot mask a conflict.
    pub fn find_overlap(&self) -> Option<(&ShiftInstance, &ShiftInstance)> {
        let mut reach = self.shifts.first()?;
        for next in self.shifts.iter().skip(1) {
            let overlap = overlap_ms(
                reach.planned_start,
                reach.planned_end,
                next.planned_start,
                next.planned_end,
            );
            if overlap > 0 {
                return Some((reach, next));
            }
            if next.planned_end > reach.planned_end {
                reach = next;
            }
        }
        None
    }
}
