//! Raw equipment facts reported by sensors and MES adapters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    EquipmentId, ReasonCode, Severity, ShiftId, StateCategory, ValidationError,
};

/// One state interval of an equipment unit.
///
/// Intervals of a single equipment are contiguous and never overlap; at most
/// one is open (`end_time == None`) at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentState {
    pub equipment_id: EquipmentId,
    pub category: StateCategory,
    /// Required for every category except `PRODUCING`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<ReasonCode>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub shift_id: ShiftId,
}

impl EquipmentState {
    /// Checks the reason-code and interval invariants.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.category != StateCategory::Producing && self.reason_code.is_none() {
            return Err(ValidationError::MissingReason {
                category: self.category,
            });
        }
        if let Some(end) = self.end_time {
            if end <= self.start_time {
                return Err(ValidationError::NonPositiveInterval {
                    start: self.start_time,
                    end,
                });
            }
        }
        Ok(())
    }

    /// Whether the interval is still open.
    pub const fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    /// The interval end, substituting `open_until` while the state is open.
    pub fn end_or(&self, open_until: DateTime<Utc>) -> DateTime<Utc> {
        self.end_time.unwrap_or(open_until)
    }
}

/// Output reported by an equipment unit since its previous report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionCount {
    pub equipment_id: EquipmentId,
    pub timestamp: DateTime<Utc>,
    pub total_count: i64,
    pub good_count: i64,
    #[serde(default)]
    pub reject_count: i64,
    #[serde(default)]
    pub rework_count: i64,
    pub shift_id: ShiftId,
}

impl ProductionCount {
    /// Checks that all counts are non-negative and fit inside the total.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("total_count", self.total_count),
            ("good_count", self.good_count),
            ("reject_count", self.reject_count),
            ("rework_count", self.rework_count),
        ] {
            if value < 0 {
                return Err(ValidationError::Negative { field, value });
            }
        }
        let parts = self.good_count + self.reject_count + self.rework_count;
        if parts > self.total_count {
            return Err(ValidationError::CountsExceedTotal {
                parts,
                total: self.total_count,
            });
        }
        Ok(())
    }

    /// Units that did not come out good (rejects, rework and unaccounted).
    pub const fn lost_units(&self) -> i64 {
        self.total_count - self.good_count
    }
}

/// A defect observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityEvent {
    pub equipment_id: EquipmentId,
    pub timestamp: DateTime<Utc>,
    pub defect_category: String,
    pub defect_count: i64,
    pub severity: Severity,
}

impl QualityEvent {
    /// Checks that the defect count is non-negative.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.defect_count < 0 {
            return Err(ValidationError::Negative {
                field: "defect_count",
                value: self.defect_count,
            });
        }
        if self.defect_category.trim().is_empty() {
            return Err(ValidationError::Empty {
                field: "defect category",
            });
        }
        Ok(())
    }
}
