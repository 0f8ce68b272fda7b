//! MTBF / MTTR over a period.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CalcError;
use crate::event::EquipmentState;
use crate::master::ReasonCodeTable;
use crate::types::{DowntimeClass, EquipmentId, StateCategory};
use crate::window::TimeWindow;

const MS_PER_HOUR: f64 = 3_600_000.0;

/// Failure statistics of one equipment unit over a period.
///
/// Only the additive quantities are stored; MTBF, MTTR and availability are
/// derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReliabilityRecord {
    pub equipment_id: EquipmentId,
    pub period: TimeWindow,
    pub failure_count: i64,
    pub total_downtime_ms: i64,
}

#[allow(clippy::cast_precision_loss)]
impl ReliabilityRecord {
    pub fn period_ms(&self) -> i64 {
        self.period.duration_ms()
    }

    /// Mean time between failures; `None` without failures.
    pub fn mtbf_ms(&self) -> Option<f64> {
        (self.failure_count > 0).then(|| {
            (self.period_ms() - self.total_downtime_ms) as f64 / self.failure_count as f64
        })
    }

    /// Mean time to repair; `None` without failures.
    pub fn mttr_ms(&self) -> Option<f64> {
        (self.failure_count > 0)
            .then(|| self.total_downtime_ms as f64 / self.failure_count as f64)
    }

    /// Share of the period not lost to failures.
    pub fn availability(&self) -> f64 {
        let period = self.period_ms();
        if period <= 0 {
            return 0.0;
        }
        ((period - self.total_downtime_ms) as f64 / period as f64).clamp(0.0, 1.0)
    }

    pub fn metrics(&self) -> ReliabilityMetrics {
        ReliabilityMetrics {
            equipment_id: self.equipment_id.clone(),
            period_start: self.period.start,
            period_end: self.period.end,
            failure_count: self.failure_count,
            total_downtime_hours: self.total_downtime_ms as f64 / MS_PER_HOUR,
            mtbf_hours: self.mtbf_ms().map(|ms| ms / MS_PER_HOUR),
            mttr_hours: self.mttr_ms().map(|ms| ms / MS_PER_HOUR),
            availability: self.availability(),
        }
    }
}

/// Query-facing summary of a [`ReliabilityRecord`], in hours.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReliabilityMetrics {
    pub equipment_id: EquipmentId,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub failure_count: i64,
    pub total_downtime_hours: f64,
    pub mtbf_hours: Option<f64>,
    pub mttr_hours: Option<f64>,
    pub availability: f64,
}

/// Counts failures in `period` and sums their downtime.
///
/// A failure is a `DOWN` interval whose reason code is classified unplanned.
/// Intervals partly inside the period count once and contribute only their
/// clipped duration. Open intervals run until `as_of` (or the period end,
/// whichever is earlier).
///
/// # Errors
///
/// Returns [`CalcError::UnmappedReasonCode`] when a `DOWN` interval carries a
/// reason the table does not classify.
pub fn calculate_reliability(
    equipment_id: &EquipmentId,
    reasons: &ReasonCodeTable,
    states: &[EquipmentState],
    period: TimeWindow,
    as_of: Option<DateTime<Utc>>,
) -> Result<ReliabilityRecord, CalcError> {
    let open_until = as_of.map_or(period.end, |t| t.min(period.end));
    let mut record = ReliabilityRecord {
        equipment_id: equipment_id.clone(),
        period,
        failure_count: 0,
        total_downtime_ms: 0,
    };

    for state in states
        .iter()
        .filter(|s| &s.equipment_id == equipment_id && s.category == StateCategory::Down)
    {
        let code = state.reason_code.as_ref().map_or("", |c| c.as_str());
        let entry = reasons
            .classify(code)
            .ok_or_else(|| CalcError::UnmappedReasonCode {
                equipment: equipment_id.to_string(),
                code: code.to_string(),
            })?;
        if entry.downtime != DowntimeClass::Unplanned {
            continue;
        }
        let clipped = period.overlap_ms(state.start_time, state.end_or(open_until));
        if clipped > 0 {
            record.failure_count += 1;
            record.total_downtime_ms += clipped;
        }
    }

    Ok(record)
}
