//! Downtime Pareto: where the non-producing time went, by reason code.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::CalcError;
use crate::event::EquipmentState;
use crate::master::ReasonCodeTable;
use crate::types::{DowntimeClass, LossCategory, StateCategory};
use crate::window::TimeWindow;

/// Aggregated downtime for one reason code.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DowntimeEntry {
    pub reason_code: String,
    pub loss_category: LossCategory,
    pub downtime: DowntimeClass,
    pub description: Option<String>,
    pub occurrences: i64,
    pub total_ms: i64,
    /// Fraction of all downtime in the period.
    pub share: f64,
}

/// Groups non-producing time in `period` by reason code, largest first.
///
/// # Errors
///
/// Returns [`CalcError::UnmappedReasonCode`] for a reason the table does not
/// classify.
pub fn downtime_pareto(
    states: &[EquipmentState],
    reasons: &ReasonCodeTable,
    period: TimeWindow,
    as_of: DateTime<Utc>,
) -> Result<Vec<DowntimeEntry>, CalcError> {
    let open_until = as_of.min(period.end);
    let mut totals: BTreeMap<&str, (i64, i64)> = BTreeMap::new();

    for state in states
        .iter()
        .filter(|s| s.category != StateCategory::Producing)
    {
        let clipped = period.overlap_ms(state.start_time, state.end_or(open_until));
        if clipped <= 0 {
            continue;
        }
        let code = state.reason_code.as_ref().map_or("", |c| c.as_str());
        if reasons.classify(code).is_none() {
            return Err(CalcError::UnmappedReasonCode {
                equipment: state.equipment_id.to_string(),
                code: code.to_string(),
            });
        }
        let entry = totals.entry(code).or_default();
        entry.0 += 1;
        entry.1 += clipped;
    }

    let grand_total: i64 = totals.values().map(|(_, ms)| ms).sum();
    let mut entries: Vec<DowntimeEntry> = totals
        .into_iter()
        .filter_map(|(code, (occurrences, total_ms))| {
            let class = reasons.classify(code)?;
            Some(DowntimeEntry {
                reason_code: code.to_string(),
                loss_category: class.loss_category,
                downtime: class.downtime,
                description: class.description.clone(),
                occurrences,
                total_ms,
                share: share(total_ms, grand_total),
            })
        })
        .collect();
    entries.sort_by(|a, b| {
        b.total_ms
            .cmp(&a.total_ms)
            .then_with(|| a.reason_code.cmp(&b.reason_code))
    });
    Ok(entries)
}

#[allow(clippy::cast_precision_loss)]
fn share(part: i64, total: i64) -> f64 {
    if total <= 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}
