//! Current equipment status, projected from the latest state interval.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::event::EquipmentState;
use crate::master::ReasonCodeTable;
use crate::types::{EquipmentId, LossCategory, ReasonCode, ShiftId, StateCategory};

/// What an equipment unit is doing right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EquipmentStatus {
    pub equipment_id: EquipmentId,
    pub category: StateCategory,
    pub reason_code: Option<ReasonCode>,
    pub loss_category: Option<LossCategory>,
    pub shift_id: ShiftId,
    pub since: DateTime<Utc>,
    /// `false` when the latest interval is already closed (no fresh report).
    pub open: bool,
    pub duration_ms: i64,
}

/// Projects the status of the unit from its most recent interval.
///
/// Returns `None` when no state has been recorded.
pub fn current_status(
    states: &[EquipmentState],
    reasons: &ReasonCodeTable,
    as_of: DateTime<Utc>,
) -> Option<EquipmentStatus> {
    let latest = states.iter().max_by_key(|s| s.start_time)?;
    let loss_category = latest
        .reason_code
        .as_ref()
        .and_then(|code| reasons.classify(code.as_str()))
        .map(|entry| entry.loss_category);
    let end = latest.end_or(as_of.max(latest.start_time));
    Some(EquipmentStatus {
        equipment_id: latest.equipment_id.clone(),
        category: latest.category,
        reason_code: latest.reason_code.clone(),
        loss_category,
        shift_id: latest.shift_id.clone(),
        since: latest.start_time,
        open: latest.is_open(),
        duration_ms: (end - latest.start_time).num_milliseconds(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::ReasonCodeEntry;
    use crate::types::DowntimeClass;
    use chrono::{Duration, TimeZone};

    fn ts(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 6, 0, 0)
            .single()
            .expect("valid test timestamp")
            + Duration::minutes(minutes)
    }

    fn state(category: StateCategory, reason: Option<&str>, start: i64, end: Option<i64>) -> EquipmentState {
        EquipmentState {
            equipment_id: EquipmentId::new("press-01").unwrap(),
            category,
            reason_code: reason.map(|r| ReasonCode::new(r).unwrap()),
            start_time: ts(start),
            end_time: end.map(ts),
            shift_id: ShiftId::new("day-1").unwrap(),
        }
    }

    #[test]
    fn latest_open_interval_is_current() {
        let reasons = ReasonCodeTable::new(vec![ReasonCodeEntry {
            code: ReasonCode::new("JAM").unwrap(),
            loss_category: LossCategory::Breakdown,
            downtime: DowntimeClass::Unplanned,
            description: None,
        }])
        .unwrap();
        let states = vec![
            state(StateCategory::Down, Some("JAM"), 30, None),
            state(StateCategory::Producing, None, 0, Some(30)),
        ];
        let status = current_status(&states, &reasons, ts(45)).expect("status present");
        assert_eq!(status.category, StateCategory::Down);
        assert_eq!(status.loss_category, Some(LossCategory::Breakdown));
        assert!(status.open);
        assert_eq!(status.since, ts(30));
        assert_eq!(status.duration_ms, 15 * 60_000);
    }

    #[test]
    fn no_states_no_status() {
        assert!(current_status(&[], &ReasonCodeTable::default(), ts(0)).is_none());
    }

    #[test]
    fn closed_latest_interval_reports_its_length() {
        let states = vec![state(StateCategory::Producing, None, 0, Some(20))];
        let status = current_status(&states, &ReasonCodeTable::default(), ts(60)).unwrap();
        assert!(!status.open);
        assert_eq!(status.duration_ms, 20 * 60_000);
    }
}
