//! Window computation on top of the store.
//!
//! 1-minute and raw windows are computed from raw events. Every coarser
//! window is combined from the materialized records of the next-finer level,
//! never from raw data, so a day always equals the sum of its hours.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use oee_core::{
    CalcContext, CalcError, EquipmentId, EquipmentSpec, Granularity, OeeRecord, ROLLUP_LEVELS,
    RawEvents, ReasonCodeTable, ReliabilityRecord, ShiftCalendar, ShiftId, TimeWindow,
    calculate_oee, calculate_reliability, combine, state_lookback,
};
use oee_db::{Database, WindowKey};
use rayon::prelude::*;
use serde::Serialize;

use crate::RefreshError;

#[derive(Debug, Clone)]
struct Unit {
    spec: EquipmentSpec,
    calendar: ShiftCalendar,
}

/// Master data read once and shared by every window computed from it.
#[derive(Debug, Clone, Default)]
pub struct MasterSnapshot {
    units: BTreeMap<EquipmentId, Unit>,
    reasons: ReasonCodeTable,
}

impl MasterSnapshot {
    pub fn load(db: &Database) -> Result<Self, RefreshError> {
        let shifts = db.shifts()?;
        let units = db
            .list_equipment()?
            .into_iter()
            .map(|spec| {
                let calendar = ShiftCalendar::for_equipment(&shifts, &spec);
                (spec.id.clone(), Unit { spec, calendar })
            })
            .collect();
        Ok(Self {
            units,
            reasons: db.reason_table()?,
        })
    }

    pub fn equipment(&self) -> impl Iterator<Item = &EquipmentSpec> {
        self.units.values().map(|unit| &unit.spec)
    }

    pub const fn reasons(&self) -> &ReasonCodeTable {
        &self.reasons
    }

    pub fn calendar(&self, equipment: &EquipmentId) -> Result<&ShiftCalendar, CalcError> {
        self.unit(equipment).map(|unit| &unit.calendar)
    }

    fn unit(&self, equipment: &EquipmentId) -> Result<&Unit, CalcError> {
        self.units
            .get(equipment)
            .ok_or_else(|| CalcError::UnknownEquipment {
                equipment: equipment.to_string(),
            })
    }
}

/// Computes the record of one queued window.
pub fn compute_window(
    db: &Database,
    master: &MasterSnapshot,
    key: &WindowKey,
) -> Result<OeeRecord, RefreshError> {
    match key.granularity.finer() {
        None | Some(Granularity::Raw) => {
            from_raw(db, master, &key.equipment_id, key.window, key.granularity)
        }
        Some(finer) => {
            let children = db.list_rollups(&key.equipment_id, finer, key.window)?;
            let record = combine(&key.equipment_id, key.window, key.granularity, &children)?;
            if i64::try_from(children.len()).ok() != key.granularity.children_per_window() {
                tracing::warn!(
                    equipment = %key.equipment_id,
                    granularity = %key.granularity,
                    window_start = %key.window.start,
                    children = children.len(),
                    "partial data: missing child rollups"
                );
            }
            Ok(record)
        }
    }
}

/// Computes a raw-level record for an arbitrary window without touching the
/// rollup tables.
pub fn compute_direct(
    db: &Database,
    master: &MasterSnapshot,
    equipment: &EquipmentId,
    window: TimeWindow,
) -> Result<OeeRecord, RefreshError> {
    from_raw(db, master, equipment, window, Granularity::Raw)
}

/// Computes a raw-level record covering one whole shift instance.
pub fn compute_shift(
    db: &Database,
    master: &MasterSnapshot,
    equipment: &EquipmentId,
    shift: &ShiftId,
) -> Result<OeeRecord, RefreshError> {
    let instance = master
        .calendar(equipment)?
        .shifts()
        .iter()
        .find(|s| &s.id == shift)
        .ok_or_else(|| RefreshError::UnknownShift {
            equipment: equipment.to_string(),
            shift: shift.to_string(),
        })?;
    let window = TimeWindow::new(instance.planned_start, instance.planned_end)
        .map_err(CalcError::from)?;
    compute_direct(db, master, equipment, window)
}

fn from_raw(
    db: &Database,
    master: &MasterSnapshot,
    equipment: &EquipmentId,
    window: TimeWindow,
    granularity: Granularity,
) -> Result<OeeRecord, RefreshError> {
    let unit = master.unit(equipment)?;
    // Earlier states decide whether production inside the window is a restart.
    let state_range = TimeWindow {
        start: window.start - state_lookback(&unit.spec),
        end: window.end,
    };
    let states = db.states_between(equipment, state_range)?;
    let counts = db.counts_between(equipment, window)?;
    let quality = db.quality_between(equipment, window)?;

    let ctx = CalcContext {
        equipment: &unit.spec,
        calendar: &unit.calendar,
        reasons: &master.reasons,
    };
    let raw = RawEvents {
        states: &states,
        counts: &counts,
        quality: &quality,
    };
    let record = calculate_oee(&ctx, window, granularity, &raw)?;
    if record.low_confidence {
        tracing::debug!(
            equipment = %equipment,
            granularity = %granularity,
            window_start = %window.start,
            planned_time_ms = record.planned_time_ms,
            "low confidence record"
        );
    }
    Ok(record)
}

/// Computes and stores the reliability record of `period`.
pub fn materialize_reliability(
    db: &Database,
    master: &MasterSnapshot,
    equipment: &EquipmentId,
    period: TimeWindow,
    now: DateTime<Utc>,
) -> Result<ReliabilityRecord, RefreshError> {
    master.unit(equipment)?;
    let states = db.states_between(equipment, period)?;
    let record = calculate_reliability(equipment, &master.reasons, &states, period, Some(now))?;
    db.upsert_reliability(&record, now)?;
    Ok(record)
}

/// Outcome of backfilling one equipment unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub equipment_id: EquipmentId,
    pub windows: usize,
    pub failed: usize,
    /// Windows left alone because a refresh worker held their lease.
    pub skipped: usize,
    pub reliability_days: usize,
}

/// Recomputes every rollup level of whole UTC days touching `range`,
/// one equipment unit per rayon task.
///
/// Windows ending after `now` are skipped. Each task opens its own
/// connection; a failing window is logged and counted without stopping the
/// rest of the range.
pub fn backfill(
    path: &Path,
    equipment: &[EquipmentId],
    range: TimeWindow,
    now: DateTime<Utc>,
) -> Result<Vec<BackfillReport>, RefreshError> {
    let master = MasterSnapshot::load(&Database::open(path)?)?;
    let days = Granularity::Day.windows_covering(range.start, range.end);
    let (Some(first), Some(last)) = (days.first(), days.last()) else {
        return Ok(Vec::new());
    };
    let span = TimeWindow {
        start: first.start,
        end: last.end,
    };
    tracing::info!(
        equipment = equipment.len(),
        start = %span.start,
        end = %span.end,
        "backfill started"
    );

    equipment
        .par_iter()
        .map(|id| backfill_equipment(path, &master, id, span, now))
        .collect()
}

fn backfill_equipment(
    path: &Path,
    master: &MasterSnapshot,
    equipment: &EquipmentId,
    span: TimeWindow,
    now: DateTime<Utc>,
) -> Result<BackfillReport, RefreshError> {
    master.unit(equipment)?;
    let mut db = Database::open(path)?;
    let mut report = BackfillReport {
        equipment_id: equipment.clone(),
        windows: 0,
        failed: 0,
        skipped: 0,
        reliability_days: 0,
    };

    for granularity in ROLLUP_LEVELS {
        for window in granularity.windows_covering(span.start, span.end) {
            if window.end > now {
                break;
            }
            let key = WindowKey {
                equipment_id: equipment.clone(),
                granularity,
                window,
            };
            match compute_window(&db, master, &key) {
                Ok(record) => {
                    if db.store_rollup(&record, now)? {
                        report.windows += 1;
                    } else {
                        tracing::debug!(
                            equipment = %equipment,
                            granularity = %granularity,
                            window_start = %window.start,
                            "backfill skipped leased window"
                        );
                        report.skipped += 1;
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        equipment = %equipment,
                        granularity = %granularity,
                        window_start = %window.start,
                        kind = %err.kind(),
                        error = %err,
                        "backfill window failed"
                    );
                    report.failed += 1;
                }
            }
        }
    }

    for day in Granularity::Day.windows_covering(span.start, span.end) {
        if day.end > now {
            break;
        }
        match materialize_reliability(&db, master, equipment, day, now) {
            Ok(_) => report.reliability_days += 1,
            Err(err) => tracing::warn!(
                equipment = %equipment,
                period_start = %day.start,
                error = %err,
                "backfill reliability failed"
            ),
        }
    }

    tracing::info!(
        equipment = %equipment,
        windows = report.windows,
        failed = report.failed,
        skipped = report.skipped,
        "backfill finished"
    );
    Ok(report)
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
    use oee_core::{
        DowntimeClass, EquipmentId, EquipmentSpec, EquipmentState, LossCategory, MasterData,
        ProductionCount, ReasonCode, ReasonCodeEntry, ShiftId, ShiftInstance, StateCategory,
    };
    use oee_db::Database;

    pub fn ts(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 6, 0, 0)
            .single()
            .expect("valid test timestamp")
            + Duration::minutes(minutes)
    }

    pub fn press() -> EquipmentId {
        EquipmentId::new("press-01").unwrap()
    }

    pub fn lathe() -> EquipmentId {
        EquipmentId::new("lathe-02").unwrap()
    }

    /// `press-01` runs one 06:00-14:00 shift with a 30 minute break;
    /// `lathe-02` belongs to a site without any shift.
    pub fn master_data() -> MasterData {
        let entry = |code: &str, loss, downtime| ReasonCodeEntry {
            code: ReasonCode::new(code).unwrap(),
            loss_category: loss,
            downtime,
            description: None,
        };
        MasterData {
            equipment: vec![
                EquipmentSpec {
                    id: press(),
                    site_id: Some("plant-a".to_string()),
                    ideal_cycle_time_secs: 60.0,
                    startup_window_secs: 600,
                },
                EquipmentSpec {
                    id: lathe(),
                    site_id: Some("plant-b".to_string()),
                    ideal_cycle_time_secs: 30.0,
                    startup_window_secs: 0,
                },
            ],
            reason_codes: vec![
                entry("JAM", LossCategory::Breakdown, DowntimeClass::Unplanned),
                entry("CHANGEOVER", LossCategory::Setup, DowntimeClass::Planned),
            ],
            shifts: vec![ShiftInstance {
                id: ShiftId::new("day-1").unwrap(),
                scope: "plant-a".to_string(),
                date: NaiveDate::from_ymd_opt(2025, 3, 3).unwrap(),
                planned_start: ts(0),
                planned_end: ts(480),
                planned_minutes: 480,
                break_minutes: 30,
                break_start: None,
            }],
        }
    }

    pub fn state(
        equipment: EquipmentId,
        category: StateCategory,
        reason: Option<&str>,
        start: i64,
        end: Option<i64>,
    ) -> EquipmentState {
        EquipmentState {
            equipment_id: equipment,
            category,
            reason_code: reason.map(|r| ReasonCode::new(r).unwrap()),
            start_time: ts(start),
            end_time: end.map(ts),
            shift_id: ShiftId::new("day-1").unwrap(),
        }
    }

    pub fn count(at: i64, total: i64, good: i64) -> ProductionCount {
        ProductionCount {
            equipment_id: press(),
            timestamp: ts(at),
            total_count: total,
            good_count: good,
            reject_count: total - good,
            rework_count: 0,
            shift_id: ShiftId::new("day-1").unwrap(),
        }
    }

    /// Press produces for 50 minutes, jams for 10, then produces again.
    pub fn seed(db: &mut Database) {
        db.load_master_data(&master_data()).expect("load master data");
        db.append_state(&state(press(), StateCategory::Producing, None, 0, Some(50)))
            .unwrap();
        db.append_state(&state(press(), StateCategory::Down, Some("JAM"), 50, Some(60)))
            .unwrap();
        db.open_state(&state(press(), StateCategory::Producing, None, 60, None))
            .unwrap();
        db.append_count(&count(10, 40, 38)).unwrap();
    }
}
