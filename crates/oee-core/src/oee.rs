//! OEE calculation over raw events.
//!
//! Reduces state intervals, production counts and quality events for one
//! equipment unit and one window into an [`OeeRecord`]. Pure and synchronous:
//! callers fetch the inputs and persist the result.

use chrono::{DateTime, Duration, Utc};

use crate::error::CalcError;
use crate::event::{EquipmentState, ProductionCount, QualityEvent};
use crate::granularity::Granularity;
use crate::master::{EquipmentSpec, ReasonCodeTable};
use crate::record::OeeRecord;
use crate::shift::{PlannedSegment, ShiftCalendar};
use crate::types::{LossCategory, StateCategory};
use crate::window::{TimeWindow, overlap_ms};

/// Master data the calculator reads for one equipment unit.
#[derive(Debug, Clone, Copy)]
pub struct CalcContext<'a> {
    pub equipment: &'a EquipmentSpec,
    pub calendar: &'a ShiftCalendar,
    pub reasons: &'a ReasonCodeTable,
}

/// Raw events for one equipment unit.
///
/// `states` must cover the window plus the equipment's startup window before
/// it, so restarts just before the window are seen.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawEvents<'a> {
    pub states: &'a [EquipmentState],
    pub counts: &'a [ProductionCount],
    pub quality: &'a [QualityEvent],
}

/// How far before a window raw states must be loaded for `equipment`.
pub fn state_lookback(equipment: &EquipmentSpec) -> Duration {
    Duration::milliseconds(equipment.startup_window_ms())
}

/// Computes the OEE record of `window`.
///
/// # Errors
///
/// Returns a configuration error when the equipment has no shift calendar,
/// a state carries an unclassified reason code, an event fails validation,
/// or the loss attribution does not reconcile (overlapping intervals).
pub fn calculate_oee(
    ctx: &CalcContext<'_>,
    window: TimeWindow,
    granularity: Granularity,
    raw: &RawEvents<'_>,
) -> Result<OeeRecord, CalcError> {
    let equipment_id = &ctx.equipment.id;
    if ctx.calendar.is_empty() {
        return Err(CalcError::MissingShiftCalendar {
            equipment: equipment_id.to_string(),
        });
    }

    let mut record = OeeRecord::empty(equipment_id.clone(), window, granularity);
    let segments = ctx.calendar.planned_segments(&window);
    record.planned_time_ms = segments.iter().map(PlannedSegment::duration_ms).sum();

    let mut states: Vec<&EquipmentState> = raw
        .states
        .iter()
        .filter(|s| &s.equipment_id == equipment_id)
        .collect();
    states.sort_by_key(|s| s.start_time);

    let mut covered_ms = 0;
    for state in &states {
        state.validate()?;
        let end = state.end_or(window.end);
        if !window.overlaps(state.start_time, end) {
            continue;
        }
        record.sample_count += 1;
        let loss = state_loss(ctx, state)?;
        let in_plan: i64 = segments
            .iter()
            .map(|seg| overlap_ms(seg.start, seg.end, state.start_time, end))
            .sum();
        covered_ms += in_plan;
        match loss {
            None => record.operating_time_ms += in_plan,
            Some(category) => {
                record.losses.add_time(category, in_plan);
            }
        }
    }

    let uncovered_ms = record.planned_time_ms - covered_ms;
    if uncovered_ms > 0 {
        tracing::debug!(
            equipment = %equipment_id,
            window_start = %window.start,
            uncovered_ms,
            "planned time without recorded state"
        );
        record.losses.breakdown_ms += uncovered_ms;
        record.low_confidence = true;
    }

    record.theoretical_output =
        theoretical_output(record.operating_time_ms, ctx.equipment.ideal_cycle_time_secs);

    let restarts = restart_times(&states);
    let startup = Duration::milliseconds(ctx.equipment.startup_window_ms());
    for count in raw
        .counts
        .iter()
        .filter(|c| &c.equipment_id == equipment_id && window.contains(c.timestamp))
    {
        count.validate()?;
        record.sample_count += 1;
        record.actual_output += count.total_count;
        record.good_count += count.good_count;
        record.reject_count += count.reject_count;
        record.rework_count += count.rework_count;

        let lost = count.lost_units();
        if is_startup(&restarts, count.timestamp, startup) {
            record.losses.startup_defect_units += lost;
        } else {
            record.losses.production_defect_units += lost;
        }
        let in_plan = segments
            .iter()
            .any(|seg| count.timestamp >= seg.start && count.timestamp < seg.end);
        if !in_plan && count.total_count > 0 {
            record.low_confidence = true;
        }
    }

    for event in raw
        .quality
        .iter()
        .filter(|q| &q.equipment_id == equipment_id && window.contains(q.timestamp))
    {
        event.validate()?;
        record.sample_count += 1;
        record.defect_events += event.defect_count;
    }

    if record.planned_time_ms == 0 {
        record.low_confidence = true;
    }

    record.reconcile()?;
    Ok(record)
}

/// Units the equipment could make in `operating_ms` at its ideal cycle time.
#[allow(clippy::cast_precision_loss)]
fn theoretical_output(operating_ms: i64, ideal_cycle_time_secs: f64) -> f64 {
    operating_ms as f64 / 1000.0 / ideal_cycle_time_secs
}

/// Loss category of a state, `None` for `PRODUCING`.
fn state_loss(
    ctx: &CalcContext<'_>,
    state: &EquipmentState,
) -> Result<Option<LossCategory>, CalcError> {
    if state.category == StateCategory::Producing {
        return Ok(None);
    }
    let code = state
        .reason_code
        .as_ref()
        .map(|c| c.as_str())
        .unwrap_or_default();
    ctx.reasons
        .classify(code)
        .map(|entry| Some(entry.loss_category))
        .ok_or_else(|| CalcError::UnmappedReasonCode {
            equipment: state.equipment_id.to_string(),
            code: code.to_string(),
        })
}

/// Start times of `PRODUCING` intervals that directly follow `SETUP` or
/// `DOWN`. `states` must be sorted by start.
fn restart_times(states: &[&EquipmentState]) -> Vec<DateTime<Utc>> {
    states
        .windows(2)
        .filter(|pair| {
            pair[1].category == StateCategory::Producing
                && matches!(pair[0].category, StateCategory::Setup | StateCategory::Down)
        })
        .map(|pair| pair[1].start_time)
        .collect()
}

fn is_startup(restarts: &[DateTime<Utc>], ts: DateTime<Utc>, startup: Duration) -> bool {
    restarts
        .iter()
        .rev()
        .find(|&&restart| restart <= ts)
        .is_some_and(|&restart| ts < restart + startup)
}
