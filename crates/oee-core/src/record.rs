//! OEE records and the re-aggregation that builds coarse levels from fine ones.
//!
//! A record stores only additive quantities (times, counts, theoretical
//! output). Availability, performance, quality and OEE are derived on read, so
//! `oee == availability * performance * quality` holds by construction and a
//! coarse record is always the ratio of summed numerators over summed
//! denominators, never an average of finer ratios.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CalcError;
use crate::granularity::Granularity;
use crate::types::{EquipmentId, LossCategory};
use crate::window::TimeWindow;

/// Lost time and lost units, by Six Big Losses category.
///
/// Speed loss is not stored: it is derived from theoretical and actual
/// output of the record it belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LossBreakdown {
    pub breakdown_ms: i64,
    pub setup_ms: i64,
    pub minor_stop_ms: i64,
    pub startup_defect_units: i64,
    pub production_defect_units: i64,
}

impl LossBreakdown {
    /// Adds lost time to a time-loss category. Returns `false` when the
    /// category is not measured in time.
    pub const fn add_time(&mut self, category: LossCategory, ms: i64) -> bool {
        match category {
            LossCategory::Breakdown => self.breakdown_ms += ms,
            LossCategory::Setup => self.setup_ms += ms,
            LossCategory::MinorStop => self.minor_stop_ms += ms,
            LossCategory::SpeedLoss
            | LossCategory::StartupDefect
            | LossCategory::ProductionDefect => return false,
        }
        true
    }

    pub const fn time_loss_ms(&self) -> i64 {
        self.breakdown_ms + self.setup_ms + self.minor_stop_ms
    }

    pub const fn count_loss_units(&self) -> i64 {
        self.startup_defect_units + self.production_defect_units
    }

    pub const fn merge(&mut self, other: &Self) {
        self.breakdown_ms += other.breakdown_ms;
        self.setup_ms += other.setup_ms;
        self.minor_stop_ms += other.minor_stop_ms;
        self.startup_defect_units += other.startup_defect_units;
        self.production_defect_units += other.production_defect_units;
    }
}

/// Effectiveness of one equipment over one window at one granularity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OeeRecord {
    pub equipment_id: EquipmentId,
    pub window: TimeWindow,
    pub granularity: Granularity,
    /// Planned, non-break time inside the window.
    pub planned_time_ms: i64,
    /// `PRODUCING` time inside planned time.
    pub operating_time_ms: i64,
    /// Units the equipment could have made at ideal cycle time.
    pub theoretical_output: f64,
    /// Units actually made (the total count).
    pub actual_output: i64,
    pub good_count: i64,
    pub reject_count: i64,
    pub rework_count: i64,
    /// Defects reported by quality events (diagnostic).
    pub defect_events: i64,
    pub losses: LossBreakdown,
    /// Raw events (or finer records) the record was built from.
    pub sample_count: i64,
    pub low_confidence: bool,
}

#[allow(clippy::cast_precision_loss)]
impl OeeRecord {
    /// An all-zero record for `window`.
    pub const fn empty(equipment_id: EquipmentId, window: TimeWindow, granularity: Granularity) -> Self {
        Self {
            equipment_id,
            window,
            granularity,
            planned_time_ms: 0,
            operating_time_ms: 0,
            theoretical_output: 0.0,
            actual_output: 0,
            good_count: 0,
            reject_count: 0,
            rework_count: 0,
            defect_events: 0,
            losses: LossBreakdown {
                breakdown_ms: 0,
                setup_ms: 0,
                minor_stop_ms: 0,
                startup_defect_units: 0,
                production_defect_units: 0,
            },
            sample_count: 0,
            low_confidence: false,
        }
    }

    pub const fn total_count(&self) -> i64 {
        self.actual_output
    }

    /// `operating_time / planned_time`; 0 when nothing was planned.
    pub fn availability(&self) -> f64 {
        if self.planned_time_ms <= 0 {
            return 0.0;
        }
        (self.operating_time_ms as f64 / self.planned_time_ms as f64).clamp(0.0, 1.0)
    }

    /// `actual_output / theoretical_output`, capped at 1; 0 without
    /// theoretical output.
    pub fn performance(&self) -> f64 {
        if self.theoretical_output <= 0.0 {
            return 0.0;
        }
        (self.actual_output as f64 / self.theoretical_output).clamp(0.0, 1.0)
    }

    /// `good / total`; 1 when nothing was produced.
    pub fn quality(&self) -> f64 {
        if self.actual_output <= 0 {
            return 1.0;
        }
        (self.good_count as f64 / self.actual_output as f64).clamp(0.0, 1.0)
    }

    pub fn oee(&self) -> f64 {
        self.availability() * self.performance() * self.quality()
    }

    /// Units produced beyond the theoretical output (cycle time beaten).
    pub fn speed_gain_units(&self) -> f64 {
        (self.actual_output as f64 - self.theoretical_output).max(0.0)
    }

    /// Units short of the theoretical output.
    pub fn speed_loss_units(&self) -> f64 {
        (self.theoretical_output - self.actual_output as f64).max(0.0)
    }

    /// Serializable view with derived rates.
    pub fn metrics(&self) -> OeeMetrics {
        OeeMetrics {
            equipment_id: self.equipment_id.clone(),
            window_start: self.window.start,
            window_end: self.window.end,
            granularity: self.granularity,
            availability: self.availability(),
            performance: self.performance(),
            quality: self.quality(),
            oee: self.oee(),
            speed_gain: self.speed_gain_units(),
            planned_time_ms: self.planned_time_ms,
            operating_time_ms: self.operating_time_ms,
            theoretical_output: self.theoretical_output,
            actual_output: self.actual_output,
            good_count: self.good_count,
            losses: SixBigLosses {
                breakdown_ms: self.losses.breakdown_ms,
                setup_ms: self.losses.setup_ms,
                minor_stop_ms: self.losses.minor_stop_ms,
                speed_loss_units: self.speed_loss_units(),
                startup_defect_units: self.losses.startup_defect_units,
                production_defect_units: self.losses.production_defect_units,
            },
            sample_count: self.sample_count,
            low_confidence: self.low_confidence,
        }
    }

    /// Checks both loss reconciliations against this record's totals.
    pub fn reconcile(&self) -> Result<(), CalcError> {
        let expected_time = self.planned_time_ms - self.operating_time_ms;
        if self.losses.time_loss_ms() != expected_time {
            return Err(CalcError::LossReconciliation {
                kind: "time",
                attributed: self.losses.time_loss_ms(),
                expected: expected_time,
            });
        }
        let expected_units = self.actual_output - self.good_count;
        if self.losses.count_loss_units() != expected_units {
            return Err(CalcError::LossReconciliation {
                kind: "count",
                attributed: self.losses.count_loss_units(),
                expected: expected_units,
            });
        }
        Ok(())
    }
}

/// All six loss categories of a record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SixBigLosses {
    pub breakdown_ms: i64,
    pub setup_ms: i64,
    pub minor_stop_ms: i64,
    pub speed_loss_units: f64,
    pub startup_defect_units: i64,
    pub production_defect_units: i64,
}

/// Query-facing summary of an [`OeeRecord`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OeeMetrics {
    pub equipment_id: EquipmentId,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub granularity: Granularity,
    pub availability: f64,
    pub performance: f64,
    pub quality: f64,
    pub oee: f64,
    pub speed_gain: f64,
    pub planned_time_ms: i64,
    pub operating_time_ms: i64,
    pub theoretical_output: f64,
    pub actual_output: i64,
    pub good_count: i64,
    pub losses: SixBigLosses,
    pub sample_count: i64,
    pub low_confidence: bool,
}

/// Builds a `granularity` record for `window` from records of the next-finer
/// level.
///
/// Children are summed in window order so the floating-point total is the
/// same on every run. Missing children or low-confidence children make the
/// result low-confidence.
pub fn combine(
    equipment_id: &EquipmentId,
    window: TimeWindow,
    granularity: Granularity,
    children: &[OeeRecord],
) -> Result<OeeRecord, CalcError> {
    let expected_level = granularity.finer();
    let mut ordered: Vec<&OeeRecord> = children.iter().collect();
    ordered.sort_by_key(|r| r.window.start);

    let mut combined = OeeRecord::empty(equipment_id.clone(), window, granularity);
    for child in &ordered {
        if Some(child.granularity) != expected_level
            || &child.equipment_id != equipment_id
            || child.window.start < window.start
            || child.window.end > window.end
        {
            return Err(CalcError::HierarchyMismatch {
                child: format!(
                    "{} {} @ {}",
                    child.equipment_id, child.granularity, child.window.start
                ),
                target: format!("{equipment_id} {granularity} @ {}", window.start),
            });
        }
        combined.planned_time_ms += child.planned_time_ms;
        combined.operating_time_ms += child.operating_time_ms;
        combined.theoretical_output += child.theoretical_output;
        combined.actual_output += child.actual_output;
        combined.good_count += child.good_count;
        combined.reject_count += child.reject_count;
        combined.rework_count += child.rework_count;
        combined.defect_events += child.defect_events;
        combined.losses.merge(&child.losses);
        combined.sample_count += child.sample_count;
        combined.low_confidence |= child.low_confidence;
    }

    let expected_children = granularity
        .children_per_window()
        .and_then(|n| usize::try_from(n).ok());
    if expected_children.is_some_and(|n| ordered.len() < n) {
        combined.low_confidence = true;
    }
    if combined.planned_time_ms == 0 {
        combined.low_confidence = true;
    }

    combined.reconcile()?;
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    const EPS: f64 = 1e-9;

    fn ts(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 6, 0, 0)
            .single()
            .expect("valid test timestamp")
            + Duration::minutes(minutes)
    }

    fn press() -> EquipmentId {
        EquipmentId::new("press-01").unwrap()
    }

    fn minute_record(minute: i64, planned_s: i64, operating_s: i64, total: i64, good: i64) -> OeeRecord {
        let window = TimeWindow::new(ts(minute), ts(minute + 1)).unwrap();
        let mut record = OeeRecord::empty(press(), window, Granularity::Minute);
        record.planned_time_ms = planned_s * 1000;
        record.operating_time_ms = operating_s * 1000;
        record.theoretical_output = operating_s as f64 / 6.0;
        record.actual_output = total;
        record.good_count = good;
        record.losses.breakdown_ms = (planned_s - operating_s) * 1000;
        record.losses.production_defect_units = total - good;
        record.sample_count = 2;
        record
    }

    #[test]
    fn rates_follow_iso_definitions() {
        let window = TimeWindow::new(ts(0), ts(450)).unwrap();
        let mut record = OeeRecord::empty(press(), window, Granularity::Raw);
        record.planned_time_ms = 420 * 60_000;
        record.operating_time_ms = 360 * 60_000;
        record.theoretical_output = 360.0;
        record.actual_output = 300;
        record.good_count = 285;

        assert!((record.availability() - 360.0 / 420.0).abs() < EPS);
        assert!((record.performance() - 300.0 / 360.0).abs() < EPS);
        assert!((record.quality() - 0.95).abs() < EPS);
        let product = record.availability() * record.performance() * record.quality();
        assert!((record.oee() - product).abs() < EPS);
        assert!((record.oee() - 0.678).abs() < 0.001);
    }

    #[test]
    #[expect(
        clippy::float_cmp,
        reason = "exact equality intended for edge-case policies"
    )]
    fn edge_case_policies() {
        let window = TimeWindow::new(ts(0), ts(1)).unwrap();
        let record = OeeRecord::empty(press(), window, Granularity::Minute);
        assert_eq!(record.availability(), 0.0);
        assert_eq!(record.performance(), 0.0);
        assert_eq!(record.quality(), 1.0);
        assert_eq!(record.oee(), 0.0);
    }

    #[test]
    #[expect(clippy::float_cmp, reason = "performance is capped at exactly 1.0")]
    fn performance_is_capped_and_excess_kept_as_speed_gain() {
        let window = TimeWindow::new(ts(0), ts(60)).unwrap();
        let mut record = OeeRecord::empty(press(), window, Granularity::Hour);
        record.planned_time_ms = 3_600_000;
        record.operating_time_ms = 3_600_000;
        record.theoretical_output = 60.0;
        record.actual_output = 66;
        record.good_count = 66;
        assert_eq!(record.performance(), 1.0);
        assert!((record.speed_gain_units() - 6.0).abs() < EPS);
        assert!(record.speed_loss_units().abs() < EPS);
        assert!(record.oee() <= 1.0);
    }

    #[test]
    fn combine_recomputes_rates_from_sums() {
        // Unequal planned time: averaging the two availabilities would give
        // (1.0 + 0.0) / 2 = 0.5; the weighted answer is 50 / 60.
        let a = minute_record(0, 50, 50, 8, 8);
        let b = minute_record(1, 10, 0, 0, 0);
        let window = TimeWindow::new(ts(0), ts(5)).unwrap();
        let combined = combine(&press(), window, Granularity::FiveMinute, &[b, a]).unwrap();
        assert_eq!(combined.planned_time_ms, 60_000);
        assert_eq!(combined.operating_time_ms, 50_000);
        assert!((combined.availability() - 50.0 / 60.0).abs() < EPS);
        // Only two of five children supplied.
        assert!(combined.low_confidence);
    }

    #[test]
    fn hierarchy_sum_of_minutes_matches_hour() {
        let minutes: Vec<OeeRecord> = (0..60)
            .map(|m| {
                let operating = (m * 7) % 61;
                let total = m % 9;
                minute_record(m, 60, operating, total, total - (m % 3).min(total))
            })
            .collect();

        let five_minute: Vec<OeeRecord> = (0..12)
            .map(|i| {
                let window = TimeWindow::new(ts(i * 5), ts(i * 5 + 5)).unwrap();
                let children: Vec<OeeRecord> = minutes
                    .iter()
                    .filter(|r| window.contains(r.window.start))
                    .cloned()
                    .collect();
                combine(&press(), window, Granularity::FiveMinute, &children).unwrap()
            })
            .collect();
        let hour_window = TimeWindow::new(ts(0), ts(60)).unwrap();
        let hour = combine(&press(), hour_window, Granularity::Hour, &five_minute).unwrap();

        let planned: i64 = minutes.iter().map(|r| r.planned_time_ms).sum();
        let operating: i64 = minutes.iter().map(|r| r.operating_time_ms).sum();
        let theoretical: f64 = minutes.iter().map(|r| r.theoretical_output).sum();
        let total: i64 = minutes.iter().map(|r| r.actual_output).sum();
        let good: i64 = minutes.iter().map(|r| r.good_count).sum();

        assert_eq!(hour.planned_time_ms, planned);
        assert_eq!(hour.operating_time_ms, operating);
        assert_eq!(hour.actual_output, total);
        assert_eq!(hour.good_count, good);
        assert!((hour.theoretical_output - theoretical).abs() < 1e-6);
        let availability = operating as f64 / planned as f64;
        assert!((hour.availability() - availability).abs() < EPS);
        assert!(!hour.low_confidence);
    }

    #[test]
    fn combine_rejects_wrong_level() {
        let hour_window = TimeWindow::new(ts(0), ts(60)).unwrap();
        let child = minute_record(0, 60, 60, 1, 1);
        let err = combine(&press(), hour_window, Granularity::Hour, &[child]).unwrap_err();
        assert!(matches!(err, CalcError::HierarchyMismatch { .. }));
    }

    #[test]
    fn combine_is_deterministic() {
        let children: Vec<OeeRecord> = (0..5).map(|m| minute_record(m, 60, 37, 5, 4)).collect();
        let mut reversed = children.clone();
        reversed.reverse();
        let window = TimeWindow::new(ts(0), ts(5)).unwrap();
        let a = combine(&press(), window, Granularity::FiveMinute, &children).unwrap();
        let b = combine(&press(), window, Granularity::FiveMinute, &reversed).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn reconcile_detects_unattributed_time() {
        let mut record = minute_record(0, 60, 30, 0, 0);
        record.losses.breakdown_ms = 10_000;
        let err = record.reconcile().unwrap_err();
        assert_eq!(
            err.to_string(),
            "time losses do not reconcile: attributed 10000, expected 30000"
        );
    }
}
