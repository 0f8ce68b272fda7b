//! Query commands: read materialized OEE and reliability results.

use std::io::Write;

use anyhow::{Context, Result};
use oee_core::{Granularity, OeeMetrics, ReliabilityMetrics};
use oee_db::{Database, QueryResult};

use crate::commands::util::{format_duration, parse_datetime, parse_equipment, parse_window, percent};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M";

pub fn oee<W: Write>(
    db: &Database,
    equipment: &str,
    granularity: &str,
    start: &str,
    json: bool,
    writer: &mut W,
) -> Result<()> {
    let equipment = parse_equipment(equipment)?;
    let granularity: Granularity = granularity
        .parse()
        .with_context(|| format!("invalid granularity {granularity:?}"))?;
    let start = parse_datetime(start)?;

    let result = db
        .query_oee(&equipment, granularity, start)?
        .map(|record| record.metrics());
    if json {
        writeln!(writer, "{}", serde_json::to_string_pretty(&result)?)?;
        return Ok(());
    }

    match result {
        QueryResult::Ready { record } => write_oee(writer, &record)?,
        QueryResult::NotAvailable { reason } => writeln!(
            writer,
            "No {granularity} result for {equipment} at {}: {reason}",
            start.format(TIME_FORMAT)
        )?,
    }
    Ok(())
}

pub fn reliability<W: Write>(
    db: &Database,
    equipment: &str,
    start: &str,
    end: &str,
    json: bool,
    writer: &mut W,
) -> Result<()> {
    let equipment = parse_equipment(equipment)?;
    let period = parse_window(start, end)?;

    let result = db
        .query_reliability(&equipment, period)?
        .map(|record| record.metrics());
    if json {
        writeln!(writer, "{}", serde_json::to_string_pretty(&result)?)?;
        return Ok(());
    }

    match result {
        QueryResult::Ready { record } => write_reliability(writer, &record)?,
        QueryResult::NotAvailable { reason } => writeln!(
            writer,
            "No reliability result for {equipment} over {} - {}: {reason}",
            period.start.format(TIME_FORMAT),
            period.end.format(TIME_FORMAT)
        )?,
    }
    Ok(())
}

/// Human-readable OEE breakdown.
pub(crate) fn write_oee<W: Write>(writer: &mut W, m: &OeeMetrics) -> Result<()> {
    writeln!(
        writer,
        "{} {} {} - {}{}",
        m.equipment_id,
        m.granularity,
        m.window_start.format(TIME_FORMAT),
        m.window_end.format(TIME_FORMAT),
        if m.low_confidence { " (low confidence)" } else { "" }
    )?;
    writeln!(writer, "  Availability   {:>7}", percent(m.availability))?;
    writeln!(writer, "  Performance    {:>7}", percent(m.performance))?;
    writeln!(writer, "  Quality        {:>7}", percent(m.quality))?;
    writeln!(writer, "  OEE            {:>7}", percent(m.oee))?;
    writeln!(
        writer,
        "  Time           {} operating of {} planned",
        format_duration(m.operating_time_ms),
        format_duration(m.planned_time_ms)
    )?;
    writeln!(
        writer,
        "  Output         {} made ({} good) of {:.1} theoretical",
        m.actual_output, m.good_count, m.theoretical_output
    )?;
    let losses = &m.losses;
    writeln!(writer, "Losses:")?;
    writeln!(writer, "  Breakdown      {}", format_duration(losses.breakdown_ms))?;
    writeln!(writer, "  Setup          {}", format_duration(losses.setup_ms))?;
    writeln!(writer, "  Minor stops    {}", format_duration(losses.minor_stop_ms))?;
    writeln!(writer, "  Speed loss     {:.1} units", losses.speed_loss_units)?;
    writeln!(writer, "  Startup        {} units", losses.startup_defect_units)?;
    writeln!(writer, "  Defects        {} units", losses.production_defect_units)?;
    Ok(())
}

fn write_reliability<W: Write>(writer: &mut W, m: &ReliabilityMetrics) -> Result<()> {
    let hours = |value: Option<f64>| value.map_or_else(|| "-".to_string(), |h| format!("{h:.2}h"));
    writeln!(
        writer,
        "{} {} - {}",
        m.equipment_id,
        m.period_start.format(TIME_FORMAT),
        m.period_end.format(TIME_FORMAT)
    )?;
    writeln!(writer, "  Failures       {}", m.failure_count)?;
    writeln!(writer, "  Downtime       {:.2}h", m.total_downtime_hours)?;
    writeln!(writer, "  MTBF           {}", hours(m.mtbf_hours))?;
    writeln!(writer, "  MTTR           {}", hours(m.mttr_hours))?;
    writeln!(writer, "  Availability   {}", percent(m.availability))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::{db_with_events, ts};
    use insta::assert_snapshot;
    use oee_core::{EquipmentId, ReliabilityRecord, TimeWindow};
    use oee_refresh::{MasterSnapshot, compute_window};
    use oee_db::WindowKey;

    fn output_of(f: impl FnOnce(&mut Vec<u8>) -> Result<()>) -> String {
        let mut output = Vec::new();
        f(&mut output).unwrap();
        String::from_utf8(output).unwrap()
    }

    #[test]
    fn unknown_window_is_not_available() {
        let (_temp, db) = db_with_events();
        let output = output_of(|w| oee(&db, "press-01", "hour", "2025-03-03T06:00:00Z", false, w));
        assert_snapshot!(output.trim_end(), @"No hour result for press-01 at 2025-03-03 06:00: not yet computed");

        let output = output_of(|w| oee(&db, "press-01", "hour", "2025-03-03T06:30:00Z", true, w));
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["status"], "not_available");
        assert_eq!(value["reason"], "window start is not on a granularity boundary");
    }

    #[test]
    fn stored_hour_is_reported() {
        let (_temp, mut db) = db_with_events();
        let master = MasterSnapshot::load(&db).unwrap();
        let equipment = EquipmentId::new("press-01").unwrap();
        for granularity in [Granularity::Minute, Granularity::FiveMinute, Granularity::Hour] {
            let window = TimeWindow::new(ts("2025-03-03T06:00:00Z"), ts("2025-03-03T07:00:00Z")).unwrap();
            for window in granularity.windows_covering(window.start, window.end) {
                let key = WindowKey {
                    equipment_id: equipment.clone(),
                    granularity,
                    window,
                };
                let record = compute_window(&db, &master, &key).unwrap();
                db.store_rollup(&record, ts("2025-03-03T08:00:00Z")).unwrap();
            }
        }

        let output = output_of(|w| oee(&db, "press-01", "hour", "2025-03-03T06:00:00Z", false, w));
        assert_snapshot!(output.trim_end(), @r"
        press-01 hour 2025-03-03 06:00 - 2025-03-03 07:00
          Availability     83.3%
          Performance      80.0%
          Quality          95.0%
          OEE              63.3%
          Time           50m operating of 1h 0m planned
          Output         40 made (38 good) of 50.0 theoretical
        Losses:
          Breakdown      10m
          Setup          0m
          Minor stops    0m
          Speed loss     10.0 units
          Startup        0 units
          Defects        2 units
        ");
    }

    #[test]
    fn reliability_reads_the_stored_period() {
        let (_temp, db) = db_with_events();
        let period = TimeWindow::new(ts("2025-03-03T00:00:00Z"), ts("2025-03-04T00:00:00Z")).unwrap();
        let record = ReliabilityRecord {
            equipment_id: EquipmentId::new("press-01").unwrap(),
            period,
            failure_count: 2,
            total_downtime_ms: 3_600_000,
        };
        db.upsert_reliability(&record, ts("2025-03-04T00:05:00Z")).unwrap();

        let output = output_of(|w| reliability(&db, "press-01", "2025-03-03", "2025-03-04", false, w));
        assert_snapshot!(output.trim_end(), @r"
        press-01 2025-03-03 00:00 - 2025-03-04 00:00
          Failures       2
          Downtime       1.00h
          MTBF           11.50h
          MTTR           0.50h
          Availability   95.8%
        ");

        let output = output_of(|w| reliability(&db, "press-01", "2025-03-02", "2025-03-03", false, w));
        assert!(output.contains("not yet computed"));
    }
}
