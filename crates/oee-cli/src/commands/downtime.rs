//! Downtime command: Pareto of non-producing time by reason code.

use std::io::Write;

use anyhow::{Result, bail};
use chrono::Utc;
use oee_core::downtime_pareto;
use oee_db::Database;

use crate::commands::util::{format_duration, parse_equipment, parse_window, percent, share_bar};

pub fn run<W: Write>(
    db: &Database,
    equipment: &str,
    start: &str,
    end: &str,
    json: bool,
    writer: &mut W,
) -> Result<()> {
    let equipment = parse_equipment(equipment)?;
    if db.equipment(&equipment)?.is_none() {
        bail!("unknown equipment {equipment}");
    }
    let period = parse_window(start, end)?;
    let states = db.states_between(&equipment, period)?;
    let entries = downtime_pareto(&states, &db.reason_table()?, period, Utc::now())?;

    if json {
        writeln!(writer, "{}", serde_json::to_string_pretty(&entries)?)?;
        return Ok(());
    }

    if entries.is_empty() {
        writeln!(writer, "No downtime recorded for {equipment}.")?;
        return Ok(());
    }

    let total: i64 = entries.iter().map(|e| e.total_ms).sum();
    writeln!(
        writer,
        "Downtime for {equipment}: {} over {} stops",
        format_duration(total),
        entries.iter().map(|e| e.occurrences).sum::<i64>()
    )?;
    for entry in &entries {
        writeln!(
            writer,
            "  {:<12} {:<12} {:>3}x {:>8}  {} {:>6}",
            entry.reason_code,
            entry.loss_category,
            entry.occurrences,
            format_duration(entry.total_ms),
            share_bar(entry.share),
            percent(entry.share)
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::{db_with_events, ts};
    use insta::assert_snapshot;
    use oee_core::{EquipmentId, EquipmentState, ReasonCode, ShiftId, StateCategory};

    #[test]
    fn ranks_reasons_by_lost_time() {
        let (_temp, mut db) = db_with_events();
        db.append_state(&EquipmentState {
            equipment_id: EquipmentId::new("press-01").unwrap(),
            category: StateCategory::Setup,
            reason_code: Some(ReasonCode::new("CHANGEOVER").unwrap()),
            start_time: ts("2025-03-03T07:00:00Z"),
            end_time: Some(ts("2025-03-03T07:20:00Z")),
            shift_id: ShiftId::new("day-1").unwrap(),
        })
        .unwrap();

        let mut output = Vec::new();
        run(&db, "press-01", "2025-03-03T06:00:00Z", "2025-03-03T08:00:00Z", false, &mut output)
            .unwrap();
        let output = String::from_utf8(output).unwrap();
        assert_snapshot!(output.trim_end(), @r"
        Downtime for press-01: 30m over 2 stops
          CHANGEOVER   setup          1x      20m  ███████░░░  66.7%
          JAM          breakdown      1x      10m  ███░░░░░░░  33.3%
        ");
    }

    #[test]
    fn unknown_equipment_is_rejected() {
        let (_temp, db) = db_with_events();
        let mut output = Vec::new();
        let err = run(&db, "mill-07", "2025-03-03", "2025-03-04", false, &mut output).unwrap_err();
        assert!(err.to_string().contains("unknown equipment mill-07"));
    }
}
