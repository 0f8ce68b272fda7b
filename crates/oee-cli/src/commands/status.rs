//! Status command: refresh queue overview or live equipment status.

use std::io::Write;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use oee_core::current_status;
use oee_db::Database;

use crate::commands::util::{format_duration, parse_equipment};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M";

pub fn run<W: Write>(db: &Database, equipment: Option<&str>, json: bool, writer: &mut W) -> Result<()> {
    match equipment {
        Some(id) => equipment_status(db, id, json, Utc::now(), writer),
        None => queue_status(db, json, writer),
    }
}

fn equipment_status<W: Write>(
    db: &Database,
    id: &str,
    json: bool,
    now: DateTime<Utc>,
    writer: &mut W,
) -> Result<()> {
    let equipment = parse_equipment(id)?;
    if db.equipment(&equipment)?.is_none() {
        bail!("unknown equipment {equipment}");
    }
    let latest: Vec<_> = db.latest_state(&equipment)?.into_iter().collect();
    let status = current_status(&latest, &db.reason_table()?, now);

    if json {
        writeln!(writer, "{}", serde_json::to_string_pretty(&status)?)?;
        return Ok(());
    }

    let Some(status) = status else {
        writeln!(writer, "{equipment}: no state reported yet")?;
        return Ok(());
    };
    writeln!(
        writer,
        "{}: {} since {} ({}{})",
        status.equipment_id,
        status.category,
        status.since.format(TIME_FORMAT),
        format_duration(status.duration_ms),
        if status.open { "" } else { ", closed" }
    )?;
    if let Some(reason) = &status.reason_code {
        match status.loss_category {
            Some(loss) => writeln!(writer, "  Reason  {reason} ({loss})")?,
            None => writeln!(writer, "  Reason  {reason}")?,
        }
    }
    writeln!(writer, "  Shift   {}", status.shift_id)?;
    Ok(())
}

fn queue_status<W: Write>(db: &Database, json: bool, writer: &mut W) -> Result<()> {
    let status = db.refresh_status()?;
    if json {
        writeln!(writer, "{}", serde_json::to_string_pretty(&status)?)?;
        return Ok(());
    }

    if status.queue.is_empty() {
        writeln!(writer, "Refresh queue is empty.")?;
    } else {
        writeln!(writer, "Queue:")?;
        for row in &status.queue {
            writeln!(writer, "  {:<6} {:<12} {:>8}", row.granularity, row.status, row.count)?;
        }
    }

    if !status.watermarks.is_empty() {
        writeln!(writer, "Watermarks:")?;
        for row in &status.watermarks {
            writeln!(
                writer,
                "  {:<12} {:<6} {}",
                row.equipment_id,
                row.granularity,
                row.watermark.format(TIME_FORMAT)
            )?;
        }
    }

    if status.failing.is_empty() {
        writeln!(writer, "No failing windows.")?;
    } else {
        writeln!(writer, "Failing windows:")?;
        for row in &status.failing {
            writeln!(
                writer,
                "  {} {} {} attempt {} [{}]: {}",
                row.key.equipment_id,
                row.key.granularity,
                row.key.window.start.format(TIME_FORMAT),
                row.attempts,
                row.error_kind.as_deref().unwrap_or("unknown"),
                row.last_error
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::{db_with_events, seeded_db, ts};
    use insta::assert_snapshot;
    use oee_core::{EquipmentId, Granularity};

    #[test]
    fn closed_interval_is_reported_as_closed() {
        let (_temp, db) = db_with_events();
        let mut output = Vec::new();
        equipment_status(&db, "press-01", false, ts("2025-03-03T08:00:00Z"), &mut output).unwrap();
        let output = String::from_utf8(output).unwrap();
        assert_snapshot!(output.trim_end(), @r"
        press-01: DOWN since 2025-03-03 06:50 (10m, closed)
          Reason  JAM (breakdown)
          Shift   day-1
        ");
    }

    #[test]
    fn equipment_without_states() {
        let (_temp, db) = seeded_db();
        let mut output = Vec::new();
        equipment_status(&db, "press-01", true, ts("2025-03-03T08:00:00Z"), &mut output).unwrap();
        assert_eq!(String::from_utf8(output).unwrap().trim(), "null");
    }

    #[test]
    fn queue_overview_lists_pending_windows_and_watermarks() {
        let (_temp, mut db) = seeded_db();
        let press = EquipmentId::new("press-01").unwrap();
        let now = ts("2025-03-03T06:10:00Z");
        db.init_watermark(&press, Granularity::Minute, ts("2025-03-03T06:00:00Z"))
            .unwrap();
        db.enqueue_until(&press, Granularity::Minute, ts("2025-03-03T06:05:00Z"), 100, now)
            .unwrap();

        let mut output = Vec::new();
        run(&db, None, false, &mut output).unwrap();
        let output = String::from_utf8(output).unwrap();
        assert_snapshot!(output.trim_end(), @r"
        Queue:
          1min   PENDING             5
        Watermarks:
          press-01     1min   2025-03-03 06:00
        No failing windows.
        ");
    }
}
