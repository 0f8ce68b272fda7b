//! Backfill command: recompute whole days in parallel.

use std::io::Write;
use std::path::Path;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use oee_core::EquipmentId;
use oee_db::Database;

use crate::commands::util::{parse_equipment, parse_window};

pub fn run<W: Write>(
    db: &Database,
    db_path: &Path,
    equipment: &[String],
    start: &str,
    end: &str,
    writer: &mut W,
) -> Result<()> {
    run_at(db, db_path, equipment, start, end, Utc::now(), writer)
}

fn run_at<W: Write>(
    db: &Database,
    db_path: &Path,
    equipment: &[String],
    start: &str,
    end: &str,
    now: DateTime<Utc>,
    writer: &mut W,
) -> Result<()> {
    let range = parse_window(start, end)?;
    let ids: Vec<EquipmentId> = if equipment.is_empty() {
        db.list_equipment()?.into_iter().map(|spec| spec.id).collect()
    } else {
        equipment
            .iter()
            .map(|id| parse_equipment(id))
            .collect::<Result<_>>()?
    };
    if ids.is_empty() {
        bail!("no equipment to backfill; load master data first");
    }

    let reports = oee_refresh::backfill(db_path, &ids, range, now)?;
    for report in &reports {
        writeln!(
            writer,
            "{}: {} windows recomputed, {} failed, {} reliability days",
            report.equipment_id, report.windows, report.failed, report.reliability_days
        )?;
        if report.skipped > 0 {
            writeln!(
                writer,
                "{}: {} windows skipped while leased to a refresh worker",
                report.equipment_id, report.skipped
            )?;
        }
    }
    Ok(())
}
