//! Compute command: OEE straight from raw events, nothing stored.

use std::io::Write;

use anyhow::{Context, Result, bail};
use oee_core::ShiftId;
use oee_db::Database;
use oee_refresh::{MasterSnapshot, compute_direct, compute_shift};

use crate::commands::query::write_oee;
use crate::commands::util::{parse_equipment, parse_window};

pub fn run<W: Write>(
    db: &Database,
    equipment: &str,
    start: Option<&str>,
    end: Option<&str>,
    shift: Option<&str>,
    json: bool,
    writer: &mut W,
) -> Result<()> {
    let equipment = parse_equipment(equipment)?;
    let master = MasterSnapshot::load(db)?;

    let record = match (start, end, shift) {
        (_, _, Some(shift)) => {
            let shift = ShiftId::new(shift).with_context(|| format!("invalid shift id {shift:?}"))?;
            compute_shift(db, &master, &equipment, &shift)?
        }
        (Some(start), Some(end), None) => {
            let window = parse_window(start, end)?;
            compute_direct(db, &master, &equipment, window)?
        }
        _ => bail!("either --shift or both --start and --end are required"),
    };

    let metrics = record.metrics();
    if json {
        writeln!(writer, "{}", serde_json::to_string_pretty(&metrics)?)?;
    } else {
        write_oee(writer, &metrics)?;
    }
    Ok(())
}
