//! Invalidate command: queue every overlapping window for recomputation.

use std::io::Write;

use anyhow::{Result, bail};
use oee_db::Database;

use crate::commands::util::{parse_equipment, parse_window};

pub fn run<W: Write>(db: &mut Database, equipment: &str, start: &str, end: &str, writer: &mut W) -> Result<()> {
    let equipment = parse_equipment(equipment)?;
    if db.equipment(&equipment)?.is_none() {
        bail!("unknown equipment {equipment}");
    }
    let window = parse_window(start, end)?;
    let invalidated = db.invalidate(&equipment, window)?;
    writeln!(writer, "Invalidated {invalidated} windows for {equipment}")?;
    Ok(())
}
