//! Master-data commands: load a TOML document, show what is stored.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Format, Toml};
use oee_core::MasterData;
use oee_db::Database;

/// Parses a master-data TOML document.
pub fn parse_master(contents: &str) -> Result<MasterData> {
    Figment::from(Toml::string(contents))
        .extract()
        .context("invalid master data")
}

/// Validates and stores the document at `path`.
pub fn load<W: Write>(db: &mut Database, path: &Path, writer: &mut W) -> Result<()> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let data = parse_master(&contents)?;
    let summary = db
        .load_master_data(&data)
        .context("failed to store master data")?;
    tracing::info!(
        equipment = summary.equipment,
        reason_codes = summary.reason_codes,
        shifts = summary.shifts,
        "master data loaded"
    );

    writeln!(
        writer,
        "Loaded {} equipment, {} reason codes, {} shifts ({} windows invalidated)",
        summary.equipment, summary.reason_codes, summary.shifts, summary.invalidated_windows
    )?;
    Ok(())
}

pub fn show<W: Write>(db: &Database, json: bool, writer: &mut W) -> Result<()> {
    let data = db.master_data()?;
    if json {
        writeln!(writer, "{}", serde_json::to_string_pretty(&data)?)?;
        return Ok(());
    }

    if data.equipment.is_empty() {
        writeln!(writer, "No master data loaded.")?;
        return Ok(());
    }

    writeln!(writer, "Equipment:")?;
    for equipment in &data.equipment {
        let site = equipment.site_id.as_deref().unwrap_or("-");
        writeln!(
            writer,
            "  {:<12} site {:<10} cycle {}s",
            equipment.id, site, equipment.ideal_cycle_time_secs
        )?;
    }

    writeln!(writer, "Reason codes:")?;
    for entry in &data.reason_codes {
        let line = format!(
            "  {:<12} {:<18} {:<10} {}",
            entry.code,
            entry.loss_category,
            entry.downtime,
            entry.description.as_deref().unwrap_or("")
        );
        writeln!(writer, "{}", line.trim_end())?;
    }

    writeln!(writer, "Shifts:")?;
    for shift in &data.shifts {
        writeln!(
            writer,
            "  {:<12} {:<10} {} - {} ({} min, {} min break)",
            shift.id,
            shift.scope,
            shift.planned_start.format("%Y-%m-%d %H:%M"),
            shift.planned_end.format("%H:%M"),
            shift.planned_minutes,
            shift.break_minutes
        )?;
    }
    Ok(())
}
