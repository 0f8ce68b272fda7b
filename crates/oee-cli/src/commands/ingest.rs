//! Ingest command: appends raw events read as JSON lines.
//!
//! Each line carries a `type` tag:
//!
//! - `state_open`: an [`EquipmentState`] starting a new interval (closes the
//!   previous open one)
//! - `state_close`: `{"equipment_id", "end_time"}` closing the open interval
//! - `state`: a closed [`EquipmentState`]
//! - `count`: a [`ProductionCount`]
//! - `quality`: a [`QualityEvent`]

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use oee_core::{EquipmentId, EquipmentState, ErrorKind, ProductionCount, QualityEvent};
use oee_db::{Database, DbError, IngestReceipt};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngestEvent {
    StateOpen(EquipmentState),
    StateClose {
        equipment_id: EquipmentId,
        end_time: DateTime<Utc>,
    },
    State(EquipmentState),
    Count(ProductionCount),
    Quality(QualityEvent),
}

impl IngestEvent {
    fn apply(&self, db: &mut Database) -> Result<IngestReceipt, DbError> {
        match self {
            Self::StateOpen(state) => db.open_state(state),
            Self::StateClose {
                equipment_id,
                end_time,
            } => db.close_state(equipment_id, *end_time),
            Self::State(state) => db.append_state(state),
            Self::Count(count) => db.append_count(count),
            Self::Quality(event) => db.append_quality(event),
        }
    }
}

/// What an ingest run stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub accepted: usize,
    pub rejected: usize,
    pub invalidated_windows: usize,
}

/// Parses every line first so a malformed file stores nothing.
pub fn parse_events<R: BufRead>(reader: R) -> Result<Vec<(usize, IngestEvent)>> {
    let mut events = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.with_context(|| format!("failed to read line {line_no}"))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let event: IngestEvent = serde_json::from_str(trimmed)
            .with_context(|| format!("invalid event on line {line_no}"))?;
        events.push((line_no, event));
    }
    Ok(events)
}

/// Appends events in order.
///
/// Out-of-order and invalid events are reported and skipped; a store
/// failure aborts the run.
pub fn ingest(db: &mut Database, events: &[(usize, IngestEvent)]) -> Result<IngestSummary> {
    let mut summary = IngestSummary::default();
    for (line_no, event) in events {
        match event.apply(db) {
            Ok(receipt) => {
                summary.accepted += 1;
                summary.invalidated_windows += receipt.invalidated_windows;
            }
            Err(err) if err.kind() == ErrorKind::TransientStore => {
                return Err(err).with_context(|| format!("failed to store line {line_no}"));
            }
            Err(err) => {
                tracing::warn!(line = line_no, kind = %err.kind(), error = %err, "event rejected");
                summary.rejected += 1;
            }
        }
    }
    Ok(summary)
}

pub fn run<R: BufRead, W: Write>(db: &mut Database, reader: R, writer: &mut W) -> Result<()> {
    let events = parse_events(reader)?;
    let summary = ingest(db, &events)?;
    writeln!(
        writer,
        "Ingested {} events ({} rejected), {} windows invalidated",
        summary.accepted, summary.rejected, summary.invalidated_windows
    )?;
    Ok(())
}
