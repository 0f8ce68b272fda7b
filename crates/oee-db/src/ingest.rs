//! Event store: appends raw events and serves them back to the calculators.
//!
//! Appends never drop late data. An event whose timestamp falls into a window
//! that was already aggregated is stored like any other and the affected
//! windows are invalidated in the same transaction.

use chrono::{DateTime, Duration, Utc};
use oee_core::{
    EquipmentId, EquipmentState, ProductionCount, QualityEvent, TimeWindow, ValidationError,
};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::master::ensure_equipment;
use crate::queue::invalidate_range;
use crate::{
    Database, DbError, StoreChange, conversion_error, format_timestamp, id_col, opt_ts_col,
    parse_col, ts_col,
};

/// What an append did besides storing the event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReceipt {
    /// Rollup windows reset to pending because the event arrived late.
    pub invalidated_windows: usize,
}

const STATE_COLUMNS: &str =
    "equipment_id, category, reason_code, start_time, end_time, shift_id";

impl Database {
    /// Opens a state interval, closing the currently open one at its start.
    ///
    /// States carrying an `end_time` are stored as closed intervals.
    pub fn open_state(&mut self, state: &EquipmentState) -> Result<IngestReceipt, DbError> {
        if state.end_time.is_some() {
            return self.append_state(state);
        }
        state.validate()?;
        let equipment = &state.equipment_id;
        let tx = self.conn.transaction()?;
        ensure_equipment(&tx, equipment)?;

        let latest = tx
            .query_row(
                "
                SELECT id, start_time, end_time FROM equipment_states
                WHERE equipment_id = ?
                ORDER BY start_time DESC
                LIMIT 1
                ",
                [equipment.as_str()],
                |row| Ok((row.get::<_, i64>(0)?, ts_col(row, 1)?, opt_ts_col(row, 2)?)),
            )
            .optional()?;

        let mut closed_previous = false;
        if let Some((row_id, start, end)) = latest {
            // The open interval already counted as running up to now, so
            // closing it only changes windows from the new start on.
            let overlaps = start >= state.start_time || end.is_some_and(|e| e > state.start_time);
            if overlaps {
                return Err(DbError::StateOverlap {
                    equipment: equipment.to_string(),
                    start: state.start_time,
                    existing: start,
                });
            }
            if end.is_none() {
                tx.execute(
                    "UPDATE equipment_states SET end_time = ? WHERE id = ?",
                    params![format_timestamp(state.start_time), row_id],
                )?;
                closed_previous = true;
            }
        }

        insert_state(&tx, state)?;
        let invalidated = invalidate_range(&tx, equipment, state.start_time, None)?;
        tx.commit()?;

        if closed_previous {
            self.publish(StoreChange::StateClosed {
                equipment_id: equipment.clone(),
                at: state.start_time,
            });
        }
        self.publish(StoreChange::StateOpened {
            equipment_id: equipment.clone(),
            at: state.start_time,
        });
        Ok(self.receipt(equipment, state.start_time, None, invalidated))
    }

    /// Closes the open interval of `equipment` at `end`.
    pub fn close_state(
        &mut self,
        equipment: &EquipmentId,
        end: DateTime<Utc>,
    ) -> Result<IngestReceipt, DbError> {
        let tx = self.conn.transaction()?;
        let open = tx
            .query_row(
                "SELECT id, start_time FROM equipment_states WHERE equipment_id = ? AND end_time IS NULL",
                [equipment.as_str()],
                |row| Ok((row.get::<_, i64>(0)?, ts_col(row, 1)?)),
            )
            .optional()?;
        let Some((row_id, start)) = open else {
            return Err(DbError::NoOpenState {
                equipment: equipment.to_string(),
            });
        };
        if end <= start {
            return Err(ValidationError::NonPositiveInterval { start, end }.into());
        }
        tx.execute(
            "UPDATE equipment_states SET end_time = ? WHERE id = ?",
            params![format_timestamp(end), row_id],
        )?;
        let invalidated = invalidate_range(&tx, equipment, start, Some(end))?;
        tx.commit()?;

        self.publish(StoreChange::StateClosed {
            equipment_id: equipment.clone(),
            at: end,
        });
        Ok(self.receipt(equipment, start, Some(end), invalidated))
    }

    /// Stores an already-closed interval, e.g. from a historical import.
    pub fn append_state(&mut self, state: &EquipmentState) -> Result<IngestReceipt, DbError> {
        state.validate()?;
        let Some(end) = state.end_time else {
            return self.open_state(state);
        };
        let equipment = &state.equipment_id;
        let tx = self.conn.transaction()?;
        ensure_equipment(&tx, equipment)?;

        let clash = tx
            .query_row(
                "
                SELECT start_time FROM equipment_states
                WHERE equipment_id = ?1
                  AND start_time < ?2
                  AND (end_time IS NULL OR end_time > ?3)
                ORDER BY start_time
                LIMIT 1
                ",
                params![
                    equipment.as_str(),
                    format_timestamp(end),
                    format_timestamp(state.start_time)
                ],
                |row| ts_col(row, 0),
            )
            .optional()?;
        if let Some(existing) = clash {
            return Err(DbError::StateOverlap {
                equipment: equipment.to_string(),
                start: state.start_time,
                existing,
            });
        }

        insert_state(&tx, state)?;
        let invalidated = invalidate_range(&tx, equipment, state.start_time, Some(end))?;
        tx.commit()?;

        self.publish(StoreChange::StateClosed {
            equipment_id: equipment.clone(),
            at: end,
        });
        Ok(self.receipt(equipment, state.start_time, Some(end), invalidated))
    }

    /// Appends a production count increment.
    pub fn append_count(&mut self, count: &ProductionCount) -> Result<IngestReceipt, DbError> {
        count.validate()?;
        let equipment = &count.equipment_id;
        let tx = self.conn.transaction()?;
        ensure_equipment(&tx, equipment)?;
        tx.execute(
            "
            INSERT INTO production_counts
            (equipment_id, timestamp, total_count, good_count, reject_count, rework_count, shift_id, ingested_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
            params![
                equipment.as_str(),
                format_timestamp(count.timestamp),
                count.total_count,
                count.good_count,
                count.reject_count,
                count.rework_count,
                count.shift_id.as_str(),
                format_timestamp(Utc::now()),
            ],
        )?;
        let end = count.timestamp + Duration::milliseconds(1);
        let invalidated = invalidate_range(&tx, equipment, count.timestamp, Some(end))?;
        tx.commit()?;

        self.publish(StoreChange::CountAppended {
            equipment_id: equipment.clone(),
            at: count.timestamp,
        });
        Ok(self.receipt(equipment, count.timestamp, Some(end), invalidated))
    }

    /// Appends a quality event.
    pub fn append_quality(&mut self, event: &QualityEvent) -> Result<IngestReceipt, DbError> {
        event.validate()?;
        let equipment = &event.equipment_id;
        let tx = self.conn.transaction()?;
        ensure_equipment(&tx, equipment)?;
        tx.execute(
            "
            INSERT INTO quality_events
            (equipment_id, timestamp, defect_category, defect_count, severity, ingested_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
            params![
                equipment.as_str(),
                format_timestamp(event.timestamp),
                event.defect_category,
                event.defect_count,
                event.severity.as_str(),
                format_timestamp(Utc::now()),
            ],
        )?;
        let end = event.timestamp + Duration::milliseconds(1);
        let invalidated = invalidate_range(&tx, equipment, event.timestamp, Some(end))?;
        tx.commit()?;

        self.publish(StoreChange::QualityAppended {
            equipment_id: equipment.clone(),
            at: event.timestamp,
        });
        Ok(self.receipt(equipment, event.timestamp, Some(end), invalidated))
    }

    /// Logs and publishes late-data invalidation, then builds the receipt.
    fn receipt(
        &self,
        equipment: &EquipmentId,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        invalidated: usize,
    ) -> IngestReceipt {
        if invalidated > 0 {
            tracing::warn!(
                equipment = %equipment,
                since = %start,
                windows = invalidated,
                kind = "out_of_order",
                "late event landed in aggregated windows; invalidated"
            );
            let window_end = end
                .unwrap_or_else(Utc::now)
                .max(start + Duration::milliseconds(1));
            if let Ok(window) = TimeWindow::new(start, window_end) {
                self.publish(StoreChange::Invalidated {
                    equipment_id: equipment.clone(),
                    window,
                    windows: invalidated,
                });
            }
        }
        IngestReceipt {
            invalidated_windows: invalidated,
        }
    }

    /// State intervals of `equipment` that overlap `window`, by start time.
    pub fn states_between(
        &self,
        equipment: &EquipmentId,
        window: TimeWindow,
    ) -> Result<Vec<EquipmentState>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "
            SELECT {STATE_COLUMNS}
            FROM equipment_states
            WHERE equipment_id = ?1 AND start_time < ?2 AND (end_time IS NULL OR end_time > ?3)
            ORDER BY start_time ASC
            "
        ))?;
        let rows = stmt.query_map(
            params![
                equipment.as_str(),
                format_timestamp(window.end),
                format_timestamp(window.start)
            ],
            state_from_row,
        )?;
        let mut states = Vec::new();
        for row in rows {
            states.push(row?);
        }
        Ok(states)
    }

    /// The most recent state interval of `equipment`.
    pub fn latest_state(&self, equipment: &EquipmentId) -> Result<Option<EquipmentState>, DbError> {
        let state = self
            .conn
            .query_row(
                &format!(
                    "SELECT {STATE_COLUMNS} FROM equipment_states
                     WHERE equipment_id = ? ORDER BY start_time DESC LIMIT 1"
                ),
                [equipment.as_str()],
                state_from_row,
            )
            .optional()?;
        Ok(state)
    }

    /// Production counts of `equipment` timestamped inside `window`.
    pub fn counts_between(
        &self,
        equipment: &EquipmentId,
        window: TimeWindow,
    ) -> Result<Vec<ProductionCount>, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT equipment_id, timestamp, total_count, good_count, reject_count, rework_count, shift_id
            FROM production_counts
            WHERE equipment_id = ? AND timestamp >= ? AND timestamp < ?
            ORDER BY timestamp ASC, id ASC
            ",
        )?;
        let rows = stmt.query_map(
            params![
                equipment.as_str(),
                format_timestamp(window.start),
                format_timestamp(window.end)
            ],
            |row| {
                Ok(ProductionCount {
                    equipment_id: id_col(row, 0)?,
                    timestamp: ts_col(row, 1)?,
                    total_count: row.get(2)?,
                    good_count: row.get(3)?,
                    reject_count: row.get(4)?,
                    rework_count: row.get(5)?,
                    shift_id: id_col(row, 6)?,
                })
            },
        )?;
        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }

    /// Quality events of `equipment` timestamped inside `window`.
    pub fn quality_between(
        &self,
        equipment: &EquipmentId,
        window: TimeWindow,
    ) -> Result<Vec<QualityEvent>, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT equipment_id, timestamp, defect_category, defect_count, severity
            FROM quality_events
            WHERE equipment_id = ? AND timestamp >= ? AND timestamp < ?
            ORDER BY timestamp ASC, id ASC
            ",
        )?;
        let rows = stmt.query_map(
            params![
                equipment.as_str(),
                format_timestamp(window.start),
                format_timestamp(window.end)
            ],
            |row| {
                Ok(QualityEvent {
                    equipment_id: id_col(row, 0)?,
                    timestamp: ts_col(row, 1)?,
                    defect_category: row.get(2)?,
                    defect_count: row.get(3)?,
                    severity: parse_col(row, 4)?,
                })
            },
        )?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// Timestamp of the earliest raw event of `equipment`.
    pub fn first_event_time(&self, equipment: &EquipmentId) -> Result<Option<DateTime<Utc>>, DbError> {
        let first: Option<String> = self.conn.query_row(
            "
            SELECT MIN(t) FROM (
                SELECT MIN(start_time) AS t FROM equipment_states WHERE equipment_id = ?1
                UNION ALL
                SELECT MIN(timestamp) FROM production_counts WHERE equipment_id = ?1
                UNION ALL
                SELECT MIN(timestamp) FROM quality_events WHERE equipment_id = ?1
            )
            ",
            [equipment.as_str()],
            |row| row.get(0),
        )?;
        first
            .map(|value| {
                crate::parse_timestamp(&value)
                    .map_err(|err| DbError::Sqlite(conversion_error(0, err)))
            })
            .transpose()
    }
}

fn insert_state(conn: &Connection, state: &EquipmentState) -> Result<(), DbError> {
    conn.execute(
        "
        INSERT INTO equipment_states
        (equipment_id, category, reason_code, start_time, end_time, shift_id, ingested_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ",
        params![
            state.equipment_id.as_str(),
            state.category.as_str(),
            state.reason_code.as_ref().map(|c| c.as_str()),
            format_timestamp(state.start_time),
            state.end_time.map(format_timestamp),
            state.shift_id.as_str(),
            format_timestamp(Utc::now()),
        ],
    )?;
    Ok(())
}

fn state_from_row(row: &Row<'_>) -> rusqlite::Result<EquipmentState> {
    let reason: Option<String> = row.get(2)?;
    Ok(EquipmentState {
        equipment_id: id_col(row, 0)?,
        category: parse_col(row, 1)?,
        reason_code: reason
            .map(oee_core::ReasonCode::new)
            .transpose()
            .map_err(|err| conversion_error(2, err))?,
        start_time: ts_col(row, 3)?,
        end_time: opt_ts_col(row, 4)?,
        shift_id: id_col(row, 5)?,
    })
}
