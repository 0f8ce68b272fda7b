//! Materialized OEE rollups and reliability records.

use chrono::{DateTime, Utc};
use oee_core::{
    EquipmentId, Granularity, LossBreakdown, OeeRecord, ReliabilityRecord, TimeWindow,
};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

use crate::queue::WindowStatus;
use crate::{Database, DbError, format_timestamp, id_col, level_rank, parse_col, ts_col};

/// Answer to a read: a stored record, or why there is none yet.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueryResult<T> {
    Ready { record: T },
    NotAvailable { reason: &'static str },
}

impl<T> QueryResult<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> QueryResult<U> {
        match self {
            Self::Ready { record } => QueryResult::Ready { record: f(record) },
            Self::NotAvailable { reason } => QueryResult::NotAvailable { reason },
        }
    }

    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

const ROLLUP_COLUMNS: &str = "
    equipment_id, granularity, window_start, window_end, planned_time_ms, operating_time_ms,
    theoretical_output, actual_output, good_count, reject_count, rework_count, defect_events,
    breakdown_ms, setup_ms, minor_stop_ms, startup_defect_units, production_defect_units,
    sample_count, low_confidence";

impl Database {
    /// Stores a record computed outside the refresh queue (backfill) and
    /// marks its window done.
    ///
    /// A window currently leased to a refresh worker is left alone and
    /// `false` is returned; the worker's result wins.
    pub fn store_rollup(&mut self, record: &OeeRecord, now: DateTime<Utc>) -> Result<bool, DbError> {
        let tx = self.conn.transaction()?;
        let status: Option<String> = tx
            .query_row(
                "
                SELECT status FROM refresh_windows
                WHERE equipment_id = ? AND granularity = ? AND window_start = ?
                ",
                params![
                    record.equipment_id.as_str(),
                    record.granularity.as_str(),
                    format_timestamp(record.window.start),
                ],
                |row| row.get(0),
            )
            .optional()?;
        if status.as_deref() == Some(WindowStatus::InProgress.as_str()) {
            return Ok(false);
        }
        upsert_rollup(&tx, record, now)?;
        tx.execute(
            "
            INSERT INTO refresh_windows
            (equipment_id, granularity, level, window_start, window_end, status, attempts, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 'DONE', 0, ?6)
            ON CONFLICT(equipment_id, granularity, window_start) DO UPDATE SET
                status = 'DONE', attempts = 0, next_attempt_at = NULL, last_error = NULL,
                error_kind = NULL, updated_at = ?6
            ",
            params![
                record.equipment_id.as_str(),
                record.granularity.as_str(),
                level_rank(record.granularity),
                format_timestamp(record.window.start),
                format_timestamp(record.window.end),
                format_timestamp(now),
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// The stored rollup for one window, regardless of refresh state.
    pub fn get_rollup(
        &self,
        equipment: &EquipmentId,
        granularity: Granularity,
        window_start: DateTime<Utc>,
    ) -> Result<Option<OeeRecord>, DbError> {
        let record = self
            .conn
            .query_row(
                &format!(
                    "SELECT {ROLLUP_COLUMNS} FROM oee_rollups
                     WHERE equipment_id = ? AND granularity = ? AND window_start = ?"
                ),
                params![
                    equipment.as_str(),
                    granularity.as_str(),
                    format_timestamp(window_start)
                ],
                rollup_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Stored rollups of `granularity` that lie inside `range`, in order.
    pub fn list_rollups(
        &self,
        equipment: &EquipmentId,
        granularity: Granularity,
        range: TimeWindow,
    ) -> Result<Vec<OeeRecord>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ROLLUP_COLUMNS} FROM oee_rollups
             WHERE equipment_id = ? AND granularity = ? AND window_start >= ? AND window_end <= ?
             ORDER BY window_start ASC"
        ))?;
        let rows = stmt.query_map(
            params![
                equipment.as_str(),
                granularity.as_str(),
                format_timestamp(range.start),
                format_timestamp(range.end)
            ],
            rollup_from_row,
        )?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Read-only OEE lookup. Never computes; a window that is queued, being
    /// refreshed or invalidated reads as not available.
    pub fn query_oee(
        &self,
        equipment: &EquipmentId,
        granularity: Granularity,
        window_start: DateTime<Utc>,
    ) -> Result<QueryResult<OeeRecord>, DbError> {
        if granularity == Granularity::Raw {
            return Ok(QueryResult::NotAvailable {
                reason: "raw windows are not materialized",
            });
        }
        if granularity.align(window_start) != window_start {
            return Ok(QueryResult::NotAvailable {
                reason: "window start is not on a granularity boundary",
            });
        }
        match self.window_status(equipment, granularity, window_start)? {
            Some(crate::WindowStatus::Pending | crate::WindowStatus::InProgress) => {
                return Ok(QueryResult::NotAvailable {
                    reason: "refresh pending",
                });
            }
            Some(crate::WindowStatus::Done) | None => {}
        }
        Ok(self
            .get_rollup(equipment, granularity, window_start)?
            .map_or(
                QueryResult::NotAvailable {
                    reason: "not yet computed",
                },
                |record| QueryResult::Ready { record },
            ))
    }

    /// Stores a reliability record, replacing the one for the same period.
    pub fn upsert_reliability(
        &self,
        record: &ReliabilityRecord,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "
            INSERT INTO reliability_records
            (equipment_id, period_start, period_end, failure_count, total_downtime_ms, computed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(equipment_id, period_start, period_end) DO UPDATE SET
                failure_count = excluded.failure_count,
                total_downtime_ms = excluded.total_downtime_ms,
                computed_at = excluded.computed_at
            ",
            params![
                record.equipment_id.as_str(),
                format_timestamp(record.period.start),
                format_timestamp(record.period.end),
                record.failure_count,
                record.total_downtime_ms,
                format_timestamp(now),
            ],
        )?;
        Ok(())
    }

    /// Read-only reliability lookup for an exact period.
    pub fn query_reliability(
        &self,
        equipment: &EquipmentId,
        period: TimeWindow,
    ) -> Result<QueryResult<ReliabilityRecord>, DbError> {
        let record = self
            .conn
            .query_row(
                "
                SELECT equipment_id, period_start, period_end, failure_count, total_downtime_ms
                FROM reliability_records
                WHERE equipment_id = ? AND period_start = ? AND period_end = ?
                ",
                params![
                    equipment.as_str(),
                    format_timestamp(period.start),
                    format_timestamp(period.end)
                ],
                reliability_from_row,
            )
            .optional()?;
        Ok(record.map_or(
            QueryResult::NotAvailable {
                reason: "not yet computed",
            },
            |record| QueryResult::Ready { record },
        ))
    }

    /// Reliability records of `equipment`, newest period end first.
    pub fn list_reliability(&self, equipment: &EquipmentId) -> Result<Vec<ReliabilityRecord>, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT equipment_id, period_start, period_end, failure_count, total_downtime_ms
            FROM reliability_records
            WHERE equipment_id = ?
            ORDER BY period_end DESC, period_start DESC
            ",
        )?;
        let rows = stmt.query_map([equipment.as_str()], reliability_from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

/// Idempotent upsert keyed by `(equipment_id, window_start, granularity)`.
pub(crate) fn upsert_rollup(
    conn: &Connection,
    record: &OeeRecord,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    let losses = &record.losses;
    conn.execute(
        &format!(
            "
            INSERT INTO oee_rollups ({ROLLUP_COLUMNS}, computed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
            ON CONFLICT(equipment_id, window_start, granularity) DO UPDATE SET
                window_end = excluded.window_end,
                planned_time_ms = excluded.planned_time_ms,
                operating_time_ms = excluded.operating_time_ms,
                theoretical_output = excluded.theoretical_output,
                actual_output = excluded.actual_output,
                good_count = excluded.good_count,
                reject_count = excluded.reject_count,
                rework_count = excluded.rework_count,
                defect_events = excluded.defect_events,
                breakdown_ms = excluded.breakdown_ms,
                setup_ms = excluded.setup_ms,
                minor_stop_ms = excluded.minor_stop_ms,
                startup_defect_units = excluded.startup_defect_units,
                production_defect_units = excluded.production_defect_units,
                sample_count = excluded.sample_count,
                low_confidence = excluded.low_confidence,
                computed_at = excluded.computed_at
            "
        ),
        params![
            record.equipment_id.as_str(),
            record.granularity.as_str(),
            format_timestamp(record.window.start),
            format_timestamp(record.window.end),
            record.planned_time_ms,
            record.operating_time_ms,
            record.theoretical_output,
            record.actual_output,
            record.good_count,
            record.reject_count,
            record.rework_count,
            record.defect_events,
            losses.breakdown_ms,
            losses.setup_ms,
            losses.minor_stop_ms,
            losses.startup_defect_units,
            losses.production_defect_units,
            record.sample_count,
            record.low_confidence,
            format_timestamp(now),
        ],
    )?;
    Ok(())
}

fn rollup_from_row(row: &Row<'_>) -> rusqlite::Result<OeeRecord> {
    Ok(OeeRecord {
        equipment_id: id_col(row, 0)?,
        granularity: parse_col(row, 1)?,
        window: TimeWindow {
            start: ts_col(row, 2)?,
            end: ts_col(row, 3)?,
        },
        planned_time_ms: row.get(4)?,
        operating_time_ms: row.get(5)?,
        theoretical_output: row.get(6)?,
        actual_output: row.get(7)?,
        good_count: row.get(8)?,
        reject_count: row.get(9)?,
        rework_count: row.get(10)?,
        defect_events: row.get(11)?,
        losses: LossBreakdown {
            breakdown_ms: row.get(12)?,
            setup_ms: row.get(13)?,
            minor_stop_ms: row.get(14)?,
            startup_defect_units: row.get(15)?,
            production_defect_units: row.get(16)?,
        },
        sample_count: row.get(17)?,
        low_confidence: row.get(18)?,
    })
}

fn reliability_from_row(row: &Row<'_>) -> rusqlite::Result<ReliabilityRecord> {
    Ok(ReliabilityRecord {
        equipment_id: id_col(row, 0)?,
        period: TimeWindow {
            start: ts_col(row, 1)?,
            end: ts_col(row, 2)?,
        },
        failure_count: row.get(3)?,
        total_downtime_ms: row.get(4)?,
    })
}
