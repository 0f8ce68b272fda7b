//! Refresh queue: window leases, retries and watermarks.
//!
//! Every rollup window has one row in `refresh_windows` moving through
//! `PENDING -> IN_PROGRESS -> DONE`. A worker owns an `IN_PROGRESS` row only
//! while its lease is valid; completion and failure are conditional on the
//! lease owner so a reaped worker cannot overwrite newer work. The watermark
//! of an (equipment, granularity) pair is the end of the contiguous run of
//! `DONE` windows starting at the previous watermark.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use oee_core::{
    EquipmentId, ErrorKind, Granularity, OeeRecord, ROLLUP_LEVELS, TimeWindow, ValidationError,
};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;

use crate::rollup::upsert_rollup;
use crate::{
    Database, DbError, StoreChange, format_timestamp, id_col, level_rank, parse_col, ts_col,
};

/// Lifecycle of a refresh window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WindowStatus {
    Pending,
    InProgress,
    Done,
}

impl WindowStatus {
    /// String representation for database storage.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Done => "DONE",
        }
    }
}

impl fmt::Display for WindowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for WindowStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "DONE" => Ok(Self::Done),
            _ => Err(ValidationError::InvalidVariant {
                field: "window status",
                value: s.to_string(),
            }),
        }
    }
}

/// Identifies one rollup window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct WindowKey {
    pub equipment_id: EquipmentId,
    pub granularity: Granularity,
    pub window: TimeWindow,
}

/// A window leased to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedWindow {
    pub key: WindowKey,
    /// Failed attempts before this claim.
    pub attempts: i64,
    pub lease_owner: String,
    pub lease_expires_at: DateTime<Utc>,
}

/// Retry limits applied when a window fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: i64,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempts + 1`: `base * 2^(attempts - 1)`, capped.
    pub fn backoff(&self, attempts: i64) -> Duration {
        let exponent = u32::try_from(attempts.saturating_sub(1).clamp(0, 20)).unwrap_or(20);
        let factor = 2_i32.saturating_pow(exponent);
        self.backoff_base
            .checked_mul(factor)
            .map_or(self.backoff_cap, |delay| delay.min(self.backoff_cap))
    }
}

/// Result of recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailOutcome {
    pub attempts: i64,
    /// No retries left; the window waits for invalidation.
    pub exhausted: bool,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Number of windows per granularity and status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueCount {
    pub granularity: Granularity,
    pub status: WindowStatus,
    pub count: i64,
}

/// Stored watermark of one (equipment, granularity) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatermarkRow {
    pub equipment_id: EquipmentId,
    pub granularity: Granularity,
    pub watermark: DateTime<Utc>,
}

/// A window whose last attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailingWindow {
    pub key: WindowKey,
    pub attempts: i64,
    pub error_kind: Option<String>,
    pub last_error: String,
}

/// Snapshot of the refresh machinery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshStatus {
    pub queue: Vec<QueueCount>,
    pub watermarks: Vec<WatermarkRow>,
    pub failing: Vec<FailingWindow>,
}

impl Database {
    /// Stored watermark for `equipment` at `granularity`.
    pub fn watermark(
        &self,
        equipment: &EquipmentId,
        granularity: Granularity,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        let watermark = self
            .conn
            .query_row(
                "SELECT watermark FROM watermarks WHERE equipment_id = ? AND granularity = ?",
                params![equipment.as_str(), granularity.as_str()],
                |row| ts_col(row, 0),
            )
            .optional()?;
        Ok(watermark)
    }

    /// Sets the watermark unless one is already stored.
    pub fn init_watermark(
        &self,
        equipment: &EquipmentId,
        granularity: Granularity,
        at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, DbError> {
        self.conn.execute(
            "
            INSERT OR IGNORE INTO watermarks (equipment_id, granularity, watermark, updated_at)
            VALUES (?, ?, ?, ?)
            ",
            params![
                equipment.as_str(),
                granularity.as_str(),
                format_timestamp(granularity.align(at)),
                format_timestamp(Utc::now()),
            ],
        )?;
        Ok(self.watermark(equipment, granularity)?.unwrap_or(at))
    }

    /// Adds one window to the queue as pending. Returns `false` if it exists.
    pub fn enqueue_window(
        &self,
        equipment: &EquipmentId,
        granularity: Granularity,
        window: TimeWindow,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let inserted = self.conn.execute(
            "
            INSERT OR IGNORE INTO refresh_windows
            (equipment_id, granularity, level, window_start, window_end, status, attempts, updated_at)
            VALUES (?, ?, ?, ?, ?, 'PENDING', 0, ?)
            ",
            params![
                equipment.as_str(),
                granularity.as_str(),
                level_rank(granularity),
                format_timestamp(window.start),
                format_timestamp(window.end),
                format_timestamp(now),
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Queues the windows of `granularity` that end at or before `horizon`
    /// and were never queued, starting from the watermark.
    ///
    /// A watermark lowered below the first queued window gets the gap up to
    /// that window queued as well. At most `limit` windows are added per call.
    pub fn enqueue_until(
        &mut self,
        equipment: &EquipmentId,
        granularity: Granularity,
        horizon: DateTime<Utc>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<usize, DbError> {
        let Some(step) = granularity.step() else {
            return Ok(0);
        };
        let Some(watermark) = self.watermark(equipment, granularity)? else {
            return Ok(0);
        };
        let (first_start, last_end): (Option<String>, Option<String>) = self.conn.query_row(
            "
            SELECT MIN(window_start), MAX(window_end) FROM refresh_windows
            WHERE equipment_id = ? AND granularity = ?
            ",
            params![equipment.as_str(), granularity.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let first_start = first_start.and_then(|v| crate::parse_timestamp(&v).ok());
        let last_end = last_end.and_then(|v| crate::parse_timestamp(&v).ok());

        // Gap below the first queued window, newest first so a partial fill
        // still leaves it detectable on the next call.
        let mut starts = Vec::new();
        if let Some(first) = first_start.filter(|first| watermark < *first) {
            let mut cursor = first;
            while starts.len() < limit && cursor - step >= watermark {
                cursor -= step;
                starts.push(cursor);
            }
        }
        let mut cursor = last_end.map_or(watermark, |end| end.max(watermark));
        while starts.len() < limit && cursor + step <= horizon {
            starts.push(cursor);
            cursor += step;
        }

        let tx = self.conn.transaction()?;
        let mut added = 0;
        {
            let mut stmt = tx.prepare(
                "
                INSERT OR IGNORE INTO refresh_windows
                (equipment_id, granularity, level, window_start, window_end, status, attempts, updated_at)
                VALUES (?, ?, ?, ?, ?, 'PENDING', 0, ?)
                ",
            )?;
            for start in starts {
                added += stmt.execute(params![
                    equipment.as_str(),
                    granularity.as_str(),
                    level_rank(granularity),
                    format_timestamp(start),
                    format_timestamp(start + step),
                    format_timestamp(now),
                ])?;
            }
        }
        tx.commit()?;
        if added > 0 {
            tracing::debug!(equipment = %equipment, granularity = %granularity, added, "windows queued");
        }
        Ok(added)
    }

    /// Leases up to `limit` ready windows to `owner`, finest level first.
    ///
    /// A window is ready when it is pending, its retry delay has passed, it
    /// has retries left and, above the 1-minute level, every child window of
    /// the next-finer level is done. Readiness is part of the candidate query,
    /// so parents blocked by failed children never take a slot.
    pub fn claim_windows(
        &mut self,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
        max_retries: i64,
        limit: usize,
    ) -> Result<Vec<ClaimedWindow>, DbError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now_text = format_timestamp(now);
        let mut candidates: Vec<(WindowKey, i64)> = Vec::new();
        for level in ROLLUP_LEVELS {
            let remaining = limit - candidates.len();
            if remaining == 0 {
                break;
            }
            let finer = level
                .finer()
                .filter(|g| *g != Granularity::Raw)
                .map(|g| g.as_str());
            let expected = level.children_per_window().unwrap_or(0);
            let mut stmt = tx.prepare(
                "
                SELECT w.equipment_id, w.granularity, w.window_start, w.window_end, w.attempts
                FROM refresh_windows w
                WHERE w.granularity = ?1
                  AND w.status = 'PENDING'
                  AND w.attempts < ?2
                  AND (w.next_attempt_at IS NULL OR w.next_attempt_at <= ?3)
                  AND (?4 IS NULL OR (
                      SELECT COUNT(*) FROM refresh_windows c
                      WHERE c.equipment_id = w.equipment_id AND c.granularity = ?4
                        AND c.window_start >= w.window_start AND c.window_end <= w.window_end
                        AND c.status = 'DONE'
                  ) >= ?5)
                ORDER BY w.window_start ASC, w.equipment_id ASC
                LIMIT ?6
                ",
            )?;
            let rows = stmt.query_map(
                params![
                    level.as_str(),
                    max_retries,
                    now_text,
                    finer,
                    expected,
                    i64::try_from(remaining).unwrap_or(i64::MAX),
                ],
                |row| {
                    Ok((
                        WindowKey {
                            equipment_id: id_col(row, 0)?,
                            granularity: parse_col(row, 1)?,
                            window: TimeWindow {
                                start: ts_col(row, 2)?,
                                end: ts_col(row, 3)?,
                            },
                        },
                        row.get(4)?,
                    ))
                },
            )?;
            for row in rows {
                candidates.push(row?);
            }
        }

        let lease_expires_at = now + lease;
        let mut claimed = Vec::new();
        for (key, attempts) in candidates {
            let updated = tx.execute(
                "
                UPDATE refresh_windows
                SET status = 'IN_PROGRESS', lease_owner = ?, lease_expires_at = ?, updated_at = ?
                WHERE equipment_id = ? AND granularity = ? AND window_start = ? AND status = 'PENDING'
                ",
                params![
                    owner,
                    format_timestamp(lease_expires_at),
                    now_text,
                    key.equipment_id.as_str(),
                    key.granularity.as_str(),
                    format_timestamp(key.window.start),
                ],
            )?;
            if updated == 1 {
                claimed.push(ClaimedWindow {
                    key,
                    attempts,
                    lease_owner: owner.to_string(),
                    lease_expires_at,
                });
            }
        }
        tx.commit()?;
        Ok(claimed)
    }

    /// Stores the computed record and marks the window done, provided the
    /// claim still holds its lease. Returns `false` when the lease was lost.
    pub fn complete_window(
        &mut self,
        claim: &ClaimedWindow,
        record: &OeeRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let tx = self.conn.transaction()?;
        let updated = tx.execute(
            "
            UPDATE refresh_windows
            SET status = 'DONE', lease_owner = NULL, lease_expires_at = NULL,
                next_attempt_at = NULL, last_error = NULL, error_kind = NULL, updated_at = ?
            WHERE equipment_id = ? AND granularity = ? AND window_start = ?
              AND status = 'IN_PROGRESS' AND lease_owner = ?
            ",
            params![
                format_timestamp(now),
                claim.key.equipment_id.as_str(),
                claim.key.granularity.as_str(),
                format_timestamp(claim.key.window.start),
                claim.lease_owner,
            ],
        )?;
        if updated == 0 {
            return Ok(false);
        }
        upsert_rollup(&tx, record, now)?;
        tx.commit()?;
        Ok(true)
    }

    /// Returns a failed window to pending.
    ///
    /// Retryable failures back off exponentially. Other failures use up all
    /// retries at once so the window waits for invalidation. Returns `None`
    /// when the lease was lost.
    pub fn fail_window(
        &self,
        claim: &ClaimedWindow,
        error: &str,
        kind: ErrorKind,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<FailOutcome>, DbError> {
        let attempts = if kind.is_retryable() {
            claim.attempts + 1
        } else {
            policy.max_retries.max(claim.attempts + 1)
        };
        let exhausted = attempts >= policy.max_retries;
        let next_attempt_at = (!exhausted).then(|| now + policy.backoff(attempts));
        let updated = self.conn.execute(
            "
            UPDATE refresh_windows
            SET status = 'PENDING', attempts = ?, next_attempt_at = ?, last_error = ?, error_kind = ?,
                lease_owner = NULL, lease_expires_at = NULL, updated_at = ?
            WHERE equipment_id = ? AND granularity = ? AND window_start = ?
              AND status = 'IN_PROGRESS' AND lease_owner = ?
            ",
            params![
                attempts,
                next_attempt_at.map(format_timestamp),
                error,
                kind.as_str(),
                format_timestamp(now),
                claim.key.equipment_id.as_str(),
                claim.key.granularity.as_str(),
                format_timestamp(claim.key.window.start),
                claim.lease_owner,
            ],
        )?;
        Ok((updated > 0).then_some(FailOutcome {
            attempts,
            exhausted,
            next_attempt_at,
        }))
    }

    /// Hands a claimed window back untouched, without counting an attempt.
    pub fn release_window(&self, claim: &ClaimedWindow, now: DateTime<Utc>) -> Result<bool, DbError> {
        let updated = self.conn.execute(
            "
            UPDATE refresh_windows
            SET status = 'PENDING', lease_owner = NULL, lease_expires_at = NULL, updated_at = ?
            WHERE equipment_id = ? AND granularity = ? AND window_start = ?
              AND status = 'IN_PROGRESS' AND lease_owner = ?
            ",
            params![
                format_timestamp(now),
                claim.key.equipment_id.as_str(),
                claim.key.granularity.as_str(),
                format_timestamp(claim.key.window.start),
                claim.lease_owner,
            ],
        )?;
        Ok(updated > 0)
    }

    /// Returns windows whose lease expired to pending, counting an attempt.
    pub fn reap_expired_leases(&self, now: DateTime<Utc>) -> Result<usize, DbError> {
        let now_text = format_timestamp(now);
        let reaped = self.conn.execute(
            "
            UPDATE refresh_windows
            SET status = 'PENDING', attempts = attempts + 1, lease_owner = NULL, lease_expires_at = NULL,
                last_error = 'lease expired', error_kind = 'transient_store', updated_at = ?1
            WHERE status = 'IN_PROGRESS' AND lease_expires_at <= ?1
            ",
            [now_text],
        )?;
        if reaped > 0 {
            tracing::warn!(windows = reaped, "reaped expired leases");
        }
        Ok(reaped)
    }

    /// Forces recomputation of every rollup window of `equipment` that
    /// overlaps `window`, at every level. Idempotent.
    pub fn invalidate(&mut self, equipment: &EquipmentId, window: TimeWindow) -> Result<usize, DbError> {
        let tx = self.conn.transaction()?;
        let invalidated = invalidate_range(&tx, equipment, window.start, Some(window.end))?;
        tx.commit()?;
        tracing::info!(
            equipment = %equipment,
            window_start = %window.start,
            window_end = %window.end,
            invalidated,
            "invalidated windows"
        );
        if invalidated > 0 {
            self.publish(StoreChange::Invalidated {
                equipment_id: equipment.clone(),
                window,
                windows: invalidated,
            });
        }
        Ok(invalidated)
    }

    /// Moves the watermark past the contiguous run of done windows.
    pub fn advance_watermark(
        &self,
        equipment: &EquipmentId,
        granularity: Granularity,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        let Some(watermark) = self.watermark(equipment, granularity)? else {
            return Ok(None);
        };
        let mut stmt = self.conn.prepare(
            "
            SELECT window_start, window_end, status FROM refresh_windows
            WHERE equipment_id = ? AND granularity = ? AND window_start >= ?
            ORDER BY window_start ASC
            ",
        )?;
        let rows = stmt.query_map(
            params![
                equipment.as_str(),
                granularity.as_str(),
                format_timestamp(watermark)
            ],
            |row| Ok((ts_col(row, 0)?, ts_col(row, 1)?, parse_col::<WindowStatus>(row, 2)?)),
        )?;
        let mut cursor = watermark;
        for row in rows {
            let (start, end, status) = row?;
            if start != cursor || status != WindowStatus::Done {
                break;
            }
            cursor = end;
        }
        if cursor > watermark {
            self.conn.execute(
                "UPDATE watermarks SET watermark = ?, updated_at = ? WHERE equipment_id = ? AND granularity = ?",
                params![
                    format_timestamp(cursor),
                    format_timestamp(Utc::now()),
                    equipment.as_str(),
                    granularity.as_str(),
                ],
            )?;
            tracing::debug!(
                equipment = %equipment,
                granularity = %granularity,
                watermark = %cursor,
                "watermark advanced"
            );
        }
        Ok(Some(cursor))
    }

    /// Current status of one window, `None` if it was never queued.
    pub fn window_status(
        &self,
        equipment: &EquipmentId,
        granularity: Granularity,
        start: DateTime<Utc>,
    ) -> Result<Option<WindowStatus>, DbError> {
        let status = self
            .conn
            .query_row(
                "SELECT status FROM refresh_windows WHERE equipment_id = ? AND granularity = ? AND window_start = ?",
                params![equipment.as_str(), granularity.as_str(), format_timestamp(start)],
                |row| parse_col(row, 0),
            )
            .optional()?;
        Ok(status)
    }

    /// Queue counts, watermarks and failing windows.
    pub fn refresh_status(&self) -> Result<RefreshStatus, DbError> {
        let mut queue = Vec::new();
        {
            let mut stmt = self.conn.prepare(
                "
                SELECT granularity, status, COUNT(*) FROM refresh_windows
                GROUP BY level, granularity, status
                ORDER BY level, status
                ",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(QueueCount {
                    granularity: parse_col(row, 0)?,
                    status: parse_col(row, 1)?,
                    count: row.get(2)?,
                })
            })?;
            for row in rows {
                queue.push(row?);
            }
        }

        let mut watermarks = Vec::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT equipment_id, granularity, watermark FROM watermarks ORDER BY equipment_id, granularity",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(WatermarkRow {
                    equipment_id: id_col(row, 0)?,
                    granularity: parse_col(row, 1)?,
                    watermark: ts_col(row, 2)?,
                })
            })?;
            for row in rows {
                watermarks.push(row?);
            }
        }
        watermarks.sort_by(|a, b| {
            a.equipment_id
                .cmp(&b.equipment_id)
                .then_with(|| a.granularity.cmp(&b.granularity))
        });

        let mut failing = Vec::new();
        {
            let mut stmt = self.conn.prepare(
                "
                SELECT equipment_id, granularity, window_start, window_end, attempts, error_kind, last_error
                FROM refresh_windows
                WHERE last_error IS NOT NULL AND status = 'PENDING'
                ORDER BY level, window_start, equipment_id
                ",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(FailingWindow {
                    key: WindowKey {
                        equipment_id: id_col(row, 0)?,
                        granularity: parse_col(row, 1)?,
                        window: TimeWindow {
                            start: ts_col(row, 2)?,
                            end: ts_col(row, 3)?,
                        },
                    },
                    attempts: row.get(4)?,
                    error_kind: row.get(5)?,
                    last_error: row.get(6)?,
                })
            })?;
            for row in rows {
                failing.push(row?);
            }
        }

        Ok(RefreshStatus {
            queue,
            watermarks,
            failing,
        })
    }

    #[cfg(test)]
    pub(crate) fn force_status(
        &self,
        equipment: &EquipmentId,
        granularity: Granularity,
        start: DateTime<Utc>,
        status: WindowStatus,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE refresh_windows SET status = ? WHERE equipment_id = ? AND granularity = ? AND window_start = ?",
            params![
                status.as_str(),
                equipment.as_str(),
                granularity.as_str(),
                format_timestamp(start)
            ],
        )?;
        Ok(())
    }
}

/// Resets every window of `equipment` overlapping `[start, end)` to pending,
/// at every level, and lowers watermarks that already passed `start`.
///
/// An open range (`end == None`) reaches every later window.
pub(crate) fn invalidate_range(
    conn: &Connection,
    equipment: &EquipmentId,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
) -> Result<usize, DbError> {
    let now = format_timestamp(Utc::now());
    let start_text = format_timestamp(start);
    let end_text = end.map(format_timestamp);
    // An event older than every queued window moves the history back to
    // its day boundary at every level, so coarse windows keep all children.
    let first_queued: Option<String> = conn.query_row(
        "SELECT MIN(window_start) FROM refresh_windows WHERE equipment_id = ?",
        params![equipment.as_str()],
        |row| row.get(0),
    )?;
    let before_history = first_queued
        .and_then(|v| crate::parse_timestamp(&v).ok())
        .is_none_or(|first| start < first);
    let mut invalidated = 0;
    for level in ROLLUP_LEVELS {
        let floor = if before_history {
            Granularity::Day.align(start)
        } else {
            level.align(start)
        };
        invalidated += conn.execute(
            "
            UPDATE refresh_windows
            SET status = 'PENDING', attempts = 0, next_attempt_at = NULL, last_error = NULL,
                error_kind = NULL, lease_owner = NULL, lease_expires_at = NULL, updated_at = ?1
            WHERE equipment_id = ?2 AND granularity = ?3
              AND window_end > ?4
              AND (?5 IS NULL OR window_start < ?5)
              AND (status != 'PENDING' OR attempts > 0)
            ",
            params![now, equipment.as_str(), level.as_str(), start_text, end_text],
        )?;
        conn.execute(
            "
            UPDATE watermarks SET watermark = ?1, updated_at = ?2
            WHERE equipment_id = ?3 AND granularity = ?4 AND watermark > ?1
            ",
            params![
                format_timestamp(floor),
                now,
                equipment.as_str(),
                level.as_str()
            ],
        )?;
    }
    Ok(invalidated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{press, seeded_db, ts};

    fn minute(m: i64) -> TimeWindow {
        Granularity::Minute.window_at(ts(m)).unwrap()
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            backoff_base: Duration::seconds(10),
            backoff_cap: Duration::minutes(5),
        }
    }

    fn record_for(claim: &ClaimedWindow) -> OeeRecord {
        let mut record = OeeRecord::empty(
            claim.key.equipment_id.clone(),
            claim.key.window,
            claim.key.granularity,
        );
        record.planned_time_ms = claim.key.window.duration_ms();
        record.operating_time_ms = record.planned_time_ms;
        record
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::seconds(10));
        assert_eq!(p.backoff(2), Duration::seconds(20));
        assert_eq!(p.backoff(3), Duration::seconds(40));
        assert_eq!(p.backoff(30), Duration::minutes(5));
    }

    #[test]
    fn enqueue_until_stops_at_horizon_and_resumes() {
        let mut db = seeded_db();
        db.init_watermark(&press(), Granularity::Minute, ts(0)).unwrap();
        let added = db
            .enqueue_until(&press(), Granularity::Minute, ts(10), 4, ts(10))
            .unwrap();
        assert_eq!(added, 4);
        let added = db
            .enqueue_until(&press(), Granularity::Minute, ts(10), 100, ts(10))
            .unwrap();
        assert_eq!(added, 6);
        let added = db
            .enqueue_until(&press(), Granularity::Minute, ts(10), 100, ts(10))
            .unwrap();
        assert_eq!(added, 0);
    }

    #[test]
    fn a_window_is_leased_once() {
        let mut db = seeded_db();
        db.enqueue_window(&press(), Granularity::Minute, minute(0), ts(5)).unwrap();
        let first = db
            .claim_windows("worker-a", ts(5), Duration::seconds(30), 3, 10)
            .unwrap();
        assert_eq!(first.len(), 1);
        let second = db
            .claim_windows("worker-b", ts(5), Duration::seconds(30), 3, 10)
            .unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn released_window_keeps_its_attempts() {
        let mut db = seeded_db();
        db.enqueue_window(&press(), Granularity::Minute, minute(0), ts(5)).unwrap();
        let claims = db
            .claim_windows("worker-a", ts(5), Duration::seconds(30), 3, 10)
            .unwrap();
        assert!(db.release_window(&claims[0], ts(5)).unwrap());
        assert!(!db.release_window(&claims[0], ts(5)).unwrap());

        let again = db
            .claim_windows("worker-b", ts(5), Duration::seconds(30), 3, 10)
            .unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempts, 0);
    }

    #[test]
    fn coarse_window_waits_for_all_children() {
        let mut db = seeded_db();
        let five = Granularity::FiveMinute.window_at(ts(0)).unwrap();
        db.enqueue_window(&press(), Granularity::FiveMinute, five, ts(10)).unwrap();
        for m in 0..5 {
            db.enqueue_window(&press(), Granularity::Minute, minute(m), ts(10)).unwrap();
        }

        let claims = db
            .claim_windows("w", ts(10), Duration::seconds(30), 3, 10)
            .unwrap();
        assert_eq!(claims.len(), 5);
        assert!(claims.iter().all(|c| c.key.granularity == Granularity::Minute));

        for claim in &claims[..4] {
            assert!(db.complete_window(claim, &record_for(claim), ts(10)).unwrap());
        }
        let none = db
            .claim_windows("w", ts(10), Duration::seconds(30), 3, 10)
            .unwrap();
        assert!(none.is_empty(), "one child is still in progress");

        assert!(db.complete_window(&claims[4], &record_for(&claims[4]), ts(10)).unwrap());
        let coarse = db
            .claim_windows("w", ts(10), Duration::seconds(30), 3, 10)
            .unwrap();
        assert_eq!(coarse.len(), 1);
        assert_eq!(coarse[0].key.granularity, Granularity::FiveMinute);
    }

    #[test]
    fn blocked_parents_do_not_crowd_out_ready_ones() {
        let mut db = seeded_db();
        let lathe = EquipmentId::new("lathe-02").unwrap();
        for m in (-60..0).step_by(5) {
            let five = Granularity::FiveMinute.window_at(ts(m)).unwrap();
            db.enqueue_window(&lathe, Granularity::FiveMinute, five, ts(10)).unwrap();
        }
        let five = Granularity::FiveMinute.window_at(ts(0)).unwrap();
        db.enqueue_window(&press(), Granularity::FiveMinute, five, ts(10)).unwrap();
        for m in 0..5 {
            db.enqueue_window(&press(), Granularity::Minute, minute(m), ts(10)).unwrap();
            db.force_status(&press(), Granularity::Minute, ts(m), WindowStatus::Done).unwrap();
        }

        let claims = db
            .claim_windows("w", ts(10), Duration::seconds(30), 3, 1)
            .unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].key.equipment_id, press());
        assert_eq!(claims[0].key.window, five);
    }

    #[test]
    fn expired_lease_is_reaped_and_stale_owner_cannot_complete() {
        let mut db = seeded_db();
        db.enqueue_window(&press(), Granularity::Minute, minute(0), ts(5)).unwrap();
        let stale = db
            .claim_windows("worker-a", ts(5), Duration::seconds(30), 3, 1)
            .unwrap()
            .remove(0);

        assert_eq!(db.reap_expired_leases(ts(6)).unwrap(), 1);
        let fresh = db
            .claim_windows("worker-b", ts(6), Duration::seconds(30), 3, 1)
            .unwrap()
            .remove(0);
        assert_eq!(fresh.attempts, 1);

        assert!(!db.complete_window(&stale, &record_for(&stale), ts(6)).unwrap());
        assert!(db.complete_window(&fresh, &record_for(&fresh), ts(6)).unwrap());
        assert_eq!(
            db.window_status(&press(), Granularity::Minute, ts(0)).unwrap(),
            Some(WindowStatus::Done)
        );
    }

    #[test]
    fn transient_failure_backs_off_then_exhausts() {
        let mut db = seeded_db();
        db.enqueue_window(&press(), Granularity::Minute, minute(0), ts(5)).unwrap();
        let p = policy();
        let mut now = ts(5);
        let mut last = None;
        for expected in 1..=3 {
            let claim = db
                .claim_windows("w", now, Duration::seconds(30), p.max_retries, 1)
                .unwrap()
                .remove(0);
            let outcome = db
                .fail_window(&claim, "database is locked", ErrorKind::TransientStore, &p, now)
                .unwrap()
                .expect("lease held");
            assert_eq!(outcome.attempts, expected);
            now += Duration::minutes(10);
            last = Some(outcome);
        }
        let last = last.unwrap();
        assert!(last.exhausted);
        assert_eq!(last.next_attempt_at, None);
        assert!(db
            .claim_windows("w", now, Duration::seconds(30), p.max_retries, 1)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn configuration_failure_waits_for_invalidation() {
        let mut db = seeded_db();
        db.enqueue_window(&press(), Granularity::Minute, minute(0), ts(5)).unwrap();
        let p = policy();
        let claim = db
            .claim_windows("w", ts(5), Duration::seconds(30), p.max_retries, 1)
            .unwrap()
            .remove(0);
        let outcome = db
            .fail_window(&claim, "unmapped reason", ErrorKind::Configuration, &p, ts(5))
            .unwrap()
            .unwrap();
        assert!(outcome.exhausted);
        let status = db.refresh_status().unwrap();
        assert_eq!(status.failing.len(), 1);
        assert_eq!(status.failing[0].error_kind.as_deref(), Some("configuration"));

        assert!(db
            .claim_windows("w", ts(60), Duration::seconds(30), p.max_retries, 1)
            .unwrap()
            .is_empty());
        assert_eq!(db.invalidate(&press(), minute(0)).unwrap(), 1);
        assert_eq!(
            db.claim_windows("w", ts(60), Duration::seconds(30), p.max_retries, 1)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn watermark_stops_at_first_unfinished_window() {
        let mut db = seeded_db();
        db.init_watermark(&press(), Granularity::Minute, ts(0)).unwrap();
        db.enqueue_until(&press(), Granularity::Minute, ts(3), 10, ts(3)).unwrap();
        db.force_status(&press(), Granularity::Minute, ts(0), WindowStatus::Done).unwrap();
        db.force_status(&press(), Granularity::Minute, ts(2), WindowStatus::Done).unwrap();

        assert_eq!(
            db.advance_watermark(&press(), Granularity::Minute).unwrap(),
            Some(ts(1))
        );
        db.force_status(&press(), Granularity::Minute, ts(1), WindowStatus::Done).unwrap();
        assert_eq!(
            db.advance_watermark(&press(), Granularity::Minute).unwrap(),
            Some(ts(3))
        );
    }

    #[test]
    fn invalidation_cascades_and_lowers_watermarks() {
        let mut db = seeded_db();
        db.init_watermark(&press(), Granularity::Minute, ts(0)).unwrap();
        db.init_watermark(&press(), Granularity::FiveMinute, ts(0)).unwrap();
        db.enqueue_until(&press(), Granularity::Minute, ts(5), 10, ts(5)).unwrap();
        db.enqueue_until(&press(), Granularity::FiveMinute, ts(5), 10, ts(5)).unwrap();
        for m in 0..5 {
            db.force_status(&press(), Granularity::Minute, ts(m), WindowStatus::Done).unwrap();
        }
        db.force_status(&press(), Granularity::FiveMinute, ts(0), WindowStatus::Done).unwrap();
        db.advance_watermark(&press(), Granularity::Minute).unwrap();
        db.advance_watermark(&press(), Granularity::FiveMinute).unwrap();

        let invalidated = db.invalidate(&press(), minute(3)).unwrap();
        assert_eq!(invalidated, 2, "the minute and its five-minute parent");
        assert_eq!(db.watermark(&press(), Granularity::Minute).unwrap(), Some(ts(3)));
        assert_eq!(db.watermark(&press(), Granularity::FiveMinute).unwrap(), Some(ts(0)));
        assert_eq!(db.invalidate(&press(), minute(3)).unwrap(), 0, "idempotent");
    }

    #[test]
    fn event_before_the_queue_gets_its_gap_queued() {
        let mut db = seeded_db();
        db.init_watermark(&press(), Granularity::Minute, ts(0)).unwrap();
        db.enqueue_until(&press(), Granularity::Minute, ts(3), 10, ts(3)).unwrap();
        for m in 0..3 {
            db.force_status(&press(), Granularity::Minute, ts(m), WindowStatus::Done).unwrap();
        }
        db.advance_watermark(&press(), Granularity::Minute).unwrap();

        assert_eq!(db.invalidate(&press(), minute(-10)).unwrap(), 0);
        let day_start = Granularity::Day.align(ts(0));
        assert_eq!(day_start, ts(-360));
        assert_eq!(db.watermark(&press(), Granularity::Minute).unwrap(), Some(day_start));

        let added = db
            .enqueue_until(&press(), Granularity::Minute, ts(3), 100, ts(3))
            .unwrap();
        assert_eq!(added, 100);
        let added = db
            .enqueue_until(&press(), Granularity::Minute, ts(3), 1000, ts(3))
            .unwrap();
        assert_eq!(added, 260);
        assert_eq!(
            db.window_status(&press(), Granularity::Minute, day_start).unwrap(),
            Some(WindowStatus::Pending)
        );

        for m in -360..0 {
            db.force_status(&press(), Granularity::Minute, ts(m), WindowStatus::Done).unwrap();
        }
        assert_eq!(
            db.advance_watermark(&press(), Granularity::Minute).unwrap(),
            Some(ts(3))
        );
    }

    #[test]
    fn refresh_status_counts_by_level_and_state() {
        let mut db = seeded_db();
        db.init_watermark(&press(), Granularity::Minute, ts(0)).unwrap();
        db.enqueue_until(&press(), Granularity::Minute, ts(3), 10, ts(3)).unwrap();
        db.force_status(&press(), Granularity::Minute, ts(0), WindowStatus::Done).unwrap();
        let status = db.refresh_status().unwrap();
        assert_eq!(
            status.queue,
            vec![
                QueueCount {
                    granularity: Granularity::Minute,
                    status: WindowStatus::Done,
                    count: 1
                },
                QueueCount {
                    granularity: Granularity::Minute,
                    status: WindowStatus::Pending,
                    count: 2
                },
            ]
        );
        assert_eq!(status.watermarks.len(), 1);
    }
}
