//! Master data persistence: equipment, reason codes and shift instances.

use chrono::{NaiveDate, Utc};
use oee_core::{
    EquipmentId, EquipmentSpec, MasterData, ReasonCodeEntry, ReasonCodeTable, ShiftInstance,
};
use rusqlite::{Connection, OptionalExtension, params};

use crate::{
    Database, DbError, StoreChange, conversion_error, format_timestamp, id_col, opt_ts_col,
    parse_col, ts_col,
};

/// What a master-data load changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MasterSummary {
    pub equipment: usize,
    pub reason_codes: usize,
    pub shifts: usize,
    /// Windows reset to pending so they are recomputed with the new data.
    pub invalidated_windows: usize,
}

impl Database {
    /// Validates and stores a master-data document.
    ///
    /// Equipment is upserted; reason codes and shift instances are replaced
    /// wholesale. The load is rejected when any reason code already used by a
    /// stored state is missing from the new table. Every aggregated window is
    /// reset to pending because classifications and calendars may have
    /// changed.
    pub fn load_master_data(&mut self, data: &MasterData) -> Result<MasterSummary, DbError> {
        let table = data.validate()?;
        let tx = self.conn.transaction()?;

        let used_codes: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT DISTINCT reason_code FROM equipment_states WHERE reason_code IS NOT NULL",
            )?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            let mut codes = Vec::new();
            for row in rows {
                codes.push(row?);
            }
            codes
        };
        table.ensure_mapped(used_codes.iter().map(String::as_str))?;

        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO equipment (id, site_id, ideal_cycle_time_secs, startup_window_secs)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    site_id = excluded.site_id,
                    ideal_cycle_time_secs = excluded.ideal_cycle_time_secs,
                    startup_window_secs = excluded.startup_window_secs
                ",
            )?;
            for equipment in &data.equipment {
                stmt.execute(params![
                    equipment.id.as_str(),
                    equipment.site_id,
                    equipment.ideal_cycle_time_secs,
                    equipment.startup_window_secs,
                ])?;
            }
        }

        tx.execute("DELETE FROM reason_codes", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO reason_codes (code, loss_category, downtime, description) VALUES (?, ?, ?, ?)",
            )?;
            for entry in table.entries() {
                stmt.execute(params![
                    entry.code.as_str(),
                    entry.loss_category.as_str(),
                    entry.downtime.as_str(),
                    entry.description,
                ])?;
            }
        }

        tx.execute("DELETE FROM shift_instances", [])?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO shift_instances
                (id, scope, date, planned_start, planned_end, planned_minutes, break_minutes, break_start)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ",
            )?;
            for shift in &data.shifts {
                stmt.execute(params![
                    shift.id.as_str(),
                    shift.scope,
                    shift.date.to_string(),
                    format_timestamp(shift.planned_start),
                    format_timestamp(shift.planned_end),
                    shift.planned_minutes,
                    shift.break_minutes,
                    shift.break_start.map(format_timestamp),
                ])?;
            }
        }

        let invalidated = tx.execute(
            "
            UPDATE refresh_windows
            SET status = 'PENDING', attempts = 0, next_attempt_at = NULL, last_error = NULL,
                error_kind = NULL, lease_owner = NULL, lease_expires_at = NULL, updated_at = ?
            WHERE status != 'PENDING' OR attempts > 0
            ",
            [format_timestamp(Utc::now())],
        )?;
        tx.execute("DELETE FROM watermarks", [])?;
        tx.commit()?;

        tracing::info!(
            equipment = data.equipment.len(),
            reason_codes = table.len(),
            shifts = data.shifts.len(),
            invalidated,
            "master data loaded"
        );
        self.publish(StoreChange::MasterDataLoaded);
        Ok(MasterSummary {
            equipment: data.equipment.len(),
            reason_codes: table.len(),
            shifts: data.shifts.len(),
            invalidated_windows: invalidated,
        })
    }

    /// Master data of one equipment unit.
    pub fn equipment(&self, id: &EquipmentId) -> Result<Option<EquipmentSpec>, DbError> {
        let spec = self
            .conn
            .query_row(
                "SELECT id, site_id, ideal_cycle_time_secs, startup_window_secs FROM equipment WHERE id = ?",
                [id.as_str()],
                |row| {
                    Ok(EquipmentSpec {
                        id: id_col(row, 0)?,
                        site_id: row.get(1)?,
                        ideal_cycle_time_secs: row.get(2)?,
                        startup_window_secs: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(spec)
    }

    /// All equipment, ordered by ID.
    pub fn list_equipment(&self) -> Result<Vec<EquipmentSpec>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, site_id, ideal_cycle_time_secs, startup_window_secs FROM equipment ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(EquipmentSpec {
                id: id_col(row, 0)?,
                site_id: row.get(1)?,
                ideal_cycle_time_secs: row.get(2)?,
                startup_window_secs: row.get(3)?,
            })
        })?;
        let mut equipment = Vec::new();
        for row in rows {
            equipment.push(row?);
        }
        Ok(equipment)
    }

    /// The stored reason-code classification.
    pub fn reason_table(&self) -> Result<ReasonCodeTable, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT code, loss_category, downtime, description FROM reason_codes ORDER BY code")?;
        let rows = stmt.query_map([], |row| {
            Ok(ReasonCodeEntry {
                code: id_col(row, 0)?,
                loss_category: parse_col(row, 1)?,
                downtime: parse_col(row, 2)?,
                description: row.get(3)?,
            })
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(ReasonCodeTable::new(entries)?)
    }

    /// All stored shift instances, ordered by start.
    pub fn shifts(&self) -> Result<Vec<ShiftInstance>, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT id, scope, date, planned_start, planned_end, planned_minutes, break_minutes, break_start
            FROM shift_instances
            ORDER BY planned_start, id
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            let date: String = row.get(2)?;
            Ok(ShiftInstance {
                id: id_col(row, 0)?,
                scope: row.get(1)?,
                date: date
                    .parse::<NaiveDate>()
                    .map_err(|err| conversion_error(2, err))?,
                planned_start: ts_col(row, 3)?,
                planned_end: ts_col(row, 4)?,
                planned_minutes: row.get(5)?,
                break_minutes: row.get(6)?,
                break_start: opt_ts_col(row, 7)?,
            })
        })?;
        let mut shifts = Vec::new();
        for row in rows {
            shifts.push(row?);
        }
        Ok(shifts)
    }

    /// The whole stored master-data document.
    pub fn master_data(&self) -> Result<MasterData, DbError> {
        Ok(MasterData {
            equipment: self.list_equipment()?,
            reason_codes: self.reason_table()?.entries().cloned().collect(),
            shifts: self.shifts()?,
        })
    }
}

/// Fails with [`DbError::UnknownEquipment`] unless `id` has master data.
pub(crate) fn ensure_equipment(conn: &Connection, id: &EquipmentId) -> Result<(), DbError> {
    let exists = conn
        .query_row("SELECT 1 FROM equipment WHERE id = ?", [id.as_str()], |_| Ok(()))
        .optional()?;
    exists.ok_or_else(|| DbError::UnknownEquipment(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{master_data, press, seeded_db, ts};
    use oee_core::{MasterDataError, ReasonCode, ShiftId, StateCategory};

    #[test]
    fn master_data_round_trips_through_storage() {
        let db = seeded_db();
        let stored = db.master_data().unwrap();
        let original = master_data();
        assert_eq!(stored.equipment, original.equipment);
        assert_eq!(stored.shifts, original.shifts);
        let codes: Vec<_> = stored.reason_codes.iter().map(|e| e.code.as_str()).collect();
        assert_eq!(codes, vec!["CHANGEOVER", "JAM"]);
    }

    #[test]
    fn equipment_lookup() {
        let db = seeded_db();
        let spec = db.equipment(&press()).unwrap().expect("press is stored");
        assert!((spec.ideal_cycle_time_secs - 60.0).abs() < f64::EPSILON);
        assert!(db
            .equipment(&EquipmentId::new("ghost").unwrap())
            .unwrap()
            .is_none());
    }

    #[test]
    fn reload_rejects_dropping_a_used_code() {
        let mut db = seeded_db();
        db.open_state(&oee_core::EquipmentState {
            equipment_id: press(),
            category: StateCategory::Down,
            reason_code: Some(ReasonCode::new("JAM").unwrap()),
            start_time: ts(0),
            end_time: None,
            shift_id: ShiftId::new("day-1").unwrap(),
        })
        .unwrap();

        let mut data = master_data();
        data.reason_codes.retain(|e| e.code.as_str() != "JAM");
        let err = db.load_master_data(&data).unwrap_err();
        assert!(matches!(
            err,
            DbError::MasterData(MasterDataError::UnmappedReasonCodes(ref codes)) if codes == &["JAM".to_string()]
        ));
        // The previous table is still in place.
        assert!(db.reason_table().unwrap().classify("JAM").is_some());
    }

    #[test]
    fn reload_replaces_shifts() {
        let mut db = seeded_db();
        let mut data = master_data();
        data.shifts.clear();
        let summary = db.load_master_data(&data).unwrap();
        assert_eq!(summary.shifts, 0);
        assert!(db.shifts().unwrap().is_empty());
        assert_eq!(db.list_equipment().unwrap().len(), 1);
    }
}
