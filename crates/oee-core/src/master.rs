//! Equipment and shift master data consumed read-only by the calculators.
//!
//! The reason-code table is the single classification of downtime reasons
//! into the Six Big Losses and into planned/unplanned downtime. It is
//! validated when loaded: duplicate codes, codes mapped to a loss that cannot
//! be measured in time, and codes already referenced by stored states but
//! absent from the table are all rejected.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::shift::{ShiftCalendar, ShiftInstance};
use crate::types::{DowntimeClass, EquipmentId, LossCategory, ReasonCode, ValidationError};

const fn default_startup_window_secs() -> i64 {
    600
}

/// Per-equipment constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquipmentSpec {
    pub id: EquipmentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,
    /// Seconds per unit at rated speed.
    pub ideal_cycle_time_secs: f64,
    /// How long after a restart rejects count as startup defects.
    #[serde(default = "default_startup_window_secs")]
    pub startup_window_secs: i64,
}

impl EquipmentSpec {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.ideal_cycle_time_secs.is_finite() || self.ideal_cycle_time_secs <= 0.0 {
            return Err(ValidationError::InvalidCycleTime {
                value: self.ideal_cycle_time_secs,
            });
        }
        if self.startup_window_secs < 0 {
            return Err(ValidationError::Negative {
                field: "startup_window_secs",
                value: self.startup_window_secs,
            });
        }
        Ok(())
    }

    pub const fn startup_window_ms(&self) -> i64 {
        self.startup_window_secs * 1000
    }
}

/// Classification of one reason code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasonCodeEntry {
    pub code: ReasonCode,
    pub loss_category: LossCategory,
    pub downtime: DowntimeClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Errors raised while validating master data.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MasterDataError {
    #[error("reason code {0} is defined more than once")]
    DuplicateReasonCode(String),

    #[error("reason code {code} maps to {category}, which is not a time loss")]
    NotATimeLoss { code: String, category: LossCategory },

    #[error("reason codes without classification: {}", .0.join(", "))]
    UnmappedReasonCodes(Vec<String>),

    #[error("equipment {0} is defined more than once")]
    DuplicateEquipment(String),

    #[error("invalid equipment {id}: {source}")]
    InvalidEquipment {
        id: String,
        #[source]
        source: ValidationError,
    },

    #[error("invalid shift {id}: {source}")]
    InvalidShift {
        id: String,
        #[source]
        source: ValidationError,
    },

    #[error("shift {0} is defined more than once")]
    DuplicateShift(String),

    #[error("shifts {first} and {second} overlap for scope {scope}")]
    OverlappingShifts {
        scope: String,
        first: String,
        second: String,
    },
}

/// Validated reason-code classification table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReasonCodeTable {
    entries: BTreeMap<String, ReasonCodeEntry>,
}

impl ReasonCodeTable {
    /// Builds the table, rejecting duplicates and non-time loss categories.
    pub fn new(entries: Vec<ReasonCodeEntry>) -> Result<Self, MasterDataError> {
        let mut table = BTreeMap::new();
        for entry in entries {
            if !entry.loss_category.is_time_loss() {
                return Err(MasterDataError::NotATimeLoss {
                    code: entry.code.to_string(),
                    category: entry.loss_category,
                });
            }
            let key = entry.code.to_string();
            if table.insert(key.clone(), entry).is_some() {
                return Err(MasterDataError::DuplicateReasonCode(key));
            }
        }
        Ok(Self { entries: table })
    }

    /// Looks up the classification of `code`.
    pub fn classify(&self, code: &str) -> Option<&ReasonCodeEntry> {
        self.entries.get(code)
    }

    /// Fails with every code in `codes` that the table does not map.
    pub fn ensure_mapped<'a>(
        &self,
        codes: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), MasterDataError> {
        let unmapped: BTreeSet<String> = codes
            .into_iter()
            .filter(|code| !self.entries.contains_key(*code))
            .map(str::to_string)
            .collect();
        if unmapped.is_empty() {
            Ok(())
        } else {
            Err(MasterDataError::UnmappedReasonCodes(
                unmapped.into_iter().collect(),
            ))
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &ReasonCodeEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A master-data document as loaded from configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MasterData {
    #[serde(default)]
    pub equipment: Vec<EquipmentSpec>,
    #[serde(default)]
    pub reason_codes: Vec<ReasonCodeEntry>,
    #[serde(default)]
    pub shifts: Vec<ShiftInstance>,
}

impl MasterData {
    /// Validates the whole document and returns the classification table.
    pub fn validate(&self) -> Result<ReasonCodeTable, MasterDataError> {
        let mut seen = HashSet::new();
        for equipment in &self.equipment {
            if !seen.insert(equipment.id.as_str()) {
                return Err(MasterDataError::DuplicateEquipment(equipment.id.to_string()));
            }
            equipment
                .validate()
                .map_err(|source| MasterDataError::InvalidEquipment {
                    id: equipment.id.to_string(),
                    source,
                })?;
        }

        let mut shift_ids = HashSet::new();
        let mut by_scope: BTreeMap<&str, Vec<ShiftInstance>> = BTreeMap::new();
        for shift in &self.shifts {
            if !shift_ids.insert(shift.id.as_str()) {
                return Err(MasterDataError::DuplicateShift(shift.id.to_string()));
            }
            shift
                .validate()
                .map_err(|source| MasterDataError::InvalidShift {
                    id: shift.id.to_string(),
                    source,
                })?;
            by_scope.entry(&shift.scope).or_default().push(shift.clone());
        }
        for (scope, shifts) in by_scope {
            let calendar = ShiftCalendar::new(shifts);
            if let Some((first, second)) = calendar.find_overlap() {
                return Err(MasterDataError::OverlappingShifts {
                    scope: scope.to_string(),
                    first: first.id.to_string(),
                    second: second.id.to_string(),
                });
            }
        }

        ReasonCodeTable::new(self.reason_codes.clone())
    }
}
