//! Calculation errors and the error taxonomy shared by every layer.

use std::fmt;

use thiserror::Error;

use crate::master::MasterDataError;
use crate::types::ValidationError;

/// How a failure should be handled by the aggregator and scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing or invalid master data. Fatal for the window; not retried
    /// until the window is invalidated.
    Configuration,
    /// An event arrived for a window already marked done, or a close had no
    /// matching open.
    OutOfOrder,
    /// Some expected raw data was missing; the result is low-confidence.
    PartialData,
    /// The store was unavailable. Retried with backoff.
    TransientStore,
}

impl ErrorKind {
    /// Whether the scheduler should retry a window that failed this way.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStore)
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::OutOfOrder => "out_of_order",
            Self::PartialData => "partial_data",
            Self::TransientStore => "transient_store",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors raised by the OEE and reliability calculators.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CalcError {
    /// The equipment has no shift instances at all.
    #[error("no shift calendar for equipment {equipment}")]
    MissingShiftCalendar { equipment: String },

    /// The equipment has no master-data entry.
    #[error("no master data for equipment {equipment}")]
    UnknownEquipment { equipment: String },

    /// A state references a reason code that is not classified.
    #[error("reason code {code} on equipment {equipment} is not classified")]
    UnmappedReasonCode { equipment: String, code: String },

    /// Raw or master data failed validation.
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    /// Master data failed validation.
    #[error(transparent)]
    MasterData(#[from] MasterDataError),

    /// Loss attribution did not add up. Indicates overlapping raw intervals.
    #[error("{kind} losses do not reconcile: attributed {attributed}, expected {expected}")]
    LossReconciliation {
        kind: &'static str,
        attributed: i64,
        expected: i64,
    },

    /// A coarse window was asked to aggregate children from another level or
    /// equipment.
    #[error("cannot aggregate {child} record into {target} window")]
    HierarchyMismatch { child: String, target: String },
}

impl CalcError {
    /// Taxonomy bucket for this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingShiftCalendar { .. }
            | Self::UnknownEquipment { .. }
            | Self::UnmappedReasonCode { .. }
            | Self::Invalid(_)
            | Self::MasterData(_)
            | Self::LossReconciliation { .. }
            | Self::HierarchyMismatch { .. } => ErrorKind::Configuration,
        }
    }
}
