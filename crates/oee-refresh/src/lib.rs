//! Rollup aggregation and background refresh.
//!
//! [`aggregator`] turns raw events and finer rollups into records for one
//! window at a time. [`scheduler`] drives it from the refresh queue on a tick
//! loop, one SQLite connection per blocking worker.

pub mod aggregator;
pub mod scheduler;

use oee_core::{CalcError, ErrorKind};
use oee_db::DbError;
use thiserror::Error;

pub use aggregator::{
    BackfillReport, MasterSnapshot, backfill, compute_direct, compute_shift, compute_window,
    materialize_reliability,
};
pub use scheduler::{Scheduler, SchedulerConfig, TickSummary};

/// Errors raised while computing or scheduling rollups.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Calc(#[from] CalcError),

    /// A blocking worker panicked or was cancelled by the runtime.
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("unknown shift {shift} for equipment {equipment}")]
    UnknownShift { equipment: String, shift: String },
}

impl RefreshError {
    /// Taxonomy bucket for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Db(err) => err.kind(),
            Self::Calc(err) => err.kind(),
            Self::Join(_) => ErrorKind::TransientStore,
            Self::UnknownShift { .. } => ErrorKind::Configuration,
        }
    }
}
