//! Core domain logic for equipment effectiveness.
//!
//! This crate contains the fundamental types and logic for:
//! - Raw equipment events and shift calendars
//! - OEE calculation with Six Big Losses attribution
//! - MTBF / MTTR reliability statistics
//! - Re-aggregation of fine rollups into coarse ones

pub mod downtime;
pub mod error;
pub mod event;
pub mod granularity;
pub mod master;
mod oee;
pub mod record;
pub mod reliability;
pub mod shift;
pub mod status;
pub mod types;
pub mod window;

pub use downtime::{DowntimeEntry, downtime_pareto};
pub use error::{CalcError, ErrorKind};
pub use event::{EquipmentState, ProductionCount, QualityEvent};
pub use granularity::{Granularity, ROLLUP_LEVELS};
pub use master::{EquipmentSpec, MasterData, MasterDataError, ReasonCodeEntry, ReasonCodeTable};
pub use oee::{CalcContext, RawEvents, calculate_oee, state_lookback};
pub use record::{LossBreakdown, OeeMetrics, OeeRecord, SixBigLosses, combine};
pub use reliability::{ReliabilityMetrics, ReliabilityRecord, calculate_reliability};
pub use shift::{ShiftCalendar, ShiftInstance};
pub use status::{EquipmentStatus, current_status};
pub use types::{
    DowntimeClass, EquipmentId, LossCategory, ReasonCode, Severity, ShiftId, StateCategory,
    ValidationError,
};
pub use window::TimeWindow;
