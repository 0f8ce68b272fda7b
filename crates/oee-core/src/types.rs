//! Core type definitions with validation.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for core types.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    /// The provided value was empty.
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },

    /// A count or duration was negative.
    #[error("{field} must be non-negative, got {value}")]
    Negative { field: &'static str, value: i64 },

    /// Good, reject and rework counts add up to more than the total.
    #[error("good + reject + rework ({parts}) exceeds total count ({total})")]
    CountsExceedTotal { parts: i64, total: i64 },

    /// An interval does not end after it starts.
    #[error("interval end {end} must be after start {start}")]
    NonPositiveInterval {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    /// A non-producing state was recorded without a reason code.
    #[error("reason code is required for {category} state")]
    MissingReason { category: StateCategory },

    /// An enum string did not match any known variant.
    #[error("invalid {field}: {value}")]
    InvalidVariant { field: &'static str, value: String },

    /// Ideal cycle time must be a positive, finite number of seconds.
    #[error("ideal cycle time must be positive, got {value}")]
    InvalidCycleTime { value: f64 },

    /// Shift planned minutes do not match its planned start/end.
    #[error("shift spans {span_minutes} minutes but declares {planned_minutes} planned minutes")]
    ShiftSpanMismatch {
        span_minutes: i64,
        planned_minutes: i64,
    },

    /// Break does not fit inside the shift.
    #[error("break of {break_minutes} minutes does not fit inside the shift")]
    BreakOutsideShift { break_minutes: i64 },
}

/// Generates a string-backed enum with `as_str`, `Display` and `FromStr`.
macro_rules! define_str_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $field_name:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(
                $(#[$vmeta])*
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            /// String representation for database storage.
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $text, )+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok(Self::$variant), )+
                    _ => Err(ValidationError::InvalidVariant {
                        field: $field_name,
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

define_str_enum!(
    /// What an equipment unit is doing during a state interval.
    StateCategory, "state category" {
        /// Running and producing output.
        Producing => "PRODUCING",
        /// Stopped by a failure or a stop that counts against availability.
        Down => "DOWN",
        /// Available but not running (waiting, starved, blocked).
        Idle => "IDLE",
        /// Changeover or setup.
        Setup => "SETUP",
    }
);

define_str_enum!(
    /// The Six Big Losses.
    LossCategory, "loss category" {
        /// Equipment failure.
        Breakdown => "breakdown",
        /// Setup and changeover.
        Setup => "setup",
        /// Short stops and idling.
        MinorStop => "minor_stop",
        /// Running slower than the ideal cycle time.
        SpeedLoss => "speed_loss",
        /// Defects produced while the process stabilises after a start.
        StartupDefect => "startup_defect",
        /// Defects produced during steady-state production.
        ProductionDefect => "production_defect",
    }
);

impl LossCategory {
    /// Whether this category is measured in lost time and can be assigned
    /// to a reason code.
    #[must_use]
    pub const fn is_time_loss(&self) -> bool {
        matches!(self, Self::Breakdown | Self::Setup | Self::MinorStop)
    }
}

define_str_enum!(
    /// Whether downtime for a reason code was planned.
    DowntimeClass, "downtime class" {
        /// Scheduled stop (maintenance, changeover plan).
        Planned => "planned",
        /// Failure; counts toward MTBF/MTTR.
        Unplanned => "unplanned",
    }
);

define_str_enum!(
    /// Severity of a quality event.
    Severity, "severity" {
        Minor => "minor",
        Major => "major",
        Critical => "critical",
    }
);

/// Generates a validated string ID newtype with common trait implementations.
macro_rules! define_string_id {
    (
        $(#[$meta:meta])*
        $name:ident, $field_name:literal
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Creates a new ID after validation.
            pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
                let id = id.into();
                if id.trim().is_empty() {
                    return Err(ValidationError::Empty { field: $field_name });
                }
                Ok(Self(id))
            }

            /// Returns the ID as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_string_id!(
    /// A validated equipment identifier.
    EquipmentId, "equipment ID"
);

define_string_id!(
    /// A validated shift-instance identifier.
    ShiftId, "shift ID"
);

define_string_id!(
    /// A validated downtime reason code (e.g. `JAM`, `CHANGEOVER`).
    ReasonCode, "reason code"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equipment_id_rejects_empty_and_blank() {
        assert!(EquipmentId::new("").is_err());
        assert!(EquipmentId::new("   ").is_err());
        assert!(EquipmentId::new("press-01").is_ok());
    }

    #[test]
    fn equipment_id_serde_roundtrip() {
        let id = EquipmentId::new("press-01").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"press-01\"");
        let parsed: EquipmentId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn reason_code_serde_rejects_empty() {
        let result: Result<ReasonCode, _> = serde_json::from_str("\"\"");
        assert!(result.is_err());
    }

    #[test]
    fn state_category_parses_uppercase() {
        assert_eq!(
            "PRODUCING".parse::<StateCategory>().unwrap(),
            StateCategory::Producing
        );
        assert_eq!("SETUP".parse::<StateCategory>().unwrap(), StateCategory::Setup);
        let err = "producing".parse::<StateCategory>().unwrap_err();
        assert_eq!(err.to_string(), "invalid state category: producing");
    }

    #[test]
    fn state_category_serde_uses_storage_string() {
        let json = serde_json::to_string(&StateCategory::Down).unwrap();
        assert_eq!(json, "\"DOWN\"");
        let parsed: StateCategory = serde_json::from_str("\"IDLE\"").unwrap();
        assert_eq!(parsed, StateCategory::Idle);
    }

    #[test]
    fn loss_category_roundtrip_all_variants() {
        let variants = [
            LossCategory::Breakdown,
            LossCategory::Setup,
            LossCategory::MinorStop,
            LossCategory::SpeedLoss,
            LossCategory::StartupDefect,
            LossCategory::ProductionDefect,
        ];
        for variant in &variants {
            let parsed: LossCategory = variant.as_str().parse().expect("should parse");
            assert_eq!(parsed, *variant, "roundtrip failed for {variant:?}");
        }
    }

    #[test]
    fn only_availability_and_stop_losses_are_time_losses() {
        assert!(LossCategory::Breakdown.is_time_loss());
        assert!(LossCategory::Setup.is_time_loss());
        assert!(LossCategory::MinorStop.is_time_loss());
        assert!(!LossCategory::SpeedLoss.is_time_loss());
        assert!(!LossCategory::StartupDefect.is_time_loss());
        assert!(!LossCategory::ProductionDefect.is_time_loss());
    }

    #[test]
    fn downtime_class_from_str() {
        assert_eq!(
            "unplanned".parse::<DowntimeClass>().unwrap(),
            DowntimeClass::Unplanned
        );
        assert!("sometimes".parse::<DowntimeClass>().is_err());
    }
}
