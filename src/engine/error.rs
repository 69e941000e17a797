use ulid::Ulid;

use crate::model::{BookingStatus, DateRange, Day};

/// Why a candidate range cannot be booked. Listed in tie-break order: when
/// several apply, the earliest variant is the one reported.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeRejection {
    #[error("start date {start} is in the past")]
    PastDate { start: Day },
    #[error("end date {end} must be after start date {start}")]
    InvalidOrder { start: Day, end: Day },
    #[error("dates {requested} overlap booking {booking_id}")]
    Overlap { requested: DateRange, booking_id: Ulid },
    #[error("minimum rental period is {min} days, requested {days}")]
    TooShort { min: u32, days: i64 },
    #[error("maximum rental period is {max} days, requested {days}")]
    TooLong { max: u32, days: i64 },
}

impl RangeRejection {
    pub fn reason(&self) -> &'static str {
        match self {
            RangeRejection::PastDate { .. } => "PastDate",
            RangeRejection::InvalidOrder { .. } => "InvalidOrder",
            RangeRejection::Overlap { .. } => "Overlap",
            RangeRejection::TooShort { .. } => "TooShort",
            RangeRejection::TooLong { .. } => "TooLong",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("caller identity is missing or unverified")]
    Unauthorized,
    #[error("missing or malformed fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
    #[error("invalid {field}: {reason}")]
    InvalidDate { field: &'static str, reason: String },
    #[error(transparent)]
    Rejected(#[from] RangeRejection),
    #[error("dates {requested} were just taken by booking {booking_id}; please pick new ones")]
    Conflict { requested: DateRange, booking_id: Ulid },
    #[error("persistence unavailable: {0}")]
    Transient(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("cannot move booking from {from} to {to}")]
    InvalidTransition { from: BookingStatus, to: BookingStatus },
    #[error("invalid item: {0}")]
    InvalidItem(String),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Machine-readable reason code, stable across releases.
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::Unauthorized => "Unauthorized",
            EngineError::MissingFields(_) => "MissingFields",
            EngineError::InvalidDate { .. } => "InvalidDate",
            EngineError::Rejected(r) => r.reason(),
            EngineError::Conflict { .. } => "Conflict",
            EngineError::Transient(_) => "Transient",
            EngineError::NotFound { .. } => "NotFound",
            EngineError::AlreadyExists { .. } => "AlreadyExists",
            EngineError::LimitExceeded(_) => "LimitExceeded",
            EngineError::InvalidTransition { .. } => "InvalidTransition",
            EngineError::InvalidItem(_) => "InvalidItem",
        }
    }

    /// Only transient failures are worth resubmitting unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }
}
