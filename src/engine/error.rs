use thiserror::Error;
use ulid::Ulid;

use crate::model::DayId;
use crate::tz::TimeError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),

    #[error("person not found: {0}")]
    PersonNotFound(Ulid),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("no availability on record for {} on day {}", .0.person_id, crate::tz::format_date(.0.day))]
    AvailabilityNotFound(DayId),

    #[error("requested slot is not free for {0}")]
    SlotUnavailable(Ulid),

    #[error("appointment {0} is already cancelled")]
    AlreadyCancelled(Ulid),

    #[error("{requester} is not a participant of appointment {appointment}")]
    Unauthorized { appointment: Ulid, requester: Ulid },

    #[error("{0}")]
    InvalidTimeZone(String),

    #[error("{0}")]
    InvalidTimestamp(String),

    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::PersonNotFound(_) => "person_not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::AvailabilityNotFound(_) => "availability_not_found",
            EngineError::SlotUnavailable(_) => "slot_unavailable",
            EngineError::AlreadyCancelled(_) => "already_cancelled",
            EngineError::Unauthorized { .. } => "unauthorized",
            EngineError::InvalidTimeZone(_) => "invalid_time_zone",
            EngineError::InvalidTimestamp(_) => "invalid_timestamp",
            EngineError::InvalidRequest(_) => "invalid_request",
            EngineError::Timeout(_) => "timeout",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }

    /// Whether a caller may retry the identical request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Timeout(_))
    }
}

impl From<TimeError> for EngineError {
    fn from(e: TimeError) -> Self {
        match e {
            TimeError::InvalidTimeZone(_) => EngineError::InvalidTimeZone(e.to_string()),
            TimeError::InvalidTimestamp(_) => EngineError::InvalidTimestamp(e.to_string()),
            TimeError::RangeTooWide(_) => EngineError::LimitExceeded("date range too wide"),
        }
    }
}
