//! crates/circulation_core/src/error.rs
//!
//! The error taxonomy reported to callers of the circulation engine.

use crate::ports::PortError;

/// Every rejection the engine can hand back to a caller.
///
/// All variants except `Internal` are clean business-rule rejections: no state
/// changed and the caller can explain the outcome to the member. `Internal`
/// means the storage layer failed and the outcome should be treated as unknown.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CirculationError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("borrowing limit reached: {0} books already on loan")]
    LimitExceeded(i64),

    #[error("this book is already on loan to the member")]
    AlreadyHeld,

    #[error("no copies of this book are available")]
    OutOfStock,

    #[error("no active loan found for this member and book")]
    NoActiveRecord,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CirculationError {
    /// A stable, machine-readable code for the rejection.
    pub fn code(&self) -> &'static str {
        match self {
            CirculationError::InvalidRequest(_) => "INVALID_REQUEST",
            CirculationError::LimitExceeded(_) => "LIMIT_EXCEEDED",
            CirculationError::AlreadyHeld => "ALREADY_HELD",
            CirculationError::OutOfStock => "OUT_OF_STOCK",
            CirculationError::NoActiveRecord => "NO_ACTIVE_RECORD",
            CirculationError::NotFound(_) => "NOT_FOUND",
            CirculationError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Port failures outside a unit of work (reporting reads) carry no business
/// meaning beyond lookups, so anything else is an internal error.
impl From<PortError> for CirculationError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::NotFound(what) => CirculationError::NotFound(what),
            PortError::OutOfStock => CirculationError::OutOfStock,
            PortError::NoActiveRecord => CirculationError::NoActiveRecord,
            PortError::Duplicate(_) => CirculationError::AlreadyHeld,
            other => CirculationError::Internal(other.to_string()),
        }
    }
}

pub type CirculationResult<T> = Result<T, CirculationError>;
