use ulid::Ulid;

use crate::model::Day;

/// Closed taxonomy for admission and transfer decisions.
///
/// Every rule violation surfaces as one of these, user-displayable and with
/// no partial mutation behind it. `Storage` is the odd one out: it means
/// "the system is unavailable", not "this action is illegal", and callers
/// are expected to treat it differently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    Validation(&'static str),
    CapacityExceeded { day: Day, max_capacity: u32 },
    Authentication,
    Authorization(&'static str),
    Conflict(&'static str),
    TransferExpired(Ulid),
    RateLimitExceeded { purpose: &'static str },
    Storage(String),
}

impl AdmissionError {
    /// Machine-readable kind, also used as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            AdmissionError::Validation(_) => "validation",
            AdmissionError::CapacityExceeded { .. } => "capacity_exceeded",
            AdmissionError::Authentication => "authentication",
            AdmissionError::Authorization(_) => "authorization",
            AdmissionError::Conflict(_) => "conflict",
            AdmissionError::TransferExpired(_) => "transfer_expired",
            AdmissionError::RateLimitExceeded { .. } => "rate_limited",
            AdmissionError::Storage(_) => "storage",
        }
    }

    /// True for rule violations; false when the system itself failed.
    pub fn is_rule_violation(&self) -> bool {
        !matches!(self, AdmissionError::Storage(_))
    }
}

impl std::fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionError::Validation(msg) => write!(f, "invalid request: {msg}"),
            AdmissionError::CapacityExceeded { day, max_capacity } => {
                write!(f, "{day} is fully booked ({max_capacity} spots)")
            }
            AdmissionError::Authentication => write!(f, "no authenticated identity"),
            AdmissionError::Authorization(msg) => write!(f, "not allowed: {msg}"),
            AdmissionError::Conflict(msg) => write!(f, "conflict: {msg}"),
            AdmissionError::TransferExpired(id) => write!(f, "transfer {id} has expired"),
            AdmissionError::RateLimitExceeded { purpose } => {
                write!(f, "too many requests for {purpose}, try again later")
            }
            AdmissionError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for AdmissionError {}
