use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// A precondition did not hold when the attempt was submitted.
    #[error("Conflict on operation {op_index}: {reason}")]
    Conflict { op_index: usize, reason: String },

    #[error("Transaction retry budget exhausted after {attempts} attempts")]
    RetryExhausted { attempts: usize },

    #[error("Store failure: {0}")]
    Fatal(String),

    #[error("Store call timed out: {0}")]
    Timeout(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Capture failed: {0}")]
    Capture(String),

    #[error("Dump failed: {0}")]
    Dump(String),

    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    #[error("I/O error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, StateError>;

/// How a caller should react to a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Contention exhausted the local retry budget; try again later.
    Retryable,
    /// The request itself is wrong and must be fixed.
    Invalid,
    /// Storage is unavailable or misbehaving; back off.
    Outage,
    /// The addressed record does not exist.
    Missing,
    /// Stored data does not have the expected shape.
    Corrupt,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Retryable => "retryable",
            Self::Invalid => "invalid",
            Self::Outage => "outage",
            Self::Missing => "missing",
            Self::Corrupt => "corrupt",
        };
        write!(f, "{label}")
    }
}

impl StateError {
    pub fn conflict(op_index: usize, reason: impl Into<String>) -> Self {
        Self::Conflict {
            op_index,
            reason: reason.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Conflict { .. } | Self::RetryExhausted { .. } => ErrorClass::Retryable,
            Self::InvalidState(_) | Self::InvalidInput(_) => ErrorClass::Invalid,
            Self::NotFound(_) => ErrorClass::Missing,
            Self::CorruptRecord(_) => ErrorClass::Corrupt,
            Self::Fatal(_)
            | Self::Timeout(_)
            | Self::Capture(_)
            | Self::Dump(_)
            | Self::Io(_) => ErrorClass::Outage,
        }
    }
}

impl From<std::io::Error> for StateError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        Self::CorruptRecord(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StateError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Fatal(format!("Failed to encode record: {}", err))
    }
}

impl From<rmp_serde::decode::Error> for StateError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::CorruptRecord(format!("Failed to decode record: {}", err))
    }
}

impl From<tokio::task::JoinError> for StateError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Fatal(format!("Background task failed: {}", err))
    }
}
