use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplicaError {
    #[error("Failed to open store at '{}': {reason}", location.display())]
    OpenFailure { location: PathBuf, reason: String },

    #[error("Invalid location: {0}")]
    InvalidLocation(String),

    #[error("Replica manager is not initialized")]
    NotInitialized,

    #[error("Replica manager is already initialized")]
    AlreadyInitialized,

    #[error("Replica manager is closed")]
    AlreadyClosed,

    #[error("DB handle is closed")]
    HandleClosed,

    #[error("Sequence gap: expected batch starting at {expected}, got {found}")]
    SequenceGap { expected: u64, found: u64 },

    #[error("Batch of {ops} operation(s) starting at {start} overflows the sequence space")]
    SequenceOverflow { start: u64, ops: usize },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Timed out waiting for {pending} retired handle(s) to close")]
    RetirementTimeout { pending: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

impl ReplicaError {
    pub fn open_failure(location: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::OpenFailure {
            location: location.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the caller may retry the operation, typically with a fresh
    /// snapshot. Everything else points at misuse or misconfiguration.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::OpenFailure { .. }
                | Self::SequenceGap { .. }
                | Self::Io(_)
                | Self::RetirementTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ReplicaError>;

impl<T> From<std::sync::PoisonError<T>> for ReplicaError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for ReplicaError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
