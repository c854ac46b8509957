//! Error types for regionmaster

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Log / Store Errors ===
    #[error("WAL error: {0}")]
    Wal(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Procedure store unavailable: {0}")]
    StoreUnavailable(String),

    // === Procedure Errors ===
    #[error("Unknown procedure: {0}")]
    UnknownProcedure(u64),

    #[error("Procedure {id} failed: {source}")]
    ProcedureFailed { id: u64, source: ProcedureError },

    // === Assignment Errors ===
    #[error("Region {region} is in transition, owned by {kind} procedure {owner}")]
    RegionInTransition {
        region: String,
        owner: u64,
        kind: String,
    },

    #[error("Invalid region: {0}")]
    InvalidRegion(String),

    #[error("Server not live: {0}")]
    ServerNotLive(String),

    #[error("No servers available")]
    NoServersAvailable,

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // === Generic ===
    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::NoServersAvailable | Error::RegionInTransition { .. }
        )
    }

    /// Store durability failures stop the coordinator
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

/// Why a procedure failed. Persisted with the procedure's terminal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcedureErrorKind {
    /// Bounded retry count hit (e.g. too many FAILED_OPEN reports)
    AttemptsExhausted,
    /// Rolled back by crash recovery
    Aborted,
    /// A sub-procedure failed
    ChildFailed,
    /// Invariant violation or lost lock
    Internal,
    /// A durable store write failed; the coordinator stops
    StoreUnavailable,
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct ProcedureError {
    pub kind: ProcedureErrorKind,
    pub message: String,
}

impl ProcedureError {
    pub fn new(kind: ProcedureErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn attempts_exhausted(message: impl Into<String>) -> Self {
        Self::new(ProcedureErrorKind::AttemptsExhausted, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(ProcedureErrorKind::Aborted, message)
    }

    pub fn child_failed(message: impl Into<String>) -> Self {
        Self::new(ProcedureErrorKind::ChildFailed, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ProcedureErrorKind::Internal, message)
    }

    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::new(ProcedureErrorKind::StoreUnavailable, message)
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == ProcedureErrorKind::StoreUnavailable
    }
}

impl From<Error> for ProcedureError {
    fn from(e: Error) -> Self {
        ProcedureError::internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(Error::Timeout("rpc".into()).is_retryable());
        assert!(Error::NoServersAvailable.is_retryable());
        assert!(!Error::StoreUnavailable("disk".into()).is_retryable());
        assert!(Error::StoreUnavailable("disk".into()).is_fatal());
    }

    #[test]
    fn test_procedure_error_display() {
        let err = ProcedureError::attempts_exhausted("region r1 failed 3 times");
        assert_eq!(err.kind, ProcedureErrorKind::AttemptsExhausted);
        assert!(err.to_string().contains("region r1"));

        let wrapped: ProcedureError = Error::Internal("boom".into()).into();
        assert_eq!(wrapped.kind, ProcedureErrorKind::Internal);
        assert!(!wrapped.is_fatal());
        assert!(ProcedureError::store_unavailable("disk full").is_fatal());
    }
}
