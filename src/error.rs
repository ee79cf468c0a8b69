//! Error types for redoline
//!
//! Defines a unified error type for every stage of the commit pipeline.
//! Transient conditions (buffer space) are resolved inside the coordinator;
//! only the kinds a caller has to act on are ever returned from `commit`.

use std::fmt;
use std::io;
use std::time::Duration;

use crate::types::Lsn;

/// How a caller should treat an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Retried internally, never seen by MTR callers
    Transient,
    /// Logged, the operation went ahead
    Warning,
    /// The operation failed, the system is still usable
    Error,
    /// The system must stop accepting writes
    Fatal,
}

/// Unified error type for redo operations
#[derive(Debug)]
pub enum RedoError {
    /// I/O error outside the writer (config files, recovery reads)
    Io(io::Error),
    /// Not enough free space in the log buffer for a reservation
    BufferExhausted { requested: u64, available: u64 },
    /// A commit gave up (retry budget exceeded or impossible size)
    CommitFailed(String),
    /// Waited too long for the durable LSN to move
    DurabilityTimeout {
        target: Lsn,
        current: Lsn,
        waited: Duration,
    },
    /// The log writer failed to write or fsync the redo file
    StorageIo(String),
    /// An internal ordering invariant broke (LSN out of sequence etc.)
    OrderingViolation(String),
    /// The 64-bit LSN space would overflow
    LsnExhausted { tail: Lsn, requested: u64 },
    /// The redo file or checkpoint marker is malformed
    Corrupt(String),
    /// Invalid configuration
    Config(String),
    /// Generic internal error
    Internal(String),
}

impl RedoError {
    /// Classify the error for callers deciding whether to keep going
    pub fn severity(&self) -> Severity {
        match self {
            RedoError::BufferExhausted { .. } => Severity::Transient,
            RedoError::DurabilityTimeout { .. } => Severity::Warning,
            RedoError::StorageIo(_)
            | RedoError::OrderingViolation(_)
            | RedoError::LsnExhausted { .. } => Severity::Fatal,
            RedoError::Io(_)
            | RedoError::CommitFailed(_)
            | RedoError::Corrupt(_)
            | RedoError::Config(_)
            | RedoError::Internal(_) => Severity::Error,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }

    pub fn is_transient(&self) -> bool {
        self.severity() == Severity::Transient
    }
}

impl fmt::Display for RedoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedoError::Io(e) => write!(f, "I/O error: {}", e),
            RedoError::BufferExhausted { requested, available } => write!(
                f,
                "Log buffer exhausted: requested {} bytes, {} available",
                requested, available
            ),
            RedoError::CommitFailed(msg) => write!(f, "Commit failed: {}", msg),
            RedoError::DurabilityTimeout {
                target,
                current,
                waited,
            } => write!(
                f,
                "Timeout after {:?} waiting for LSN {} (durable: {})",
                waited, target, current
            ),
            RedoError::StorageIo(msg) => write!(f, "Redo storage failure: {}", msg),
            RedoError::OrderingViolation(msg) => write!(f, "LSN ordering violation: {}", msg),
            RedoError::LsnExhausted { tail, requested } => write!(
                f,
                "LSN space exhausted: tail {} cannot advance by {} bytes",
                tail, requested
            ),
            RedoError::Corrupt(msg) => write!(f, "Corrupt redo data: {}", msg),
            RedoError::Config(msg) => write!(f, "Invalid configuration: {}", msg),
            RedoError::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for RedoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RedoError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RedoError {
    fn from(e: io::Error) -> Self {
        RedoError::Io(e)
    }
}

impl From<serde_json::Error> for RedoError {
    fn from(e: serde_json::Error) -> Self {
        RedoError::Corrupt(e.to_string())
    }
}

impl From<bincode::Error> for RedoError {
    fn from(e: bincode::Error) -> Self {
        RedoError::Corrupt(e.to_string())
    }
}

/// Result type alias for redo operations
pub type Result<T> = std::result::Result<T, RedoError>;
