//! Error types for the ledger

use std::fmt;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Validation failure (bad input, missing signer, misused batch, bad config)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Tamper detected. Never retry, never downgrade to a boolean.
    #[error("Integrity violation: {0}")]
    Integrity(Box<IntegrityViolation>),

    /// Storage backend failure
    #[error("Storage error during {operation} on {backend}: {message}")]
    Storage {
        /// Operation that failed (`append`, `get_entries`, ...)
        operation: String,
        /// Backend identifier
        backend: String,
        /// Backend-provided detail
        message: String,
    },

    /// Signing or signature verification failed
    #[error("Signature error: {0}")]
    Signature(String),

    /// Referenced entry does not exist
    #[error("Entry not found: {0}")]
    NotFound(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a storage error
    pub fn storage(
        operation: impl Into<String>,
        backend: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Storage {
            operation: operation.into(),
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Build an integrity error
    pub fn integrity(
        kind: ViolationKind,
        entry_id: impl Into<String>,
        expected: Option<String>,
        actual: Option<String>,
    ) -> Self {
        Error::Integrity(Box::new(IntegrityViolation {
            kind,
            entry_id: entry_id.into(),
            expected,
            actual,
        }))
    }

    /// True when the error signals tampering rather than an ordinary failure.
    ///
    /// Callers should treat this as a security incident (e.g. halt writes).
    pub fn is_integrity(&self) -> bool {
        matches!(self, Error::Integrity(_))
    }

    /// Integrity details, if this is an integrity error
    pub fn integrity_violation(&self) -> Option<&IntegrityViolation> {
        match self {
            Error::Integrity(violation) => Some(&**violation),
            _ => None,
        }
    }
}

/// What kind of tampering was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// `previous_hash` does not match the predecessor's hash
    BrokenLink,
    /// Stored hash does not match the recomputed hash
    HashMismatch,
    /// Sequence number does not follow the predecessor's
    SequenceGap,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationKind::BrokenLink => write!(f, "hash chain broken"),
            ViolationKind::HashMismatch => write!(f, "invalid hash"),
            ViolationKind::SequenceGap => write!(f, "sequence gap"),
        }
    }
}

/// Diagnostics for an integrity failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityViolation {
    /// Kind of violation
    pub kind: ViolationKind,
    /// Offending entry
    pub entry_id: String,
    /// Value the chain requires
    pub expected: Option<String>,
    /// Value actually stored
    pub actual: Option<String>,
}

impl fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at entry {} (expected {}, actual {})",
            self.kind,
            self.entry_id,
            self.expected.as_deref().unwrap_or("<none>"),
            self.actual.as_deref().unwrap_or("<none>"),
        )
    }
}
