//! Common error types for hidevault.

use thiserror::Error;

/// Top-level error type for hidevault operations.
///
/// The variants follow the failure classes a caller has to react to
/// differently: a wrong password is expected and recoverable, corrupted data
/// can never be retried into success, and I/O or timeout failures can be
/// retried once the underlying condition clears.
#[derive(Debug, Error)]
pub enum Error {
    /// The supplied folder password is wrong.
    #[error("Not authorized: {0}")]
    Unauthorized(String),

    /// Ciphertext, a wrapped key or stored credentials failed integrity checks.
    #[error("Integrity check failed: {0}")]
    Corrupted(String),

    /// Cryptographic operation could not be performed (bad parameters, RNG).
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Metadata repository operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A repository call did not complete in time.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Conflict detected.
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl Error {
    /// Whether the failure was caused by a wrong password.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Error::Unauthorized(_))
    }

    /// Whether the failure indicates corrupted or tampered data.
    pub fn is_corrupted(&self) -> bool {
        matches!(self, Error::Corrupted(_))
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Timeout(_) | Error::Storage(_))
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
