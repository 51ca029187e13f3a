//! Error types for CrystalStore
//!
//! This module defines the common error taxonomy used throughout the
//! engine. I/O and backend failures are surfaced as values; the crystal
//! lifecycle controller decides escalation.

use thiserror::Error;

/// Common result type for CrystalStore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for CrystalStore
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying file I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backing resource (file, object) does not exist or is too short
    #[error("not found: {0}")]
    NotFound(String),

    /// An I/O operation exceeded its wait bound
    #[error("operation timed out")]
    Timeout,

    /// Payload exceeds a configured size limit
    #[error("size {size} exceeds limit {limit}")]
    OverSizeLimit { size: u64, limit: u64 },

    /// Serialization or deserialization failure
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Resource already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Invalid or inconsistent configuration
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Object-storage backend failure
    #[error("backend error: {0}")]
    Backend(String),

    /// Internal invariant violation
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create a backend error
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Backend(_))
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::backend("connection refused").is_retryable());
        assert!(!Error::not_found("x").is_retryable());
        assert!(!Error::invalid_configuration("x").is_retryable());
    }

    #[test]
    fn test_error_not_found() {
        assert!(Error::not_found("data/counter.bin").is_not_found());
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(Error::Io(io).is_not_found());
        assert!(!Error::Timeout.is_not_found());
    }
}
