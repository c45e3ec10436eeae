//! Error types for the CoucheStor derived data cache
//!
//! Leaf stores use these errors internally. At the [`CacheBackend`] boundary
//! every error is converted into a miss or a skipped write, so callers of the
//! cache never observe them directly.
//!
//! [`CacheBackend`]: crate::backend::CacheBackend

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the cache
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error (missing or locked file, disk full)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Trailer hash mismatch, truncated file or invalid structured payload
    #[error("Corrupt data in {location}: {reason}")]
    Corruption { location: String, reason: String },

    /// Path or key exceeds a platform or backend limit
    #[error("Capacity exceeded for {what}: {len} > {limit}")]
    Capacity {
        what: String,
        len: usize,
        limit: usize,
    },

    /// Backend failed its startup probe and is disabled for the process lifetime
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Write attempted against a non-writable tier
    #[error("Backend is read-only: {0}")]
    BackendReadOnly(String),

    /// Key absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Record already carries an attachment with this id
    #[error("Duplicate attachment id: {0}")]
    DuplicateAttachment(String),

    /// Invalid bucket name
    #[error("Invalid cache bucket name '{name}': {reason}")]
    InvalidBucket { name: String, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    /// Metrics encoding error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a corruption error for a location
    pub fn corruption(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Corruption {
            location: location.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if the error indicates corrupt stored data
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption { .. })
    }

    /// Returns true if the error means the item simply does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_not_found_is_not_found() {
        let err = Error::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(err.is_not_found());
        assert!(!err.is_corruption());
    }

    #[test]
    fn test_corruption_display() {
        let err = Error::corruption("Content/ab/cd/ef.blob", "hash mismatch");
        assert!(err.is_corruption());
        assert_eq!(
            err.to_string(),
            "Corrupt data in Content/ab/cd/ef.blob: hash mismatch"
        );
    }

    #[test]
    fn test_capacity_display() {
        let err = Error::Capacity {
            what: "legacy key".to_string(),
            len: 300,
            limit: 120,
        };
        assert_eq!(err.to_string(), "Capacity exceeded for legacy key: 300 > 120");
    }
}
