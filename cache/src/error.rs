//! Error types for the cache store.

use thiserror::Error;

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors that can occur in the cache store.
///
/// Misses are never errors; only persistence and encoding can fail.
#[derive(Error, Debug)]
pub enum CacheError {
    /// IO error while reading or writing a snapshot.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
