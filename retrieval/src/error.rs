//! Error types for the retrieval engine.

use std::time::Duration;

use codelens_cache::CacheError;
use codelens_embeddings::EmbeddingError;
use codelens_indexer::IndexerError;
use thiserror::Error;

/// Result type alias for retrieval operations.
pub type Result<T> = std::result::Result<T, RetrievalError>;

/// Errors that can occur in the retrieval engine.
///
/// An empty result list means "no matches"; every failure is one of these.
#[derive(Error, Debug)]
pub enum RetrievalError {
    /// The embedding provider kept failing until retries ran out.
    #[error("embedding provider {provider} unavailable after {attempts} attempts: {message}")]
    ProviderUnavailable {
        provider: String,
        attempts: u32,
        message: String,
    },

    /// A vector had the wrong length.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The vector index could not be loaded.
    #[error("index unavailable: {0}")]
    IndexUnavailable(String),

    /// The query did not finish in time.
    #[error("search timed out after {0:?}")]
    Timeout(Duration),

    /// Manifest and index disagree about a path.
    #[error("manifest inconsistency for {path}: {detail}")]
    ManifestInconsistency { path: String, detail: String },

    /// Other embedding error.
    #[error("embedding error: {0}")]
    Embedding(#[source] EmbeddingError),

    /// Other indexing error.
    #[error("indexer error: {0}")]
    Indexer(#[source] IndexerError),

    /// Cache persistence error.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RetrievalError {
    /// Whether the caller may retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RetrievalError::Timeout(_) | RetrievalError::ProviderUnavailable { .. }
        )
    }
}

impl From<EmbeddingError> for RetrievalError {
    fn from(err: EmbeddingError) -> Self {
        match err {
            EmbeddingError::ProviderUnavailable {
                provider,
                attempts,
                last_error,
            } => RetrievalError::ProviderUnavailable {
                provider,
                attempts,
                message: last_error,
            },
            EmbeddingError::DimensionMismatch { expected, actual } => {
                RetrievalError::DimensionMismatch { expected, actual }
            }
            other => RetrievalError::Embedding(other),
        }
    }
}

impl From<IndexerError> for RetrievalError {
    fn from(err: IndexerError) -> Self {
        match err {
            IndexerError::Embedding(e) => e.into(),
            IndexerError::IndexUnavailable(message) => RetrievalError::IndexUnavailable(message),
            IndexerError::ManifestInconsistency { path, detail } => {
                RetrievalError::ManifestInconsistency { path, detail }
            }
            other => RetrievalError::Indexer(other),
        }
    }
}
