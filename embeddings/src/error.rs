//! Error types for the embeddings system.

use thiserror::Error;

/// Result type alias for embedding operations.
pub type Result<T> = std::result::Result<T, EmbeddingError>;

/// Errors that can occur in the embeddings system.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    /// Provider not configured.
    #[error("embedding provider not configured")]
    ProviderNotConfigured,

    /// API request failed with a non-success status.
    #[error("API request failed with status {status}: {message}")]
    ApiRequest { status: u16, message: String },

    /// Invalid response from provider.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Rate limit exceeded.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// The provider kept failing until the retry budget ran out.
    #[error("embedding provider {provider} unavailable after {attempts} attempts: {last_error}")]
    ProviderUnavailable {
        provider: String,
        attempts: u32,
        last_error: String,
    },

    /// Dimension mismatch.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Cache error.
    #[error("cache error: {0}")]
    Cache(#[from] codelens_cache::CacheError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl EmbeddingError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            EmbeddingError::RateLimited { .. } => true,
            EmbeddingError::ApiRequest { status, .. } => *status >= 500 || *status == 408,
            EmbeddingError::Http(e) => !e.is_decode() && !e.is_builder(),
            _ => false,
        }
    }
}
