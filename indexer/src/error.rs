//! Error types for the indexer.

use thiserror::Error;

use codelens_embeddings::EmbeddingError;

/// Result type alias for indexer operations.
pub type Result<T> = std::result::Result<T, IndexerError>;

/// Errors that can occur while indexing.
#[derive(Error, Debug)]
pub enum IndexerError {
    /// The manifest and the vector index disagree about a path.
    #[error("manifest inconsistency for {path}: {detail}")]
    ManifestInconsistency { path: String, detail: String },

    /// The vector index or manifest could not be loaded.
    #[error("index unavailable: {0}")]
    IndexUnavailable(String),

    /// The chunker rejected a file.
    #[error("failed to chunk {path}: {message}")]
    Chunking { path: String, message: String },

    /// Embedding or vector index error.
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
