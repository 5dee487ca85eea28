//! # Embeddings
//!
//! This crate turns chunk text into dense vectors and keeps those vectors
//! searchable.
//!
//! ## Features
//!
//! - **Embedding Providers**: OpenAI, Ollama, and an offline hashing embedder
//! - **Embedding Gateway**: cache-first batching with bounded retry/backoff
//! - **Vector Index**: exact and IVF approximate top-k similarity search
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Embeddings System                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  EmbeddingGateway ──► EmbeddingProvider ──► Embedding          │
//! │       │                                         │               │
//! │       ▼                                         ▼               │
//! │  CacheStore                      VectorIndex ──► IvfIndex       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod gateway;
pub mod index;
mod ivf;
pub mod provider;
pub mod similarity;

pub use error::{EmbeddingError, Result};
pub use gateway::{EmbeddingGateway, GatewayConfig};
pub use index::{AnnConfig, IndexEntry, IndexStats, RebuildJob, TrainedIvf, VectorIndex};
pub use provider::{
    EmbeddingProvider, HashingProvider, OllamaProvider, OpenAIProvider, ProviderFamily,
};
pub use similarity::{SimilarityResult, cosine_similarity};

/// A dense vector embedding.
pub type Embedding = Vec<f32>;

/// Dimension of embeddings (varies by model).
pub const DEFAULT_DIMENSION: usize = 1536; // OpenAI text-embedding-3-small
