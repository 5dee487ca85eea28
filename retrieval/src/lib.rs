//! # Retrieval Engine
//!
//! This crate answers natural-language queries about a codebase with ranked
//! code chunks. It combines:
//!
//! - **Cache Store**: TTL caches for query results and embeddings
//! - **Embedding Gateway**: batched, retried provider calls
//! - **Vector Index**: exact or IVF approximate top-k search
//! - **Indexer**: fingerprint-based incremental re-indexing
//! - **Filters**: author, recency and complexity admission after search
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Retrieval Engine                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  search(query, filters, top_k)       index(path, content, meta)  │
//! │          │                                     │                 │
//! │          ▼                                     ▼                 │
//! │  ┌──────────────┐                     ┌──────────────┐          │
//! │  │ Query Cache  │                     │   Indexer    │          │
//! │  └──────────────┘                     └──────────────┘          │
//! │          │ miss                          │          │            │
//! │          ▼                               ▼          ▼            │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐   │
//! │  │  Embedding   │─►│  Embedding   │  │ Manifest ◄─► Vector  │   │
//! │  │   Gateway    │  │    Cache     │  │              Index   │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘   │
//! │          │                                     ▲                 │
//! │          └──── query vector ───────────────────┘                 │
//! │                          │                                       │
//! │                          ▼                                       │
//! │                  ┌──────────────┐                                │
//! │                  │   Filters    │ ──► ranked SearchResult list   │
//! │                  └──────────────┘                                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use codelens_retrieval::{FileMetadata, RetrievalConfig, RetrievalEngine, SearchFilters};
//!
//! let engine = RetrievalEngine::builder()
//!     .with_config(RetrievalConfig::load("codelens.toml")?)
//!     .build()
//!     .await?;
//!
//! engine.index("src/parser.rs", &source, FileMetadata::default()).await?;
//! let results = engine
//!     .search("where are tokens parsed", &SearchFilters::new(), 5)
//!     .await?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod filters;

pub use config::{
    CacheConfig, EmbeddingConfig, EmbeddingProviderType, IndexConfig, RetrievalConfig,
    SearchConfig,
};
pub use engine::{EngineStats, RetrievalEngine, RetrievalEngineBuilder, SearchResult};
pub use error::{Result, RetrievalError};
pub use filters::{ComplexityRange, SearchFilters};

// Re-export from dependencies for convenience
pub use codelens_cache::{CacheStats, Clock, ManualClock, Namespace, SystemClock};
pub use codelens_embeddings::{EmbeddingProvider, HashingProvider, ProviderFamily};
pub use codelens_indexer::{
    Chunk, Chunker, FileInput, FileMetadata, IndexRunStats, LineChunker, ReconcileOutcome,
    RemoveOutcome,
};
