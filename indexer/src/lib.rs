//! # Indexer
//!
//! Keeps a vector index in step with a changing set of source files. Each
//! file's content fingerprint and the vector ids it produced are recorded in
//! a manifest, so unchanged files are skipped and changed files replace
//! exactly the vectors they own.
//!
//! ## Features
//!
//! - **Incremental Reconcile**: fingerprint fast path, re-embed only on change
//! - **Staged Apply**: chunk and embed first, then swap vectors and manifest
//!   record together under both write guards
//! - **Self-Healing**: divergence between manifest and index is detected,
//!   logged, and recomputed from scratch
//! - **Persistence**: manifest and index snapshots written atomically
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Indexer                                 │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  (path, content, metadata) ──► fingerprint ──► Chunker          │
//! │                                                  │              │
//! │                                                  ▼              │
//! │  IndexManifest ◄──── staged apply ◄──── EmbeddingGateway        │
//! │        │                  │                                     │
//! │        └──── by path ─────┴──► VectorIndex (origin = path)      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod chunker;
pub mod error;
pub mod indexer;
pub mod manifest;

pub use chunker::{Chunk, Chunker, LineChunker};
pub use error::{IndexerError, Result};
pub use indexer::{
    Divergence, FileInput, IndexRunStats, Indexer, ReconcileOutcome, RemoveOutcome, vector_id,
};
pub use manifest::{FileMetadata, FileRecord, IndexManifest, fingerprint};
