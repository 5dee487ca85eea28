//! # Cache
//!
//! A persistent key → (value, expiry) store with independent time-to-live
//! settings per namespace.
//!
//! ## Features
//!
//! - **Namespaces**: query results and embeddings expire independently
//! - **Lazy Expiry**: expired entries are treated as absent on read
//! - **Content Keys**: keys are SHA-256 digests of the semantic input
//! - **Persistence**: optional JSON snapshots written atomically
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Cache Store                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  cache_key() ──► CacheStore ──► CacheEntry                     │
//! │                      │              │                           │
//! │                      ▼              ▼                           │
//! │                CacheOptions       Clock                        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod clock;
pub mod error;
pub mod key;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CacheError, Result};
pub use key::{cache_key, normalize_whitespace};
pub use store::{
    CacheEntry, CacheOptions, CacheStats, CacheStore, DEFAULT_EMBEDDING_TTL, DEFAULT_QUERY_TTL,
    Namespace, NamespaceStats,
};
