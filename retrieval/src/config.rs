//! Configuration for the retrieval engine.
//!
//! Every field has a default, so a TOML file only needs the keys it changes:
//!
//! ```toml
//! data_dir = "/var/lib/codelens"
//!
//! [cache]
//! query_ttl_secs = 3600
//!
//! [embedding]
//! provider = "ollama"
//! dimension = 768
//!
//! [search]
//! top_k = 50
//! top_n = 10
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use codelens_cache::{CacheOptions, DEFAULT_EMBEDDING_TTL, DEFAULT_QUERY_TTL};
use codelens_embeddings::{AnnConfig, DEFAULT_DIMENSION, GatewayConfig, ProviderFamily};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RetrievalError};

/// Configuration for the retrieval engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Where the manifest, index and cache snapshots live. `None` keeps
    /// everything in memory.
    pub data_dir: Option<PathBuf>,

    /// Cache configuration.
    pub cache: CacheConfig,

    /// Embedding provider configuration.
    pub embedding: EmbeddingConfig,

    /// Query configuration.
    pub search: SearchConfig,

    /// Vector index and chunking configuration.
    pub index: IndexConfig,
}

impl RetrievalConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        toml::from_str(toml).map_err(|e| RetrievalError::Config(e.to_string()))
    }

    /// Load a TOML file, apply environment overrides, and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            RetrievalError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Persist state under `dir`.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Set the cache configuration.
    pub fn with_cache(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }

    /// Set the embedding configuration.
    pub fn with_embedding(mut self, config: EmbeddingConfig) -> Self {
        self.embedding = config;
        self
    }

    /// Set the search configuration.
    pub fn with_search(mut self, config: SearchConfig) -> Self {
        self.search = config;
        self
    }

    /// Set the index configuration.
    pub fn with_index(mut self, config: IndexConfig) -> Self {
        self.index = config;
        self
    }

    /// Apply `CODELENS_*` and `OPENAI_API_KEY` environment variables.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("CODELENS_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(v) = parse(&lookup, "CODELENS_CACHE_ENABLED")? {
            self.cache.enabled = v;
        }
        if let Some(v) = parse(&lookup, "CODELENS_QUERY_CACHE_TTL_SECS")? {
            self.cache.query_ttl_secs = v;
        }
        if let Some(v) = parse(&lookup, "CODELENS_EMBEDDING_CACHE_TTL_SECS")? {
            self.cache.embedding_ttl_secs = v;
        }
        if let Some(v) = lookup("CODELENS_EMBEDDING_PROVIDER") {
            self.embedding.provider = match v.to_ascii_lowercase().as_str() {
                "openai" => EmbeddingProviderType::OpenAI,
                "ollama" => EmbeddingProviderType::Ollama,
                "hashing" => EmbeddingProviderType::Hashing,
                other => {
                    return Err(RetrievalError::Config(format!(
                        "unknown embedding provider: {other}"
                    )));
                }
            };
        }
        if let Some(v) = lookup("CODELENS_EMBEDDING_MODEL") {
            self.embedding.model = Some(v);
        }
        if let Some(v) = lookup("CODELENS_EMBEDDING_BASE_URL") {
            self.embedding.base_url = Some(v);
        }
        if let Some(v) = parse(&lookup, "CODELENS_EMBEDDING_BATCH_SIZE")? {
            self.embedding.batch_size = Some(v);
        }
        if let Some(v) = parse(&lookup, "CODELENS_DIMENSION")? {
            self.embedding.dimension = v;
        }
        if let Some(v) = lookup("OPENAI_API_KEY") {
            self.embedding.api_key = Some(v);
        }
        if let Some(v) = parse(&lookup, "CODELENS_TOP_K")? {
            self.search.top_k = v;
        }
        if let Some(v) = parse(&lookup, "CODELENS_TOP_N")? {
            self.search.top_n = v;
        }
        if let Some(v) = parse(&lookup, "CODELENS_APPROXIMATE_SEARCH")? {
            self.search.use_approximate = v;
        }
        if let Some(v) = parse(&lookup, "CODELENS_REBUILD_THRESHOLD")? {
            self.index.rebuild_threshold = v;
        }
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(RetrievalError::Config(msg.to_string()));

        if self.embedding.dimension == 0 {
            return fail("embedding.dimension must be positive");
        }
        if self.embedding.batch_size == Some(0) {
            return fail("embedding.batch_size must be positive");
        }
        if self.embedding.max_attempts == 0 {
            return fail("embedding.max_attempts must be positive");
        }
        if self.search.top_k == 0 || self.search.top_n == 0 {
            return fail("search.top_k and search.top_n must be positive");
        }
        if self.search.top_n > self.search.top_k {
            return fail("search.top_n cannot exceed search.top_k");
        }
        if self.search.timeout_secs == 0 {
            return fail("search.timeout_secs must be positive");
        }
        if !(self.index.rebuild_threshold > 0.0 && self.index.rebuild_threshold <= 1.0) {
            return fail("index.rebuild_threshold must be in (0, 1]");
        }
        if self.index.nprobe == 0 {
            return fail("index.nprobe must be positive");
        }
        if self.index.chunk_max_lines == 0 {
            return fail("index.chunk_max_lines must be positive");
        }
        Ok(())
    }

    /// Cache store options.
    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            enabled: self.cache.enabled,
            query_ttl: Duration::from_secs(self.cache.query_ttl_secs),
            embedding_ttl: Duration::from_secs(self.cache.embedding_ttl_secs),
        }
    }

    /// Gateway settings for a provider family.
    pub fn gateway_config(&self, family: ProviderFamily) -> GatewayConfig {
        let embedding = &self.embedding;
        GatewayConfig::for_family(family, embedding.dimension)
            .with_batch_size(
                embedding
                    .batch_size
                    .unwrap_or_else(|| family.default_batch_size()),
            )
            .with_retry(
                embedding.max_attempts,
                Duration::from_millis(embedding.initial_backoff_ms),
                Duration::from_millis(embedding.max_backoff_ms),
            )
    }

    /// Approximate index tuning.
    pub fn ann_config(&self) -> AnnConfig {
        AnnConfig {
            rebuild_threshold: self.index.rebuild_threshold,
            nprobe: self.index.nprobe,
            min_training_size: self.index.min_training_size,
            ..AnnConfig::default()
        }
    }
}

fn parse<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| RetrievalError::Config(format!("invalid value for {key}: {raw}"))),
        None => Ok(None),
    }
}

/// Configuration for the cache store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether caching is enabled.
    pub enabled: bool,

    /// Lifetime of cached query results.
    pub query_ttl_secs: u64,

    /// Lifetime of cached embeddings. Zero disables embedding caching.
    pub embedding_ttl_secs: u64,

    /// Interval for sweeping expired entries; `None` relies on lazy expiry.
    pub sweep_interval_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            query_ttl_secs: DEFAULT_QUERY_TTL.as_secs(),
            embedding_ttl_secs: DEFAULT_EMBEDDING_TTL.as_secs(),
            sweep_interval_secs: None,
        }
    }
}

/// Type of embedding provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProviderType {
    /// OpenAI embeddings API.
    #[serde(rename = "openai")]
    OpenAI,
    /// Local Ollama server.
    Ollama,
    /// Offline hashing embedder.
    Hashing,
}

/// Configuration for the embedding provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Which provider to use.
    pub provider: EmbeddingProviderType,

    /// Model override.
    pub model: Option<String>,

    /// API base URL override.
    pub base_url: Option<String>,

    /// API key; usually taken from `OPENAI_API_KEY`.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    /// Vector dimension, fixed for the lifetime of an index.
    pub dimension: usize,

    /// Texts per provider call; defaults by provider family.
    pub batch_size: Option<usize>,

    /// Provider calls per batch before giving up.
    pub max_attempts: u32,

    /// First retry delay.
    pub initial_backoff_ms: u64,

    /// Largest retry delay.
    pub max_backoff_ms: u64,

    /// Per-request HTTP timeout.
    pub request_timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderType::OpenAI,
            model: None,
            base_url: None,
            api_key: None,
            dimension: DEFAULT_DIMENSION,
            batch_size: None,
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            request_timeout_secs: 30,
        }
    }
}

/// Configuration for query processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Candidates retrieved from the vector index before filtering.
    pub top_k: usize,

    /// Results returned when the caller does not ask for a count.
    pub top_n: usize,

    /// Use the approximate index instead of exhaustive scoring.
    pub use_approximate: bool,

    /// Deadline for one query.
    pub timeout_secs: u64,
}

impl SearchConfig {
    /// Deadline for one query.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: 20,
            top_n: 5,
            use_approximate: true,
            timeout_secs: 30,
        }
    }
}

/// Configuration for the vector index and the fallback chunker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Fraction of vectors changed since the last build that triggers a rebuild.
    pub rebuild_threshold: f64,

    /// Clusters searched per approximate query.
    pub nprobe: usize,

    /// Below this many vectors, approximate search runs exactly.
    pub min_training_size: usize,

    /// Lines per chunk for the line chunker.
    pub chunk_max_lines: usize,

    /// Lines shared by consecutive chunks.
    pub chunk_overlap: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        let ann = AnnConfig::default();
        Self {
            rebuild_threshold: ann.rebuild_threshold,
            nprobe: ann.nprobe,
            min_training_size: ann.min_training_size,
            chunk_max_lines: 40,
            chunk_overlap: 5,
        }
    }
}
