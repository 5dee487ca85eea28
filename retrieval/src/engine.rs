//! Retrieval engine implementation.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use codelens_cache::{
    CacheStats, CacheStore, Clock, Namespace, cache_key, normalize_whitespace,
};
use codelens_embeddings::{
    EmbeddingGateway, EmbeddingProvider, HashingProvider, IndexStats, OllamaProvider,
    OpenAIProvider, VectorIndex,
};
use codelens_indexer::{
    Chunker, Divergence, FileInput, FileMetadata, IndexManifest, IndexRunStats, Indexer,
    LineChunker, ReconcileOutcome, RemoveOutcome,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{EmbeddingConfig, EmbeddingProviderType, RetrievalConfig};
use crate::error::{Result, RetrievalError};
use crate::filters::SearchFilters;

/// Cache snapshot file name inside the data directory.
const CACHE_FILE: &str = "cache.json";

/// Bumped when the cached result layout changes.
const QUERY_KEY_VERSION: &str = "search/v1";

/// A ranked search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Vector id of the chunk (`path#index`).
    pub chunk_id: String,

    /// File the chunk belongs to.
    pub path: String,

    /// Cosine similarity to the query.
    pub score: f32,

    /// File metadata at the time of the search.
    pub metadata: FileMetadata,

    /// Chunk metadata from the chunker (line span, ...).
    pub chunk: Option<serde_json::Value>,
}

/// Semantic search over an incrementally indexed codebase.
///
/// A query runs cache check, embed, vector search, filter, cache write. Any
/// change to the index invalidates cached query results; cached embeddings
/// stay valid because they depend only on the text.
pub struct RetrievalEngine {
    config: RetrievalConfig,
    cache: Arc<CacheStore>,
    gateway: Arc<EmbeddingGateway>,
    indexer: Indexer,
    /// Bumped on every index mutation and mixed into query keys.
    generation: AtomicU64,
    sweeper: Option<JoinHandle<()>>,
}

impl RetrievalEngine {
    /// Create a builder.
    pub fn builder() -> RetrievalEngineBuilder {
        RetrievalEngineBuilder::new()
    }

    /// Create an engine from configuration alone.
    pub async fn new(config: RetrievalConfig) -> Result<Self> {
        Self::builder().with_config(config).build().await
    }

    /// Engine configuration.
    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Search with the configured default result count.
    pub async fn search_default(
        &self,
        query: &str,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchResult>> {
        self.search(query, filters, self.config.search.top_n).await
    }

    /// Return up to `top_k` chunks most similar to `query` that pass
    /// `filters`, ordered by score descending and then chunk id.
    ///
    /// A query that exceeds the configured deadline fails with
    /// [`RetrievalError::Timeout`] and writes nothing to the cache.
    pub async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        top_k: usize,
    ) -> Result<Vec<SearchResult>> {
        let deadline = self.config.search.timeout();
        match tokio::time::timeout(deadline, self.run_search(query, filters, top_k)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Search timed out after {deadline:?}");
                Err(RetrievalError::Timeout(deadline))
            }
        }
    }

    async fn run_search(
        &self,
        query: &str,
        filters: &SearchFilters,
        top_k: usize,
    ) -> Result<Vec<SearchResult>> {
        let normalized = normalize_query(query);
        if normalized.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let approximate = self.config.search.use_approximate;
        let generation = self.generation.load(Ordering::SeqCst);
        let key = cache_key([
            QUERY_KEY_VERSION,
            &generation.to_string(),
            &normalized,
            &filters.cache_fragment(),
            &top_k.to_string(),
            if approximate { "approximate" } else { "exact" },
        ]);

        if let Some(hit) = self
            .cache
            .get_json::<Vec<SearchResult>>(Namespace::Query, &key)
        {
            debug!("Query cache hit for {normalized:?}");
            return Ok(hit);
        }

        let vector = self.gateway.embed_one(&normalized).await?;

        // Filters drop candidates, so retrieve a wider pool than requested.
        let pool = self.config.search.top_k.max(top_k);
        let results: Vec<SearchResult> = {
            let index = self.indexer.index().read().await;
            let manifest = self.indexer.manifest().read().await;

            index
                .search(&vector, pool, approximate)?
                .into_iter()
                .filter_map(|hit| {
                    let path = index.get(&hit.id)?.origin.clone()?;
                    let record = manifest.get(&path)?;
                    filters.admits(&record.metadata).then(|| SearchResult {
                        chunk_id: hit.id,
                        path,
                        score: hit.score,
                        metadata: record.metadata.clone(),
                        chunk: hit.metadata,
                    })
                })
                .take(top_k)
                .collect()
        };

        if let Err(e) = self.cache.set_json(Namespace::Query, &key, &results) {
            warn!("Failed to cache query result: {e}");
        }
        debug!(
            "Query {:?} returned {} results from a pool of {}",
            normalized,
            results.len(),
            pool
        );
        Ok(results)
    }

    /// Index or re-index one file.
    pub async fn index(
        &self,
        path: &str,
        content: &str,
        metadata: FileMetadata,
    ) -> Result<ReconcileOutcome> {
        let outcome = self.indexer.reconcile(path, content, metadata).await?;
        if outcome != ReconcileOutcome::Unchanged {
            self.invalidate_queries();
        }
        Ok(outcome)
    }

    /// Remove a file from the index.
    pub async fn deindex(&self, path: &str) -> Result<RemoveOutcome> {
        let outcome = self.indexer.remove(path).await?;
        if outcome != RemoveOutcome::NotIndexed {
            self.invalidate_queries();
        }
        Ok(outcome)
    }

    /// Reconcile a full corpus; indexed paths missing from `inputs` are removed.
    pub async fn index_all(&self, inputs: Vec<FileInput>) -> IndexRunStats {
        let stats = self.indexer.reconcile_all(inputs).await;
        // Metadata-only refreshes are counted as unchanged but still matter
        // to filters, so any run invalidates.
        self.invalidate_queries();
        stats
    }

    /// Paths whose manifest record and vectors disagree.
    pub async fn audit(&self) -> Vec<Divergence> {
        self.indexer.audit().await
    }

    /// Drop divergent paths so the next index call rebuilds them.
    pub async fn repair(&self) -> Result<usize> {
        let repaired = self.indexer.repair().await?;
        if repaired > 0 {
            self.invalidate_queries();
        }
        Ok(repaired)
    }

    /// Clear one cache namespace, or all of them.
    pub fn cache_clear(&self, namespace: Option<Namespace>) -> usize {
        let cleared = self.cache.clear(namespace);
        info!("Cleared {cleared} cache entries");
        cleared
    }

    /// Cache hit/miss counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Number of embedding provider calls so far.
    pub fn provider_calls(&self) -> u64 {
        self.gateway.provider_calls()
    }

    /// Write the manifest, index and cache to the data directory, if any.
    pub async fn persist(&self) -> Result<()> {
        let Some(dir) = &self.config.data_dir else {
            debug!("No data directory configured; nothing to persist");
            return Ok(());
        };
        self.indexer.persist(dir).await?;
        self.cache.flush().await?;
        info!("Persisted retrieval state to {}", dir.display());
        Ok(())
    }

    /// Get statistics about the engine.
    pub async fn stats(&self) -> EngineStats {
        let index = self.indexer.index().read().await.stats();
        let files = self.indexer.manifest().read().await.len();
        EngineStats {
            files,
            index,
            cache: self.cache.stats(),
            provider_calls: self.gateway.provider_calls(),
        }
    }

    fn invalidate_queries(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let cleared = self.cache.clear(Some(Namespace::Query));
        if cleared > 0 {
            debug!("Index changed; dropped {cleared} cached query results");
        }
    }
}

impl Drop for RetrievalEngine {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

/// Lowercase and collapse whitespace so formatting differences share a key.
fn normalize_query(query: &str) -> String {
    normalize_whitespace(query).to_lowercase()
}

/// Build the provider named by the configuration.
fn build_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    let timeout = Duration::from_secs(config.request_timeout_secs);
    let provider: Arc<dyn EmbeddingProvider> = match config.provider {
        EmbeddingProviderType::OpenAI => {
            let mut provider = OpenAIProvider::new().with_timeout(timeout);
            if let Some(key) = &config.api_key {
                provider = provider.with_api_key(key);
            }
            if let Some(url) = &config.base_url {
                provider = provider.with_base_url(url);
            }
            if let Some(model) = &config.model {
                provider = provider.with_model(model);
            }
            if provider.dimension() != config.dimension {
                provider = provider.with_dimensions(config.dimension);
            }
            if !provider.is_available() {
                return Err(RetrievalError::Config(
                    "openai provider requires OPENAI_API_KEY".to_string(),
                ));
            }
            Arc::new(provider)
        }
        EmbeddingProviderType::Ollama => {
            let mut provider = OllamaProvider::new().with_timeout(timeout).with_model(
                config.model.as_deref().unwrap_or("nomic-embed-text"),
                config.dimension,
            );
            if let Some(url) = &config.base_url {
                provider = provider.with_base_url(url);
            }
            Arc::new(provider)
        }
        EmbeddingProviderType::Hashing => Arc::new(HashingProvider::new(config.dimension)),
    };
    Ok(provider)
}

/// Builder for [`RetrievalEngine`].
pub struct RetrievalEngineBuilder {
    config: RetrievalConfig,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    chunker: Option<Arc<dyn Chunker>>,
    clock: Option<Arc<dyn Clock>>,
}

impl RetrievalEngineBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: RetrievalConfig::default(),
            provider: None,
            chunker: None,
            clock: None,
        }
    }

    /// Use this configuration.
    pub fn with_config(mut self, config: RetrievalConfig) -> Self {
        self.config = config;
        self
    }

    /// Use this embedding provider instead of the configured one.
    pub fn with_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Use this chunker instead of the line chunker.
    pub fn with_chunker(mut self, chunker: Arc<dyn Chunker>) -> Self {
        self.chunker = Some(chunker);
        self
    }

    /// Use this clock for cache expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Persist state under `dir`.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = Some(dir.into());
        self
    }

    /// Enable or disable approximate search.
    pub fn with_approximate_search(mut self, enabled: bool) -> Self {
        self.config.search.use_approximate = enabled;
        self
    }

    /// Build the engine, loading persisted state if a data directory is set.
    pub async fn build(self) -> Result<RetrievalEngine> {
        let config = self.config;
        config.validate()?;

        let provider = match self.provider {
            Some(provider) => provider,
            None => build_provider(&config.embedding)?,
        };
        if provider.dimension() != config.embedding.dimension {
            return Err(RetrievalError::DimensionMismatch {
                expected: config.embedding.dimension,
                actual: provider.dimension(),
            });
        }

        let mut cache = match &config.data_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                CacheStore::with_persistence(dir.join(CACHE_FILE), config.cache_options()).await?
            }
            None => CacheStore::new(config.cache_options()),
        };
        if let Some(clock) = self.clock {
            cache = cache.with_clock(clock);
        }
        let cache = Arc::new(cache);

        let gateway = Arc::new(
            EmbeddingGateway::new(provider.clone(), cache.clone())
                .with_config(config.gateway_config(provider.family())),
        );
        let chunker = self.chunker.unwrap_or_else(|| {
            Arc::new(LineChunker::new(
                config.index.chunk_max_lines,
                config.index.chunk_overlap,
            ))
        });

        let dimension = config.embedding.dimension;
        let indexer = match &config.data_dir {
            Some(dir) => {
                let indexer =
                    Indexer::open(dir, dimension, config.ann_config(), gateway.clone(), chunker)
                        .await?;
                // Results cached by an earlier process may predate a repair.
                cache.clear(Some(Namespace::Query));
                indexer
            }
            None => Indexer::new(
                VectorIndex::new(dimension).with_ann_config(config.ann_config()),
                IndexManifest::new(),
                gateway.clone(),
                chunker,
            ),
        };

        let sweeper = config
            .cache
            .sweep_interval_secs
            .map(|secs| cache.spawn_sweeper(Duration::from_secs(secs.max(1))));

        info!(
            "Retrieval engine ready: provider={} model={} dimension={} approximate={}",
            provider.name(),
            provider.model(),
            dimension,
            config.search.use_approximate
        );

        Ok(RetrievalEngine {
            config,
            cache,
            gateway,
            indexer,
            generation: AtomicU64::new(0),
            sweeper,
        })
    }
}

impl Default for RetrievalEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about the retrieval engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    /// Number of indexed files.
    pub files: usize,

    /// Vector index statistics.
    pub index: IndexStats,

    /// Cache statistics.
    pub cache: CacheStats,

    /// Embedding provider calls made so far.
    pub provider_calls: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_normalize_query() {
        assert_eq!(normalize_query("  Find   the\tParser "), "find the parser");
    }

    #[test]
    fn test_openai_without_key_is_rejected() {
        let config = EmbeddingConfig {
            api_key: None,
            ..EmbeddingConfig::default()
        };
        // The environment may carry a key; only assert when it does not.
        if std::env::var("OPENAI_API_KEY").is_err() {
            assert!(matches!(
                build_provider(&config),
                Err(RetrievalError::Config(_))
            ));
        }
    }

    #[test]
    fn test_build_local_providers() {
        let config = EmbeddingConfig {
            provider: EmbeddingProviderType::Ollama,
            dimension: 768,
            ..EmbeddingConfig::default()
        };
        let provider = build_provider(&config).unwrap();
        assert_eq!(provider.name(), "ollama");
        assert_eq!(provider.dimension(), 768);

        let config = EmbeddingConfig {
            provider: EmbeddingProviderType::Hashing,
            dimension: 64,
            ..EmbeddingConfig::default()
        };
        assert_eq!(build_provider(&config).unwrap().dimension(), 64);
    }

    #[tokio::test]
    async fn test_provider_dimension_must_match_config() {
        let result = RetrievalEngine::builder()
            .with_provider(Arc::new(HashingProvider::new(16)))
            .build()
            .await;

        assert!(matches!(
            result,
            Err(RetrievalError::DimensionMismatch {
                expected: 1536,
                actual: 16
            })
        ));
    }
}
