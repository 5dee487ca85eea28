//! End-to-end tests for the retrieval engine using the offline hashing
//! embedder.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use codelens_embeddings::{Embedding, EmbeddingError};
use codelens_retrieval::{
    EmbeddingProvider, EmbeddingProviderType, FileInput, FileMetadata, HashingProvider,
    ManualClock, Namespace, ProviderFamily, ReconcileOutcome, RemoveOutcome, RetrievalConfig,
    RetrievalEngine, RetrievalError, SearchFilters,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

const DIM: usize = 256;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> RetrievalConfig {
    let mut config = RetrievalConfig::default();
    config.embedding.provider = EmbeddingProviderType::Hashing;
    config.embedding.dimension = DIM;
    config
}

async fn engine_with(config: RetrievalConfig) -> RetrievalEngine {
    init_tracing();
    RetrievalEngine::builder()
        .with_config(config)
        .build()
        .await
        .unwrap()
}

async fn engine() -> RetrievalEngine {
    engine_with(config()).await
}

fn paths(results: &[codelens_retrieval::SearchResult]) -> Vec<&str> {
    results.iter().map(|r| r.path.as_str()).collect()
}

/// Sleeps far longer than any search deadline.
#[derive(Debug)]
struct StalledProvider;

#[async_trait]
impl EmbeddingProvider for StalledProvider {
    fn name(&self) -> &str {
        "stalled"
    }

    fn model(&self) -> &str {
        "stalled"
    }

    fn dimension(&self) -> usize {
        DIM
    }

    fn family(&self) -> ProviderFamily {
        ProviderFamily::Local
    }

    async fn embed(&self, texts: &[String]) -> codelens_embeddings::Result<Vec<Embedding>> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(texts.iter().map(|_| vec![1.0; DIM]).collect())
    }
}

/// Always answers 503.
#[derive(Debug, Default)]
struct DownProvider {
    calls: AtomicU64,
}

#[async_trait]
impl EmbeddingProvider for DownProvider {
    fn name(&self) -> &str {
        "down"
    }

    fn model(&self) -> &str {
        "down"
    }

    fn dimension(&self) -> usize {
        DIM
    }

    fn family(&self) -> ProviderFamily {
        ProviderFamily::OpenAI
    }

    async fn embed(&self, _texts: &[String]) -> codelens_embeddings::Result<Vec<Embedding>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(EmbeddingError::ApiRequest {
            status: 503,
            message: "service unavailable".to_string(),
        })
    }
}

#[tokio::test]
async fn test_closest_file_ranks_first() {
    let engine = engine().await;
    engine
        .index(
            "lexer.rs",
            "tokenize source text into lexer tokens",
            FileMetadata::default(),
        )
        .await
        .unwrap();
    engine
        .index(
            "server.rs",
            "bind a tcp socket and accept network connections",
            FileMetadata::default(),
        )
        .await
        .unwrap();

    let results = engine
        .search(
            "Tokenize   source text into LEXER tokens",
            &SearchFilters::new(),
            2,
        )
        .await
        .unwrap();

    assert_eq!(paths(&results), vec!["lexer.rs", "server.rs"]);
    assert!((results[0].score - 1.0).abs() < 1e-4);
    assert!(results[0].score > results[1].score);
    assert_eq!(results[0].chunk_id, "lexer.rs#0");
    let chunk = results[0].chunk.as_ref().unwrap();
    assert_eq!(chunk["start_line"], 1);
}

#[tokio::test]
async fn test_unchanged_reindex_makes_no_provider_calls() {
    let engine = engine().await;
    let content = "fn main() {\n    println!(\"hello\");\n}\n";

    let first = engine
        .index("main.rs", content, FileMetadata::default())
        .await
        .unwrap();
    assert_eq!(first, ReconcileOutcome::Created { added: 1 });

    let calls = engine.provider_calls();
    let mutations = engine.stats().await.index.mutations_since_build;

    let second = engine
        .index("main.rs", content, FileMetadata::default())
        .await
        .unwrap();
    assert_eq!(second, ReconcileOutcome::Unchanged);
    assert_eq!(engine.provider_calls(), calls);
    assert_eq!(engine.stats().await.index.mutations_since_build, mutations);
}

#[tokio::test]
async fn test_metadata_refresh_reaches_filters() {
    let engine = engine().await;
    let content = "shared helper for retry loops";
    engine
        .index("retry.rs", content, FileMetadata::default().with_author("ada"))
        .await
        .unwrap();

    let by_grace = SearchFilters::new().with_author("grace");
    assert!(engine.search(content, &by_grace, 5).await.unwrap().is_empty());

    let outcome = engine
        .index("retry.rs", content, FileMetadata::default().with_author("Grace"))
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::MetadataUpdated);

    let results = engine.search(content, &by_grace, 5).await.unwrap();
    assert_eq!(paths(&results), vec!["retry.rs"]);
    assert_eq!(results[0].metadata.author.as_deref(), Some("Grace"));
}

#[tokio::test]
async fn test_zero_embedding_ttl_always_calls_provider() {
    let mut config = config();
    config.cache.embedding_ttl_secs = 0;
    let engine = engine_with(config).await;
    let content = "identical body in two files";

    engine
        .index("a.rs", content, FileMetadata::default())
        .await
        .unwrap();
    engine
        .index("b.rs", content, FileMetadata::default())
        .await
        .unwrap();
    assert_eq!(engine.provider_calls(), 2);

    let stats = engine.cache_stats();
    assert_eq!(stats.namespace(Namespace::Embedding).unwrap().entries, 0);
}

#[tokio::test]
async fn test_embedding_cache_shares_identical_text() {
    let engine = engine().await;
    let content = "identical body in two files";

    engine
        .index("a.rs", content, FileMetadata::default())
        .await
        .unwrap();
    engine
        .index("b.rs", content, FileMetadata::default())
        .await
        .unwrap();
    assert_eq!(engine.provider_calls(), 1);
}

#[tokio::test]
async fn test_complexity_filter_excludes_best_match() {
    let engine = engine().await;
    let query = "parse configuration values from toml";
    engine
        .index("hot.rs", query, FileMetadata::default().with_complexity(20.0))
        .await
        .unwrap();
    engine
        .index(
            "mid.rs",
            "parse values from environment variables",
            FileMetadata::default().with_complexity(10.0),
        )
        .await
        .unwrap();
    engine
        .index("bare.rs", "parse nothing at all", FileMetadata::default())
        .await
        .unwrap();

    let unfiltered = engine.search(query, &SearchFilters::new(), 3).await.unwrap();
    assert_eq!(unfiltered[0].path, "hot.rs");

    let filtered = engine
        .search(query, &SearchFilters::new().with_complexity(5.0, 15.0), 3)
        .await
        .unwrap();
    assert_eq!(paths(&filtered), vec!["mid.rs"]);
}

#[tokio::test]
async fn test_filters_are_part_of_the_cache_key() {
    let engine = engine().await;
    engine
        .index(
            "a.rs",
            "cache key derivation",
            FileMetadata::default().with_author("ada"),
        )
        .await
        .unwrap();
    engine
        .index(
            "b.rs",
            "cache key derivation helpers",
            FileMetadata::default().with_author("grace"),
        )
        .await
        .unwrap();

    let query = "cache key derivation";
    let ada = engine
        .search(query, &SearchFilters::new().with_author("ada"), 5)
        .await
        .unwrap();
    let grace = engine
        .search(query, &SearchFilters::new().with_author("grace"), 5)
        .await
        .unwrap();

    assert_eq!(paths(&ada), vec!["a.rs"]);
    assert_eq!(paths(&grace), vec!["b.rs"]);
}

#[tokio::test]
async fn test_query_cache_hit_and_invalidation() {
    let engine = engine().await;
    engine
        .index("old.rs", "walk the directory tree", FileMetadata::default())
        .await
        .unwrap();

    let query = "walk the directory tree recursively";
    let first = engine.search(query, &SearchFilters::new(), 5).await.unwrap();
    let second = engine.search(query, &SearchFilters::new(), 5).await.unwrap();
    assert_eq!(first, second);

    let query_stats = engine.cache_stats();
    let query_stats = query_stats.namespace(Namespace::Query).unwrap();
    assert_eq!(query_stats.hits, 1);
    assert_eq!(query_stats.entries, 1);

    engine
        .index("new.rs", query, FileMetadata::default())
        .await
        .unwrap();
    assert_eq!(
        engine
            .cache_stats()
            .namespace(Namespace::Query)
            .unwrap()
            .entries,
        0
    );

    let third = engine.search(query, &SearchFilters::new(), 5).await.unwrap();
    assert_eq!(paths(&third), vec!["new.rs", "old.rs"]);
}

#[tokio::test]
async fn test_query_cache_entries_expire() {
    init_tracing();
    let clock = Arc::new(ManualClock::default());
    let engine = RetrievalEngine::builder()
        .with_config(config())
        .with_clock(clock.clone())
        .build()
        .await
        .unwrap();
    engine
        .index("a.rs", "expire cached results", FileMetadata::default())
        .await
        .unwrap();

    let query = "expire cached results";
    engine.search(query, &SearchFilters::new(), 5).await.unwrap();
    engine.search(query, &SearchFilters::new(), 5).await.unwrap();
    let calls = engine.provider_calls();

    clock.advance(Duration::from_secs(25 * 60 * 60));
    engine.search(query, &SearchFilters::new(), 5).await.unwrap();

    let stats = engine.cache_stats();
    let query_stats = stats.namespace(Namespace::Query).unwrap();
    assert_eq!(query_stats.hits, 1);
    assert_eq!(query_stats.misses, 2);
    assert_eq!(query_stats.expired, 1);
    // The query embedding lives longer than the result.
    assert_eq!(engine.provider_calls(), calls);
}

#[tokio::test]
async fn test_deindex_removes_every_vector() {
    let engine = engine().await;
    let long: String = (0..100).map(|i| format!("let value_{i} = {i};\n")).collect();
    engine
        .index("long.rs", &long, FileMetadata::default())
        .await
        .unwrap();
    engine
        .index("short.rs", "let value = 1;", FileMetadata::default())
        .await
        .unwrap();

    let before = engine.stats().await;
    assert_eq!(before.files, 2);
    assert!(before.index.vectors > 2);

    let removed = engine.deindex("long.rs").await.unwrap();
    assert_eq!(
        removed,
        RemoveOutcome::Removed {
            vectors: before.index.vectors - 1
        }
    );
    assert_eq!(engine.deindex("long.rs").await.unwrap(), RemoveOutcome::NotIndexed);

    let results = engine
        .search("let value", &SearchFilters::new(), 20)
        .await
        .unwrap();
    assert_eq!(paths(&results), vec!["short.rs"]);
    assert!(engine.audit().await.is_empty());
}

#[tokio::test]
async fn test_index_all_removes_missing_paths() {
    let engine = engine().await;
    let inputs = |names: &[&str]| {
        names
            .iter()
            .map(|name| FileInput::new(*name, format!("contents of {name}"), FileMetadata::default()))
            .collect::<Vec<_>>()
    };

    let first = engine.index_all(inputs(&["a.rs", "b.rs", "c.rs"])).await;
    assert_eq!(first.total_files, 3);
    assert_eq!(first.new_files, 3);
    assert!(first.failed_files.is_empty());

    let second = engine.index_all(inputs(&["a.rs", "b.rs"])).await;
    assert_eq!(second.unchanged_files, 2);
    assert_eq!(second.removed_files, 1);
    assert_eq!(engine.stats().await.files, 2);
    assert!(engine.audit().await.is_empty());
}

#[tokio::test]
async fn test_exact_search_is_deterministic() {
    let engine = RetrievalEngine::builder()
        .with_config(config())
        .with_approximate_search(false)
        .build()
        .await
        .unwrap();
    for i in 0..30 {
        engine
            .index(
                &format!("file_{i:02}.rs"),
                &format!("handler number {i} for shared requests"),
                FileMetadata::default(),
            )
            .await
            .unwrap();
    }

    let query = "shared requests handler";
    let first = engine.search(query, &SearchFilters::new(), 10).await.unwrap();
    engine.cache_clear(Some(Namespace::Query));
    let second = engine.search(query, &SearchFilters::new(), 10).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.len(), 10);
    for pair in first.windows(2) {
        assert!(
            pair[0].score > pair[1].score
                || (pair[0].score == pair[1].score && pair[0].chunk_id < pair[1].chunk_id)
        );
    }
}

#[tokio::test]
async fn test_approximate_search_finds_exact_match() {
    let mut config = config();
    config.index.min_training_size = 16;
    let engine = engine_with(config).await;

    for i in 0..100 {
        engine
            .index(
                &format!("module_{i:03}.rs"),
                &format!("module {i} handles topic{i}"),
                FileMetadata::default(),
            )
            .await
            .unwrap();
    }
    let stats = engine.stats().await;
    assert_eq!(stats.index.vectors, 100);
    assert!(stats.index.clusters > 0);

    let results = engine
        .search("module 42 handles topic42", &SearchFilters::new(), 3)
        .await
        .unwrap();
    assert_eq!(results[0].path, "module_042.rs");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_search_never_sees_a_half_applied_reindex() {
    let mut config = config();
    config.cache.enabled = false;
    config.index.chunk_max_lines = 1;
    config.index.chunk_overlap = 0;
    let engine = Arc::new(engine_with(config).await);

    // Six chunks authored by "first", then three authored by "second".
    let lines = |word: &str, n: usize| {
        (0..n)
            .map(|i| format!("{word} request handler {i}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let (v1, v2) = (lines("alpha", 6), lines("beta", 3));
    let expected_v1: Vec<String> = (0..6).map(|i| format!("a.rs#{i}")).collect();
    let expected_v2: Vec<String> = (0..3).map(|i| format!("a.rs#{i}")).collect();

    let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let searchers: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let done = Arc::clone(&done);
            let (expected_v1, expected_v2) = (expected_v1.clone(), expected_v2.clone());
            tokio::spawn(async move {
                let mut observed = 0;
                loop {
                    let stop = done.load(Ordering::SeqCst);
                    let results = engine
                        .search("request handler", &SearchFilters::new(), 10)
                        .await
                        .unwrap();
                    let mut ids: Vec<String> =
                        results.iter().map(|r| r.chunk_id.clone()).collect();
                    ids.sort();
                    let authors: Vec<Option<&str>> =
                        results.iter().map(|r| r.metadata.author.as_deref()).collect();

                    if ids == expected_v1 {
                        assert!(authors.iter().all(|a| *a == Some("first")), "{authors:?}");
                    } else if ids == expected_v2 {
                        assert!(authors.iter().all(|a| *a == Some("second")), "{authors:?}");
                    } else {
                        assert!(ids.is_empty(), "mixed result set: {ids:?}");
                    }
                    observed += 1;
                    if stop {
                        break observed;
                    }
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    for _ in 0..25 {
        engine
            .index("a.rs", &v1, FileMetadata::default().with_author("first"))
            .await
            .unwrap();
        engine
            .index("a.rs", &v2, FileMetadata::default().with_author("second"))
            .await
            .unwrap();
    }
    done.store(true, Ordering::SeqCst);

    for searcher in searchers {
        assert!(searcher.await.unwrap() > 0);
    }
    let results = engine
        .search("request handler", &SearchFilters::new(), 10)
        .await
        .unwrap();
    assert_eq!(results.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_slow_search_times_out_without_caching() {
    init_tracing();
    let mut config = config();
    config.search.timeout_secs = 1;
    let engine = RetrievalEngine::builder()
        .with_config(config)
        .with_provider(Arc::new(StalledProvider))
        .build()
        .await
        .unwrap();

    let err = engine
        .search("anything", &SearchFilters::new(), 5)
        .await
        .unwrap_err();
    assert!(matches!(err, RetrievalError::Timeout(d) if d == Duration::from_secs(1)));
    assert!(err.is_retryable());

    let stats = engine.cache_stats();
    assert_eq!(stats.namespace(Namespace::Query).unwrap().entries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_provider_is_an_error_not_empty() {
    init_tracing();
    let mut config = config();
    config.embedding.max_attempts = 3;
    config.embedding.initial_backoff_ms = 10;
    config.embedding.max_backoff_ms = 50;
    let provider = Arc::new(DownProvider::default());
    let engine = RetrievalEngine::builder()
        .with_config(config)
        .with_provider(provider.clone())
        .build()
        .await
        .unwrap();

    let err = engine
        .search("anything", &SearchFilters::new(), 5)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RetrievalError::ProviderUnavailable { attempts: 3, .. }
    ));
    assert_eq!(provider.calls.load(Ordering::SeqCst), 3);

    let err = engine
        .index("a.rs", "fn a() {}", FileMetadata::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RetrievalError::ProviderUnavailable { .. }));
    assert_eq!(engine.stats().await.files, 0);
}

#[tokio::test]
async fn test_empty_query_and_empty_index() {
    let engine = engine().await;
    assert!(
        engine
            .search("   ", &SearchFilters::new(), 5)
            .await
            .unwrap()
            .is_empty()
    );
    assert!(
        engine
            .search_default("nothing indexed yet", &SearchFilters::new())
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let content = "persisted across restarts";

    {
        let engine = RetrievalEngine::builder()
            .with_config(config())
            .with_data_dir(dir.path())
            .build()
            .await
            .unwrap();
        engine
            .index("keep.rs", content, FileMetadata::default().with_complexity(3.0))
            .await
            .unwrap();
        engine.persist().await.unwrap();
    }

    let engine = RetrievalEngine::builder()
        .with_config(config())
        .with_data_dir(dir.path())
        .build()
        .await
        .unwrap();
    assert_eq!(engine.stats().await.files, 1);

    let outcome = engine
        .index("keep.rs", content, FileMetadata::default().with_complexity(3.0))
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Unchanged);

    let results = engine
        .search(content, &SearchFilters::new().with_complexity(0.0, 5.0), 5)
        .await
        .unwrap();
    assert_eq!(paths(&results), vec!["keep.rs"]);
    // The embedding cache came back from disk too.
    assert_eq!(engine.provider_calls(), 0);
}

#[tokio::test]
async fn test_cache_clear_and_stats() {
    let engine = engine().await;
    engine
        .index("a.rs", "clear the caches", FileMetadata::default())
        .await
        .unwrap();
    engine
        .search("clear the caches", &SearchFilters::new(), 5)
        .await
        .unwrap();

    let stats = engine.cache_stats();
    assert!(stats.enabled);
    assert_eq!(stats.namespace(Namespace::Query).unwrap().entries, 1);
    assert_eq!(stats.namespace(Namespace::Embedding).unwrap().entries, 1);

    assert_eq!(engine.cache_clear(Some(Namespace::Query)), 1);
    assert_eq!(engine.cache_clear(None), 1);
    assert_eq!(engine.cache_stats().namespace(Namespace::Embedding).unwrap().entries, 0);
}

#[tokio::test]
async fn test_hashing_provider_matches_engine_dimension() {
    let engine = RetrievalEngine::builder()
        .with_config(config())
        .with_provider(Arc::new(HashingProvider::new(DIM)))
        .build()
        .await
        .unwrap();
    assert_eq!(engine.stats().await.index.dimension, DIM);
}
