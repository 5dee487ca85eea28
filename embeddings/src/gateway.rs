//! Cache-first batching in front of an embedding provider.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use codelens_cache::{CacheStore, Namespace, cache_key};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::Embedding;
use crate::error::{EmbeddingError, Result};
use crate::provider::{EmbeddingProvider, ProviderFamily};

/// Batching and retry settings for an [`EmbeddingGateway`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Maximum texts per provider call.
    pub batch_size: usize,

    /// Provider calls per sub-batch before giving up.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub initial_backoff: Duration,

    /// Upper bound on any single retry delay.
    pub max_backoff: Duration,

    /// Required length of every vector.
    pub dimension: usize,
}

impl GatewayConfig {
    /// Defaults for a provider family.
    pub fn for_family(family: ProviderFamily, dimension: usize) -> Self {
        Self {
            batch_size: family.default_batch_size(),
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            dimension,
        }
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set retry attempts and backoff bounds.
    pub fn with_retry(mut self, max_attempts: u32, initial: Duration, max: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }
}

/// Embeds texts through the cache, calling the provider only for misses.
pub struct EmbeddingGateway {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<CacheStore>,
    config: GatewayConfig,
    provider_calls: AtomicU64,
}

impl EmbeddingGateway {
    /// Create a gateway with the provider family's defaults.
    pub fn new(provider: Arc<dyn EmbeddingProvider>, cache: Arc<CacheStore>) -> Self {
        let config = GatewayConfig::for_family(provider.family(), provider.dimension());
        Self {
            provider,
            cache,
            config,
            provider_calls: AtomicU64::new(0),
        }
    }

    /// Replace the batching and retry settings.
    pub fn with_config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// The wrapped provider.
    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    /// Current settings.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Number of provider calls made so far, retries included.
    pub fn provider_calls(&self) -> u64 {
        self.provider_calls.load(Ordering::Relaxed)
    }

    /// Embed a single text.
    pub async fn embed_one(&self, text: &str) -> Result<Embedding> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| EmbeddingError::InvalidResponse("no embedding returned".to_string()))
    }

    /// Embed `texts`, returning vectors in input order.
    ///
    /// Fails as a whole if any uncached sub-batch cannot be embedded; no
    /// partial result is returned.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let mut slots: Vec<Option<Embedding>> = vec![None; texts.len()];

        // Distinct uncached texts in first-seen order, with every position they fill.
        let mut pending: Vec<(&str, String, Vec<usize>)> = Vec::new();
        let mut seen: HashMap<&str, usize> = HashMap::new();

        for (position, text) in texts.iter().enumerate() {
            if let Some(&idx) = seen.get(text.as_str()) {
                pending[idx].2.push(position);
                continue;
            }

            let key = self.key_for(text);
            match self.cache.get_json::<Embedding>(Namespace::Embedding, &key) {
                Some(vector) if vector.len() == self.config.dimension => {
                    slots[position] = Some(vector);
                }
                _ => {
                    seen.insert(text.as_str(), pending.len());
                    pending.push((text.as_str(), key, vec![position]));
                }
            }
        }

        debug!(
            "Embedding batch: {} texts, {} uncached",
            texts.len(),
            pending.len()
        );

        for group in pending.chunks(self.config.batch_size.max(1)) {
            let inputs: Vec<String> = group.iter().map(|(text, _, _)| text.to_string()).collect();
            let vectors = self.embed_with_retry(&inputs).await?;

            if vectors.len() != inputs.len() {
                return Err(EmbeddingError::InvalidResponse(format!(
                    "expected {} embeddings, got {}",
                    inputs.len(),
                    vectors.len()
                )));
            }
            if let Some(bad) = vectors.iter().find(|v| v.len() != self.config.dimension) {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: self.config.dimension,
                    actual: bad.len(),
                });
            }
            // NaN would rank first and cannot round-trip through the JSON cache.
            if vectors.iter().flatten().any(|x| !x.is_finite()) {
                return Err(EmbeddingError::InvalidResponse(
                    "embedding contains non-finite values".to_string(),
                ));
            }

            for ((_, key, positions), vector) in group.iter().zip(vectors) {
                self.cache.set_json(Namespace::Embedding, key, &vector)?;
                for &position in positions {
                    slots[position] = Some(vector.clone());
                }
            }
        }

        slots
            .into_iter()
            .map(|slot| {
                slot.ok_or_else(|| {
                    EmbeddingError::InvalidResponse("missing embedding for input".to_string())
                })
            })
            .collect()
    }

    fn key_for(&self, text: &str) -> String {
        cache_key([self.provider.name(), self.provider.model(), text])
    }

    async fn embed_with_retry(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.provider_calls.fetch_add(1, Ordering::Relaxed);

            let err = match self.provider.embed(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(err) => err,
            };

            if !err.is_transient() {
                return Err(err);
            }

            if attempt >= self.config.max_attempts {
                error!(
                    "Embedding provider {} failed after {} attempts: {}",
                    self.provider.name(),
                    attempt,
                    err
                );
                return Err(EmbeddingError::ProviderUnavailable {
                    provider: self.provider.name().to_string(),
                    attempts: attempt,
                    last_error: err.to_string(),
                });
            }

            let delay = self.backoff_delay(attempt, &err);
            warn!(
                "Embedding attempt {}/{} failed: {}; retrying in {:?}",
                attempt, self.config.max_attempts, err, delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Delay before retry number `attempt` (1-based).
    fn backoff_delay(&self, attempt: u32, err: &EmbeddingError) -> Duration {
        if let EmbeddingError::RateLimited { retry_after_secs } = err {
            return Duration::from_secs(*retry_after_secs).min(self.config.max_backoff);
        }

        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .config
            .initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.config.max_backoff);
        let jitter: f64 = rand::rng().random_range(0.5..=1.0);
        base.mul_f64(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use codelens_cache::CacheOptions;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Provider that returns `[len, first byte]` vectors and can be told to fail.
    struct ScriptedProvider {
        calls: Mutex<Vec<Vec<String>>>,
        failures: Mutex<VecDeque<EmbeddingError>>,
        dimension: usize,
        non_finite: bool,
    }

    impl ScriptedProvider {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                failures: Mutex::new(VecDeque::new()),
                dimension: 2,
                non_finite: false,
            }
        }

        fn failing_with(errors: Vec<EmbeddingError>) -> Self {
            let provider = Self::new();
            *provider.failures.lock().unwrap() = errors.into();
            provider
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EmbeddingProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn model(&self) -> &str {
            "v1"
        }

        fn dimension(&self) -> usize {
            2
        }

        fn family(&self) -> ProviderFamily {
            ProviderFamily::Local
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>> {
            self.calls.lock().unwrap().push(texts.to_vec());
            if let Some(err) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![t.len() as f32, f32::from(t.as_bytes()[0])];
                    if self.non_finite {
                        v[1] = f32::NAN;
                    }
                    v.truncate(self.dimension);
                    v
                })
                .collect())
        }
    }

    fn unavailable() -> EmbeddingError {
        EmbeddingError::ApiRequest {
            status: 503,
            message: "overloaded".to_string(),
        }
    }

    fn gateway(provider: Arc<ScriptedProvider>, cache: CacheOptions) -> EmbeddingGateway {
        EmbeddingGateway::new(provider, Arc::new(CacheStore::new(cache)))
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_preserves_order_and_dedups() {
        let provider = Arc::new(ScriptedProvider::new());
        let gateway = gateway(provider.clone(), CacheOptions::default());

        let out = gateway
            .embed_batch(&texts(&["bb", "a", "bb", "ccc"]))
            .await
            .unwrap();

        assert_eq!(
            out,
            vec![
                vec![2.0, 98.0],
                vec![1.0, 97.0],
                vec![2.0, 98.0],
                vec![3.0, 99.0]
            ]
        );
        assert_eq!(provider.calls(), vec![texts(&["bb", "a", "ccc"])]);
    }

    #[tokio::test]
    async fn test_second_request_is_cache_hit() {
        let provider = Arc::new(ScriptedProvider::new());
        let gateway = gateway(provider.clone(), CacheOptions::default());

        gateway.embed_batch(&texts(&["x", "y"])).await.unwrap();
        gateway.embed_batch(&texts(&["y", "z"])).await.unwrap();

        assert_eq!(provider.calls(), vec![texts(&["x", "y"]), texts(&["z"])]);
        assert_eq!(gateway.provider_calls(), 2);
    }

    #[tokio::test]
    async fn test_batches_never_exceed_batch_size() {
        let provider = Arc::new(ScriptedProvider::new());
        let gateway = gateway(provider.clone(), CacheOptions::default()).with_config(
            GatewayConfig::for_family(ProviderFamily::Local, 2).with_batch_size(2),
        );

        let input: Vec<String> = (0..5).map(|i| format!("text-{i}")).collect();
        gateway.embed_batch(&input).await.unwrap();

        let sizes: Vec<usize> = provider.calls().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_zero_ttl_always_calls_provider() {
        let provider = Arc::new(ScriptedProvider::new());
        let options = CacheOptions {
            embedding_ttl: Duration::ZERO,
            ..CacheOptions::default()
        };
        let gateway = gateway(provider.clone(), options);

        gateway.embed_one("same").await.unwrap();
        gateway.embed_one("same").await.unwrap();

        assert_eq!(provider.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let provider = Arc::new(ScriptedProvider::failing_with(vec![
            unavailable(),
            unavailable(),
        ]));
        let gateway = gateway(provider.clone(), CacheOptions::default());

        let out = gateway.embed_one("ok").await.unwrap();

        assert_eq!(out, vec![2.0, 111.0]);
        assert_eq!(gateway.provider_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_provider_unavailable() {
        let provider = Arc::new(ScriptedProvider::failing_with(vec![
            unavailable(),
            unavailable(),
            unavailable(),
        ]));
        let gateway = gateway(provider.clone(), CacheOptions::default());

        let err = gateway.embed_batch(&texts(&["a", "b"])).await.unwrap_err();

        assert!(matches!(
            err,
            EmbeddingError::ProviderUnavailable { attempts: 3, .. }
        ));
        // Nothing was cached from the failed call.
        assert_eq!(gateway.cache.stats().namespace(Namespace::Embedding).unwrap().entries, 0);
    }

    #[tokio::test]
    async fn test_non_transient_error_fails_immediately() {
        let provider = Arc::new(ScriptedProvider::failing_with(vec![
            EmbeddingError::ProviderNotConfigured,
        ]));
        let gateway = gateway(provider.clone(), CacheOptions::default());

        let err = gateway.embed_one("a").await.unwrap_err();

        assert!(matches!(err, EmbeddingError::ProviderNotConfigured));
        assert_eq!(gateway.provider_calls(), 1);
    }

    #[tokio::test]
    async fn test_wrong_dimension_is_rejected_and_not_cached() {
        let provider = Arc::new(ScriptedProvider {
            dimension: 1,
            ..ScriptedProvider::new()
        });
        let gateway = gateway(provider.clone(), CacheOptions::default());

        let err = gateway.embed_one("abc").await.unwrap_err();

        assert!(matches!(
            err,
            EmbeddingError::DimensionMismatch {
                expected: 2,
                actual: 1
            }
        ));
        assert_eq!(gateway.cache.stats().namespace(Namespace::Embedding).unwrap().entries, 0);
    }

    #[tokio::test]
    async fn test_non_finite_vector_is_rejected_and_not_cached() {
        let provider = Arc::new(ScriptedProvider {
            non_finite: true,
            ..ScriptedProvider::new()
        });
        let gateway = gateway(provider.clone(), CacheOptions::default());

        let err = gateway.embed_one("abc").await.unwrap_err();

        assert!(matches!(err, EmbeddingError::InvalidResponse(_)));
        assert!(!err.is_transient());
        assert_eq!(provider.calls().len(), 1);
        assert_eq!(gateway.cache.stats().namespace(Namespace::Embedding).unwrap().entries, 0);
    }

    #[test]
    fn test_backoff_is_bounded() {
        let gateway = gateway(Arc::new(ScriptedProvider::new()), CacheOptions::default());

        for attempt in 1..10 {
            let delay = gateway.backoff_delay(attempt, &unavailable());
            assert!(delay <= gateway.config.max_backoff);
        }

        let limited = EmbeddingError::RateLimited {
            retry_after_secs: 600,
        };
        assert_eq!(gateway.backoff_delay(1, &limited), Duration::from_secs(30));
    }
}
