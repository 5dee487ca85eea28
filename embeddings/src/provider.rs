//! Embedding providers.
//!
//! Supports OpenAI-compatible APIs, a local Ollama server, and an offline
//! hashing embedder.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::Embedding;
use crate::error::{EmbeddingError, Result};
use crate::similarity::normalize;

/// Family of a provider, which decides its default batch size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFamily {
    /// Hosted, high-throughput APIs.
    OpenAI,
    /// Locally hosted models.
    Local,
}

impl ProviderFamily {
    /// Largest batch sent in one provider call by default.
    pub fn default_batch_size(self) -> usize {
        match self {
            ProviderFamily::OpenAI => 100,
            ProviderFamily::Local => 32,
        }
    }
}

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Get the name of this provider.
    fn name(&self) -> &str;

    /// Get the model embeddings are generated with.
    fn model(&self) -> &str;

    /// Get the embedding dimension.
    fn dimension(&self) -> usize;

    /// Get the provider family.
    fn family(&self) -> ProviderFamily;

    /// Embed texts, returning one vector per text in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>>;

    /// Check if the provider is available (API key set, etc.).
    fn is_available(&self) -> bool {
        true
    }
}

/// Build the pooled HTTP client shared by every call of a provider.
fn pooled_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(8)
        .connect_timeout(Duration::from_secs(10))
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Truncate `text` to at most `max_chars` bytes on a UTF-8 char boundary.
fn truncate_for_embedding(text: &str, max_chars: usize) -> &str {
    if text.len() <= max_chars {
        return text;
    }
    let mut end = max_chars;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Map a non-success response to an error.
async fn error_for_response(response: reqwest::Response) -> EmbeddingError {
    let status = response.status();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);
        return EmbeddingError::RateLimited {
            retry_after_secs: retry_after,
        };
    }

    let message = response.text().await.unwrap_or_default();
    EmbeddingError::ApiRequest {
        status: status.as_u16(),
        message,
    }
}

/// OpenAI embedding provider.
pub struct OpenAIProvider {
    /// API key.
    api_key: Option<String>,

    /// API base URL.
    base_url: String,

    /// HTTP client, reused across calls.
    client: reqwest::Client,

    /// Model name.
    model: String,

    /// Requested output dimensions, if the model supports shortening.
    dimensions: Option<usize>,
}

impl OpenAIProvider {
    /// Longest input sent per text.
    const MAX_INPUT_CHARS: usize = 24_000;

    /// Create a new OpenAI provider.
    pub fn new() -> Self {
        Self {
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            base_url: "https://api.openai.com/v1".to_string(),
            client: pooled_client(Duration::from_secs(30)),
            model: "text-embedding-3-small".to_string(),
            dimensions: None,
        }
    }

    /// Set the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Request shortened output vectors.
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = pooled_client(timeout);
        self
    }
}

impl Default for OpenAIProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        if let Some(dims) = self.dimensions {
            return dims;
        }
        match self.model.as_str() {
            "text-embedding-3-large" => 3072,
            _ => 1536,
        }
    }

    fn family(&self) -> ProviderFamily {
        ProviderFamily::OpenAI
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let api_key = self
            .api_key
            .as_ref()
            .ok_or(EmbeddingError::ProviderNotConfigured)?;

        let inputs: Vec<&str> = texts
            .iter()
            .map(|t| truncate_for_embedding(t, Self::MAX_INPUT_CHARS))
            .collect();

        debug!(
            "Generating batch embeddings for {} texts with model: {}",
            inputs.len(),
            self.model
        );

        let mut body = serde_json::json!({
            "input": inputs,
            "model": self.model
        });
        if let Some(dims) = self.dimensions {
            body["dimensions"] = serde_json::json!(dims);
        }

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_for_response(response).await);
        }

        let mut result: OpenAIEmbeddingResponse = response.json().await?;
        if result.data.len() != texts.len() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                result.data.len()
            )));
        }

        // The API reports each vector's input position explicitly.
        result.data.sort_by_key(|item| item.index);
        let embeddings: Vec<Embedding> = result.data.into_iter().map(|d| d.embedding).collect();

        info!("Generated {} batch embeddings", embeddings.len());
        Ok(embeddings)
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }
}

/// OpenAI API response format.
#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingResponse {
    data: Vec<OpenAIEmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// Ollama embedding provider for locally hosted models.
pub struct OllamaProvider {
    /// Server base URL.
    base_url: String,

    /// HTTP client, reused across calls.
    client: reqwest::Client,

    /// Model name.
    model: String,

    /// Output dimension of the model.
    dimension: usize,
}

impl OllamaProvider {
    /// nomic-embed-text has an 8k-token context; dense code can run over 2
    /// tokens per char.
    const MAX_INPUT_CHARS: usize = 3_000;

    /// Create a provider for a local Ollama server.
    pub fn new() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            client: pooled_client(Duration::from_secs(120)),
            model: "nomic-embed-text".to_string(),
            dimension: 768,
        }
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set the model and its output dimension.
    pub fn with_model(mut self, model: impl Into<String>, dimension: usize) -> Self {
        self.model = model.into();
        self.dimension = dimension;
        self
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = pooled_client(timeout);
        self
    }
}

impl Default for OllamaProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
    truncate: bool,
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn family(&self) -> ProviderFamily {
        ProviderFamily::Local
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = OllamaEmbedRequest {
            model: &self.model,
            input: texts
                .iter()
                .map(|t| truncate_for_embedding(t, Self::MAX_INPUT_CHARS))
                .collect(),
            truncate: true,
        };

        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_for_response(response).await);
        }

        let body: OllamaEmbedResponse = response.json().await?;
        if body.embeddings.len() != texts.len() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                body.embeddings.len()
            )));
        }

        debug!("Generated {} embeddings with {}", texts.len(), self.model);
        Ok(body.embeddings)
    }
}

/// Offline embedder using the hashing trick over lowercase word tokens.
///
/// Texts sharing vocabulary land close together, which is enough for
/// keyword-flavored retrieval without a model server.
#[derive(Debug, Clone)]
pub struct HashingProvider {
    dimension: usize,
}

impl HashingProvider {
    /// Create a hashing embedder with the given output dimension.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    /// Embed one text synchronously.
    pub fn embed_text(&self, text: &str) -> Embedding {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|t| !t.is_empty())
        {
            let hash = fnv1a(token.to_lowercase().as_bytes());
            let bucket = (hash % self.dimension as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        normalize(&mut vector);
        vector
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, &b| (hash ^ u64::from(b)).wrapping_mul(PRIME))
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    fn name(&self) -> &str {
        "hashing"
    }

    fn model(&self) -> &str {
        "fnv1a-bag-of-words"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn family(&self) -> ProviderFamily {
        ProviderFamily::Local
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}
