use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use finmem_models::EmbeddingConfig;
use moka::future::Cache;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::AgentError;
use crate::openai::{api_key_from_env, status_error, transport_error};

/// Turns text into fixed-length vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AgentError>;
}

/// Offline bag-of-words embedder using signed feature hashing.
///
/// Deterministic across runs and platforms, which makes it suitable for
/// tests and for replaying a simulation without network access.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        if self.dimensions == 0 {
            return vector;
        }
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let hash = fnv1a(&token.to_lowercase());
            let slot = (hash % self.dimensions as u64) as usize;
            let sign = if (hash >> 63) == 0 { 1.0 } else { -1.0 };
            vector[slot] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

fn fnv1a(token: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in token.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AgentError> {
        Ok(self.embed_sync(text))
    }
}

/// Embedder for any OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiEmbedder {
    client: Client,
    api_base: String,
    api_key: String,
    model: String,
    dimensions: usize,
    timeout: Duration,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig, api_key: String) -> Result<Self, AgentError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AgentError::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            dimensions: config.dimensions,
            timeout: Duration::from_secs(config.timeout_seconds),
        })
    }

    pub fn from_env(config: &EmbeddingConfig) -> Result<Self, AgentError> {
        let api_key = api_key_from_env(&config.api_key_env)?;
        Self::new(config, api_key)
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AgentError> {
        let url = format!("{}/embeddings", self.api_base);
        debug!(model = %self.model, chars = text.len(), "Requesting embedding");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&json!({
                "model": self.model,
                "input": text,
                "dimensions": self.dimensions,
            }))
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body, AgentError::Embedding));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;
        parse_embedding(&body, self.dimensions)
    }
}

/// Read `data[0].embedding` and check its length. A wrong length means the
/// model and the configured dimensionality disagree, which is not retryable.
pub fn parse_embedding(body: &Value, dimensions: usize) -> Result<Vec<f32>, AgentError> {
    let values = body["data"][0]["embedding"]
        .as_array()
        .ok_or_else(|| AgentError::Embedding("response has no embedding".to_string()))?;
    let vector: Vec<f32> = values
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect::<Option<_>>()
        .ok_or_else(|| AgentError::Embedding("embedding has non-numeric values".to_string()))?;
    if vector.len() != dimensions {
        return Err(AgentError::Config(format!(
            "embedding service returned {} dimensions, expected {dimensions}",
            vector.len()
        )));
    }
    Ok(vector)
}

/// Caches embeddings by exact text in front of another embedder.
pub struct CachedEmbedder {
    inner: Arc<dyn Embedder>,
    cache: Cache<String, Arc<Vec<f32>>>,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, max_capacity: u64) -> Self {
        Self {
            inner,
            cache: Cache::builder().max_capacity(max_capacity).build(),
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}

#[async_trait]
impl Embedder for CachedEmbedder {
    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AgentError> {
        if let Some(hit) = self.cache.get(text).await {
            return Ok(hit.as_ref().clone());
        }
        let vector = self.inner.embed(text).await?;
        self.cache
            .insert(text.to_string(), Arc::new(vector.clone()))
            .await;
        Ok(vector)
    }
}
