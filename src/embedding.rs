//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and two concrete backends:
//! - **[`HttpEmbedder`]** — calls an OpenAI-compatible `/embeddings` endpoint
//!   with batching, retry, and backoff.
//! - **[`HashEmbedder`]** — deterministic token-hash vectors; no network.
//!   Used for offline development and the test suite.
//!
//! An embedding failure is fatal to the ingest or search request that
//! triggered it.
//!
//! # Retry Strategy
//!
//! The HTTP backend uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{EngineError, Result};

/// Maps text to fixed-dimension vectors. Deterministic for a given model
/// revision; output order matches input order.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier, e.g. `"text-embedding-nomic-embed-text-v1.5"`.
    fn model_name(&self) -> &str;
    /// Vector dimensionality.
    fn dims(&self) -> usize;
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single text; convenience wrapper for query embedding.
pub async fn embed_one(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    let mut results = provider.embed(&[text.to_string()]).await?;
    results
        .pop()
        .ok_or_else(|| EngineError::Upstream("empty embedding response".to_string()))
}

/// Create the configured provider. The HTTP backend falls back to the LM
/// endpoint's base URL when `embedding.base_url` is not set (the common
/// single-server deployment).
pub fn create_provider(
    config: &EmbeddingConfig,
    llm_base_url: &str,
) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashEmbedder::new(config.dims))),
        "openai-compatible" => {
            let base_url = config
                .base_url
                .clone()
                .unwrap_or_else(|| llm_base_url.to_string());
            let model = config.model.clone().ok_or_else(|| {
                EngineError::InvalidInput("embedding.model required for HTTP provider".to_string())
            })?;
            Ok(Arc::new(HttpEmbedder::new(
                base_url,
                model,
                config.dims,
                config.batch_size,
                config.max_retries,
                config.timeout_secs,
            )?))
        }
        other => Err(EngineError::InvalidInput(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

// ============ HTTP provider ============

/// Embedding provider backed by an OpenAI-compatible `/embeddings` endpoint.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
}

impl HttpEmbedder {
    pub fn new(
        base_url: String,
        model: String,
        dims: usize,
        batch_size: usize,
        max_retries: u32,
        timeout_secs: u64,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| EngineError::Upstream(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            dims,
            batch_size: batch_size.max(1),
            max_retries,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}/embeddings", self.base_url))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| EngineError::Upstream(e.to_string()))?;
                        return self.parse_response(&json, texts.len());
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(EngineError::UpstreamTransient(format!(
                            "embeddings API error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    return Err(EngineError::Upstream(format!(
                        "embeddings API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(EngineError::UpstreamTransient(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| EngineError::Upstream("embedding failed after retries".to_string())))
    }

    fn parse_response(&self, json: &serde_json::Value, expected: usize) -> Result<Vec<Vec<f32>>> {
        let data = json
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| EngineError::Upstream("embeddings response missing data".to_string()))?;

        if data.len() != expected {
            return Err(EngineError::Upstream(format!(
                "embeddings response count mismatch: expected {}, got {}",
                expected,
                data.len()
            )));
        }

        let mut vectors = Vec::with_capacity(data.len());
        for item in data {
            let embedding = item
                .get("embedding")
                .and_then(|e| e.as_array())
                .ok_or_else(|| {
                    EngineError::Upstream("embeddings response missing embedding".to_string())
                })?;

            let vec: Vec<f32> = embedding
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();

            if vec.len() != self.dims {
                return Err(EngineError::Upstream(format!(
                    "embedding dimension mismatch: expected {}, got {}",
                    self.dims,
                    vec.len()
                )));
            }

            vectors.push(vec);
        }

        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            vectors.extend(self.embed_batch(batch).await?);
        }
        Ok(vectors)
    }
}

// ============ Hash provider ============

/// Deterministic bag-of-tokens embedder. Each token is FNV-hashed into a
/// signed slot and the result is L2-normalized, so texts sharing vocabulary
/// land near each other. Not a semantic model; it exists so the pipeline
/// can run (and be tested) without an embedding server.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dims];

        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let h = fnv1a(token.as_bytes());
            let slot = (h % self.dims as u64) as usize;
            let sign = if (h >> 63) & 1 == 1 { -1.0 } else { 1.0 };
            v[slot] += sign;
        }

        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut v {
                *x /= norm;
            }
        }

        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
