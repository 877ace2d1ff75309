// SPDX-License-Identifier: MIT OR Apache-2.0
//! Embedding backends for the dense half of the index.

use async_trait::async_trait;
use knj_config::ModelEndpoint;
use serde::Deserialize;
use std::time::Duration;

/// Errors from an embedder.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// Transport or endpoint failure. The index falls back to keyword-only
    /// search for queries and keeps chunks unembedded until reindex.
    #[error("embedding endpoint failed: {0}")]
    Endpoint(String),
    /// The endpoint returned an unusable body.
    #[error("embedding response invalid: {0}")]
    Invalid(String),
}

/// Produces dense vectors for chunks and queries.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed one text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;
}

/// OpenAI-style `/v1/embeddings` client for the local embedding host.
pub struct HttpEmbedder {
    endpoint: ModelEndpoint,
    client: reqwest::Client,
    timeout: Duration,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    /// Build a client for the configured endpoint.
    #[must_use]
    pub fn new(endpoint: ModelEndpoint, timeout: Duration) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let url = format!("{}/v1/embeddings", self.endpoint.url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&serde_json::json!({
                "model": self.endpoint.model_id,
                "input": text,
            }))
            .send()
            .await
            .map_err(|e| EmbedError::Endpoint(e.to_string()))?;
        if !response.status().is_success() {
            return Err(EmbedError::Endpoint(format!("status {}", response.status())));
        }
        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbedError::Invalid(e.to_string()))?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|r| r.embedding)
            .ok_or_else(|| EmbedError::Invalid("empty data".into()))
    }
}

/// Deterministic token-hash embedder for tests and offline indexing.
///
/// Not semantically meaningful, but stable: equal texts embed equally and
/// token overlap produces cosine similarity, which is what the tests and
/// the keyword-blend scoring need.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    /// An embedder with the given dimensionality.
    #[must_use]
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let mut v = vec![0f32; self.dims];
        for token in crate::tokenize(text) {
            let mut h: u64 = 1469598103934665603;
            for b in token.as_bytes() {
                h ^= u64::from(*b);
                h = h.wrapping_mul(1099511628211);
            }
            v[(h as usize) % self.dims] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        Ok(v)
    }
}

/// Cosine similarity of two equal-length vectors.
#[must_use]
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embedder_is_deterministic() {
        let e = HashEmbedder::default();
        let a = e.embed("porez na dodanu vrijednost").await.unwrap();
        let b = e.embed("porez na dodanu vrijednost").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn overlapping_texts_are_closer() {
        let e = HashEmbedder::default();
        let base = e.embed("obrnuta porezna obveza stjecanje dobara").await.unwrap();
        let close = e.embed("obrnuta porezna obveza usluge").await.unwrap();
        let far = e.embed("putni nalog dnevnica kilometraza").await.unwrap();
        assert!(cosine(&base, &close) > cosine(&base, &far));
    }
}
