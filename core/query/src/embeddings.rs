//! Embedding client.
//!
//! Turns text into fixed-dimension vectors through an OpenAI-compatible
//! endpoint. The trait seam lets tests substitute deterministic vectors.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::QueryError;
use crate::llm::retry_backoff;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding for a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, QueryError>;

    /// Dimensionality of the produced vectors.
    fn dimensions(&self) -> usize;
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// OpenAI embedding provider. Works against any compatible endpoint.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    dims: usize,
}

impl OpenAiEmbedder {
    pub fn new(
        api_key: String,
        model: String,
        endpoint: String,
        timeout: Duration,
    ) -> Self {
        // 1536 is the dimension of text-embedding-3-small; other models
        // of the family share it unless configured otherwise.
        let dims = match model.as_str() {
            "text-embedding-3-large" => 3072,
            "text-embedding-ada-002" | "text-embedding-3-small" => 1536,
            _ => 1536,
        };
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            endpoint,
            api_key,
            model,
            dims,
        }
    }

    async fn call_once(&self, text: &str) -> Result<Vec<f32>, QueryError> {
        let request = EmbeddingRequest {
            model: self.model.clone(),
            input: vec![text.to_string()],
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.endpoint))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(QueryError::Upstream(format!(
                "embedding request failed with {status}: {body}"
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| QueryError::Upstream(e.to_string()))?;

        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| QueryError::Upstream("empty embedding response".to_string()))
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, QueryError> {
        // Embedding is idempotent, so one retry is safe.
        match self.call_once(text).await {
            Ok(vector) => Ok(vector),
            Err(e) => {
                warn!("embedding failed, retrying once: {e}");
                tokio::time::sleep(retry_backoff()).await;
                self.call_once(text).await
            }
        }
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// Cosine similarity between two vectors; 0.0 when either has zero norm
/// or the dimensions disagree.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        let c = vec![0.0, 1.0, 0.0];
        let d = vec![-1.0, 0.0, 0.0];

        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&a, &c).abs() < 1e-9);
        assert!((cosine_similarity(&a, &d) + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_similarity_degenerate() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_embedder_dimensions() {
        let embedder = OpenAiEmbedder::new(
            "key".into(),
            "text-embedding-3-small".into(),
            "https://api.openai.com/v1".into(),
            Duration::from_secs(10),
        );
        assert_eq!(embedder.dimensions(), 1536);

        let large = OpenAiEmbedder::new(
            "key".into(),
            "text-embedding-3-large".into(),
            "https://api.openai.com/v1".into(),
            Duration::from_secs(10),
        );
        assert_eq!(large.dimensions(), 3072);
    }
}
