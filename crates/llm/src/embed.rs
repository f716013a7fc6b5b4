//! Embedding client backed by Ollama's `/api/embed` endpoint.

use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, warn};

use engram_config::EmbeddingConfig;

use crate::types::{EmbedError, Embedder};

/// Retry budget for transient embedding failures.
const MAX_RETRIES: usize = 2;

#[derive(Debug, Clone)]
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimension: usize,
}

impl OllamaEmbedder {
    pub fn new(base_url: &str, config: &EmbeddingConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dimension: config.dimension,
        }
    }

    async fn embed_once(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let payload = json!({ "model": self.model, "input": text });
        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .timeout(Duration::from_secs(30))
            .json(&payload)
            .send()
            .await
            .map_err(|e| EmbedError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // 5xx from the backend is worth a retry; 4xx is not.
            if status.is_server_error() {
                return Err(EmbedError::Transient(format!("{status}: {body}")));
            }
            return Err(EmbedError::Provider { status: status.as_u16(), body });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| EmbedError::Protocol(e.to_string()))?;
        let vector: Vec<f32> = body
            .pointer("/embeddings/0")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|x| x.as_f64()).map(|x| x as f32).collect())
            .ok_or_else(|| EmbedError::Protocol("response missing embeddings[0]".to_string()))?;

        if vector.len() != self.dimension {
            return Err(EmbedError::Protocol(format!(
                "expected {} dimensions, got {}",
                self.dimension,
                vector.len()
            )));
        }
        Ok(vector)
    }
}

#[async_trait::async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let mut attempt = 0;
        loop {
            match self.embed_once(text).await {
                Ok(vector) => {
                    debug!(len = text.len(), attempt, "embedded text");
                    return Ok(vector);
                }
                Err(EmbedError::Transient(reason)) if attempt < MAX_RETRIES => {
                    attempt += 1;
                    warn!(attempt, %reason, "embedding failed, retrying");
                    tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedder_reports_configured_dimension() {
        let embedder = OllamaEmbedder::new(
            "http://localhost:11434/",
            &EmbeddingConfig { model: "embeddinggemma".into(), dimension: 768 },
        );
        assert_eq!(embedder.dimension(), 768);
        assert_eq!(embedder.base_url, "http://localhost:11434");
    }

    #[tokio::test]
    async fn unreachable_backend_exhausts_retry_budget() {
        // Port 9 (discard) refuses connections immediately, so all attempts
        // fail with a transport error and the retry budget is consumed.
        let embedder = OllamaEmbedder::new(
            "http://127.0.0.1:9",
            &EmbeddingConfig { model: "embeddinggemma".into(), dimension: 8 },
        );
        let err = embedder.embed("hello").await.unwrap_err();
        assert!(matches!(err, EmbedError::Transient(_)));
    }
}
