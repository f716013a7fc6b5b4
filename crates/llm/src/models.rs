//! Model discovery with a TTL cache.
//!
//! Local models come from Ollama's `/api/tags`, with per-model capabilities
//! from `/api/show`.  External API models are a static table and always
//! advertise tool and vision support.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// How long a fetched model list stays fresh.
const MODELS_CACHE_TTL: Duration = Duration::from_secs(300);

/// External API models: (name, context_length, parameters, family).
const EXTERNAL_MODELS: &[(&str, u64, &str, &str)] = &[
    ("grok-4-1-fast-non-reasoning", 128_000, "400B", "grok"),
    ("grok-4-1-fast-reasoning", 128_000, "400B", "grok"),
    ("gemini-2.5-pro", 2_000_000, "Unknown", "gemini"),
    ("deepseek-chat", 128_000, "685B", "deepseek"),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub context_length: u64,
    pub supports_tools: bool,
    pub supports_thinking: bool,
    pub supports_vision: bool,
    pub parameters: String,
    pub family: String,
}

struct CacheSlot {
    fetched_at: Instant,
    models: Vec<ModelInfo>,
}

impl CacheSlot {
    fn is_fresh(&self, now: Instant) -> bool {
        now.duration_since(self.fetched_at) <= MODELS_CACHE_TTL
    }
}

/// Model catalogue with a process-wide TTL cache.
pub struct ModelCatalog {
    client: reqwest::Client,
    ollama_base_url: String,
    cache: Mutex<Option<CacheSlot>>,
}

impl ModelCatalog {
    pub fn new(ollama_base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            ollama_base_url: ollama_base_url.trim_end_matches('/').to_string(),
            cache: Mutex::new(None),
        }
    }

    /// List all known models, refreshing from Ollama when the cache is stale.
    pub async fn list(&self) -> Vec<ModelInfo> {
        let mut slot = self.cache.lock().await;
        if let Some(cached) = slot.as_ref() {
            if cached.is_fresh(Instant::now()) {
                debug!("returning cached model list");
                return cached.models.clone();
            }
        }

        info!("fetching models from Ollama (cache miss)");
        let models = self.fetch().await;
        *slot = Some(CacheSlot { fetched_at: Instant::now(), models: models.clone() });
        models
    }

    async fn fetch(&self) -> Vec<ModelInfo> {
        let mut models = Vec::new();

        match self
            .client
            .get(format!("{}/api/tags", self.ollama_base_url))
            .timeout(Duration::from_secs(6))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                let body: Value = response.json().await.unwrap_or(Value::Null);
                let names: Vec<(String, String, String)> = body
                    .get("models")
                    .and_then(|m| m.as_array())
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|item| {
                                let name = item.get("name").or_else(|| item.get("model"))?.as_str()?;
                                let family = item
                                    .pointer("/details/family")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or("")
                                    .to_string();
                                let params = item
                                    .pointer("/details/parameter_size")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or("")
                                    .to_string();
                                Some((name.to_string(), family, params))
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                for (name, family, parameters) in names {
                    let caps = self.capabilities(&name).await;
                    models.push(ModelInfo {
                        supports_tools: caps.iter().any(|c| c == "tools"),
                        supports_thinking: caps.iter().any(|c| c == "thinking"),
                        supports_vision: caps.iter().any(|c| c == "vision"),
                        context_length: 8192,
                        name,
                        parameters,
                        family,
                    });
                }
            }
            Ok(response) => warn!(status = %response.status(), "ollama model listing failed"),
            Err(err) => warn!(%err, "ollama unreachable while listing models"),
        }

        models.extend(EXTERNAL_MODELS.iter().map(|(name, ctx, params, family)| ModelInfo {
            name: (*name).to_string(),
            context_length: *ctx,
            supports_tools: true,
            supports_thinking: true,
            supports_vision: true,
            parameters: (*params).to_string(),
            family: (*family).to_string(),
        }));
        models
    }

    async fn capabilities(&self, model: &str) -> Vec<String> {
        let result = self
            .client
            .post(format!("{}/api/show", self.ollama_base_url))
            .timeout(Duration::from_secs(6))
            .json(&json!({ "model": model }))
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                let body: Value = response.json().await.unwrap_or(Value::Null);
                body.get("capabilities")
                    .and_then(|c| c.as_array())
                    .map(|caps| {
                        caps.iter()
                            .filter_map(|c| c.as_str().map(ToString::to_string))
                            .collect()
                    })
                    .unwrap_or_default()
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_slot_freshness_window() {
        let slot = CacheSlot { fetched_at: Instant::now(), models: vec![] };
        assert!(slot.is_fresh(Instant::now()));
        assert!(!slot.is_fresh(Instant::now() + MODELS_CACHE_TTL + Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn unreachable_ollama_still_lists_external_models() {
        let catalog = ModelCatalog::new("http://127.0.0.1:9");
        let models = catalog.list().await;
        assert!(models.iter().any(|m| m.name == "deepseek-chat"));
        assert!(models.iter().all(|m| !m.family.is_empty() || m.supports_tools));
    }

    #[tokio::test]
    async fn second_list_hits_the_cache() {
        let catalog = ModelCatalog::new("http://127.0.0.1:9");
        let first = catalog.list().await;
        let second = catalog.list().await;
        assert_eq!(first.len(), second.len());
        assert!(catalog.cache.lock().await.is_some());
    }
}
