use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

// ── Graph store ──────────────────────────────────────────────────────────────

/// Connection settings for the Neo4j graph store.
///
/// Environment variables (`NEO4J_URI`, `NEO4J_USERNAME`, `NEO4J_PASSWORD`)
/// override whatever was loaded from the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub uri: String,
    pub username: String,
    pub password: String,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            uri: "bolt://localhost:7687".to_string(),
            username: "neo4j".to_string(),
            password: "password".to_string(),
        }
    }
}

// ── LLM providers ────────────────────────────────────────────────────────────

/// External OpenAI-compatible providers, routed by model-name prefix.
/// Each entry maps a prefix to the env var names carrying its API key and
/// base URL.  Models matching no prefix are served by the local Ollama
/// runtime.
pub const EXTERNAL_PROVIDERS: &[(&str, &str, &str)] = &[
    ("grok", "LLM_API_KEY", "LLM_API_URL"),
    ("gemini", "GEMINI_API_KEY", "GEMINI_API_URL"),
    ("deepseek", "DEEPSEEK_API_KEY", "DEEPSEEK_API_URL"),
];

/// Credentials for one external OpenAI-compatible endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoint {
    pub api_key: String,
    pub base_url: String,
}

/// Resolve the external endpoint for `model_name`, or `None` when the model
/// should be served by the local Ollama runtime.
pub fn provider_for_model(model_name: &str) -> Option<ProviderEndpoint> {
    for (prefix, key_env, url_env) in EXTERNAL_PROVIDERS {
        if model_name.starts_with(prefix) {
            let api_key = env::var(key_env).unwrap_or_default();
            let base_url = env::var(url_env).unwrap_or_default();
            if api_key.is_empty() || base_url.is_empty() {
                tracing::warn!(model = model_name, prefix, "external provider env vars missing");
                return None;
            }
            return Some(ProviderEndpoint { api_key, base_url });
        }
    }
    None
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL for the Ollama API.  Overridden at runtime by the
    /// `OLLAMA_BASE_URL` environment variable when set.
    pub ollama_base_url: String,
    /// Default chat model for new conversations.
    pub default_model: String,
    /// Small model used for rolling summaries and conversation titles.
    pub summary_model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            ollama_base_url: "http://localhost:11434".to_string(),
            default_model: "qwen3:4b".to_string(),
            summary_model: "qwen3:4b".to_string(),
        }
    }
}

// ── Embeddings ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub model: String,
    /// Vector dimension of the embedding model; must match the graph store's
    /// vector indexes.
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "embeddinggemma".to_string(),
            dimension: 768,
        }
    }
}

// ── Top-level config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub graph: GraphConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    /// Directory for persisted global settings and tool artifacts.
    pub data_dir: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            graph: GraphConfig::default(),
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
            data_dir: "data".to_string(),
        }
    }
}

impl AppConfig {
    /// Load from a TOML file, then apply environment overrides.
    /// A missing file yields the defaults.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }
        config.apply_env();
        Ok(config)
    }

    /// Build purely from environment variables and defaults.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(value) = env::var("NEO4J_URI") {
            if !value.is_empty() {
                self.graph.uri = value;
            }
        }
        if let Ok(value) = env::var("NEO4J_USERNAME") {
            if !value.is_empty() {
                self.graph.username = value;
            }
        }
        if let Ok(value) = env::var("NEO4J_PASSWORD") {
            if !value.is_empty() {
                self.graph.password = value;
            }
        }
        if let Ok(value) = env::var("OLLAMA_BASE_URL") {
            if !value.is_empty() {
                self.llm.ollama_base_url = value;
            }
        }
        if let Ok(value) = env::var("ENGRAM_DATA_DIR") {
            if !value.is_empty() {
                self.data_dir = value;
            }
        }
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Path of the persisted global settings file.
    pub fn settings_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("app_settings.json")
    }
}

// ── Persisted global settings ────────────────────────────────────────────────

/// Global settings applied across all agents.  These are the retrieval
/// similarity floors; per-agent values override them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppSettings {
    pub memory_min_similarity: f64,
    pub knowledge_min_similarity: f64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            memory_min_similarity: 0.65,
            knowledge_min_similarity: 0.7,
        }
    }
}

impl AppSettings {
    /// Load persisted settings from disk.  A missing or corrupt file falls
    /// back to the defaults.
    pub fn load(path: impl AsRef<Path>) -> Self {
        match fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Apply a partial update and persist.  `None` fields keep their current
    /// value.
    pub fn update(
        path: impl AsRef<Path>,
        memory_min_similarity: Option<f64>,
        knowledge_min_similarity: Option<f64>,
    ) -> Result<Self> {
        let mut current = Self::load(&path);
        if let Some(v) = memory_min_similarity {
            current.memory_min_similarity = v.clamp(0.0, 1.0);
        }
        if let Some(v) = knowledge_min_similarity {
            current.knowledge_min_similarity = v.clamp(0.0, 1.0);
        }
        current.save(&path)?;
        Ok(current)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
