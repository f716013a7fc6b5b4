//! Knowledge-base search over the agent's chunk scope.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use engram_memory::{KnowledgeStore, MemoryApi, format_chunks};

use crate::{ParamKind, Tool, ToolCategory, ToolParam, ToolSpec, arg_f64, arg_str, arg_usize, required_str};

/// Search the knowledge base attached to the current agent's scope.
pub struct SearchKnowledgeTool {
    pub api: Arc<MemoryApi>,
    /// Scope searched when the model does not pass one (the agent's name).
    pub default_scope: String,
    /// Similarity floor from settings/agent config.
    pub default_threshold: f64,
}

#[async_trait]
impl Tool for SearchKnowledgeTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "search_knowledge".to_string(),
            description: "Search the current agent's knowledge base for relevant information \
                          from uploaded documents. Use when the answer should come from \
                          attached files rather than general knowledge."
                .to_string(),
            category: ToolCategory::Knowledge,
            params: vec![
                ToolParam::required("query", "What to search for - be descriptive"),
                ToolParam::optional("limit", "Maximum number of results (default 5)")
                    .kind(ParamKind::Integer),
                ToolParam::optional("threshold", "Minimum similarity threshold")
                    .kind(ParamKind::Number),
            ],
        }
    }

    async fn run(&self, args: &Value) -> Result<String> {
        let query = required_str(args, "query")?;
        let scope = arg_str(args, "scope").unwrap_or(&self.default_scope);
        if scope.is_empty() {
            return Ok("No knowledge scope available".to_string());
        }
        let limit = arg_usize(args, "limit", 5);
        let threshold = arg_f64(args, "threshold", self.default_threshold);

        let store = KnowledgeStore { api: self.api.as_ref() };
        let hits = store.search(scope, query, limit, threshold).await?;
        if hits.is_empty() {
            return Ok("No relevant knowledge found in the agent's knowledge base.".to_string());
        }
        Ok(format_chunks(&hits, 600))
    }
}
