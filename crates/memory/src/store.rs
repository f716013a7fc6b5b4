//! Persistence for conversations and agent definitions.
//!
//! CRUD only — no business logic.  Both record kinds live in the graph store
//! alongside the memory nodes, merged on their natural keys.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use engram_llm::{ChatClient, ChatMessage};
use neo4rs::query;

use crate::graph::{GraphResult, GraphStore, Label};

// ── Agent definitions ────────────────────────────────────────────────────────

/// A named configuration bundle defining prompt, tool subset, and limits for
/// one style of conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentDef {
    pub name: String,
    pub prompt: String,
    pub enabled_tools: Vec<String>,
    pub max_memories: usize,
    pub max_tool_runs: usize,
    pub min_similarity: f64,
    pub context_compression: bool,
    pub context_max_tokens: usize,
    pub context_window_tokens: usize,
    pub is_template: bool,
}

impl Default for AgentDef {
    fn default() -> Self {
        Self {
            name: "assistant".to_string(),
            prompt: "You are a helpful AI assistant.\n\
                     Current date and time: {datetime}\n\n\
                     {memories}\n\n\
                     User preferences:\n{user_preferences}\n\n\
                     People you know about: {known_people}\n\n\
                     Be concise and helpful."
                .to_string(),
            enabled_tools: Vec::new(),
            max_memories: 5,
            max_tool_runs: 10,
            min_similarity: 0.65,
            context_compression: false,
            context_max_tokens: 6000,
            context_window_tokens: 2000,
            is_template: false,
        }
    }
}

impl AgentDef {
    /// Validate the prompt template.  Missing core placeholders are
    /// recoverable — the agent still works, just without that context — so
    /// they come back as warnings rather than errors.
    pub fn template_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for placeholder in ["{datetime}", "{memories}"] {
            if !self.prompt.contains(placeholder) {
                warnings.push(format!("prompt is missing the {placeholder} placeholder"));
            }
        }
        warnings
    }
}

pub struct AgentStore<'a> {
    pub graph: &'a GraphStore,
}

impl AgentStore<'_> {
    /// Merge the definition on its name.  Returns template warnings.
    pub async fn save(&self, def: &AgentDef) -> GraphResult<Vec<String>> {
        let warnings = def.template_warnings();
        for warning in &warnings {
            warn!(agent = %def.name, %warning, "agent template warning");
        }
        self.graph
            .merge_node(
                Label::Agent,
                &[("name", json!(def.name))],
                &[
                    ("prompt", json!(def.prompt)),
                    ("enabled_tools", json!(def.enabled_tools)),
                    ("max_memories", json!(def.max_memories as i64)),
                    ("max_tool_runs", json!(def.max_tool_runs as i64)),
                    ("min_similarity", json!(def.min_similarity)),
                    ("context_compression", json!(def.context_compression)),
                    ("context_max_tokens", json!(def.context_max_tokens as i64)),
                    ("context_window_tokens", json!(def.context_window_tokens as i64)),
                    ("is_template", json!(def.is_template)),
                ],
            )
            .await?;
        info!(agent = %def.name, "agent definition saved");
        Ok(warnings)
    }

    pub async fn get(&self, name: &str) -> GraphResult<Option<AgentDef>> {
        let row = self
            .graph
            .fetch_one(
                query("MATCH (a:Agent {name: $name}) RETURN a AS node").param("name", name),
            )
            .await?;
        Ok(row.and_then(|r| r.get::<neo4rs::Node>("node").ok()).map(agent_from_node))
    }

    pub async fn all(&self) -> GraphResult<Vec<AgentDef>> {
        let rows = self
            .graph
            .fetch(query(
                "MATCH (a:Agent) RETURN a AS node \
                 ORDER BY a.is_template DESC, a.name",
            ))
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|r| r.get::<neo4rs::Node>("node").ok())
            .map(agent_from_node)
            .collect())
    }

    pub async fn delete(&self, name: &str) -> GraphResult<()> {
        self.graph
            .run(query("MATCH (a:Agent {name: $name}) DELETE a").param("name", name))
            .await
    }
}

fn agent_from_node(node: neo4rs::Node) -> AgentDef {
    let defaults = AgentDef::default();
    AgentDef {
        name: crate::graph::node_string_or_empty(&node, "name"),
        prompt: crate::graph::node_string_or_empty(&node, "prompt"),
        enabled_tools: crate::graph::node_string_list(&node, "enabled_tools"),
        max_memories: node.get::<i64>("max_memories").map(|v| v as usize).unwrap_or(defaults.max_memories),
        max_tool_runs: node.get::<i64>("max_tool_runs").map(|v| v as usize).unwrap_or(defaults.max_tool_runs),
        min_similarity: node.get::<f64>("min_similarity").unwrap_or(defaults.min_similarity),
        context_compression: node.get::<bool>("context_compression").unwrap_or(defaults.context_compression),
        context_max_tokens: node
            .get::<i64>("context_max_tokens")
            .map(|v| v as usize)
            .unwrap_or(defaults.context_max_tokens),
        context_window_tokens: node
            .get::<i64>("context_window_tokens")
            .map(|v| v as usize)
            .unwrap_or(defaults.context_window_tokens),
        is_template: node.get::<bool>("is_template").unwrap_or(false),
    }
}

// ── Conversations ────────────────────────────────────────────────────────────

/// A persisted conversation.  `messages` is the serialized message array;
/// `summary_chunk` keeps only the most recent rolling summary so a reloaded
/// session can keep compacting where it left off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
    pub messages: String,
    pub agent: String,
    pub model: String,
    #[serde(default)]
    pub summary_chunk: Option<String>,
}

impl Conversation {
    pub fn new(title: &str, messages: &str, agent: &str, model: &str) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            created_at: now.clone(),
            updated_at: now,
            messages: messages.to_string(),
            agent: agent.to_string(),
            model: model.to_string(),
            summary_chunk: None,
        }
    }

    /// Replace the rolling summary; only the most recent one is retained.
    pub fn set_summary(&mut self, summary: impl Into<String>) {
        self.summary_chunk = Some(summary.into());
    }
}

/// Metadata-only projection for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMeta {
    pub id: String,
    pub title: String,
    pub updated_at: String,
    pub agent: String,
    pub model: String,
}

pub struct ConversationStore<'a> {
    pub graph: &'a GraphStore,
}

impl ConversationStore<'_> {
    pub async fn save(&self, conversation: &Conversation) -> GraphResult<String> {
        self.graph
            .merge_node(
                Label::Conversation,
                &[("id", json!(conversation.id))],
                &[
                    ("title", json!(conversation.title)),
                    ("created_at", json!(conversation.created_at)),
                    ("updated_at", json!(conversation.updated_at)),
                    ("messages", json!(conversation.messages)),
                    ("agent", json!(conversation.agent)),
                    ("model", json!(conversation.model)),
                    (
                        "summary_chunk",
                        conversation
                            .summary_chunk
                            .as_ref()
                            .map(|s| json!(s))
                            .unwrap_or(serde_json::Value::Null),
                    ),
                ],
            )
            .await?;
        Ok(conversation.id.clone())
    }

    /// Replace the serialized messages and bump `updated_at`.
    pub async fn update_messages(&self, id: &str, messages: &str) -> GraphResult<()> {
        self.graph
            .run(
                query(
                    "MATCH (c:Conversation {id: $id}) \
                     SET c.messages = $messages, c.updated_at = $updated_at",
                )
                .param("id", id)
                .param("messages", messages)
                .param("updated_at", chrono::Utc::now().to_rfc3339()),
            )
            .await
    }

    pub async fn get(&self, id: &str) -> GraphResult<Option<Conversation>> {
        let row = self
            .graph
            .fetch_one(query("MATCH (c:Conversation {id: $id}) RETURN c AS node").param("id", id))
            .await?;
        Ok(row
            .and_then(|r| r.get::<neo4rs::Node>("node").ok())
            .map(conversation_from_node))
    }

    /// Metadata-only listing, newest first, without the message payloads.
    pub async fn all_metadata(&self) -> GraphResult<Vec<ConversationMeta>> {
        let rows = self
            .graph
            .fetch(query(
                "MATCH (c:Conversation) RETURN c AS node ORDER BY c.updated_at DESC",
            ))
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|r| r.get::<neo4rs::Node>("node").ok())
            .map(|node| ConversationMeta {
                id: crate::graph::node_string_or_empty(&node, "id"),
                title: crate::graph::node_string_or_empty(&node, "title"),
                updated_at: crate::graph::node_string_or_empty(&node, "updated_at"),
                agent: crate::graph::node_string_or_empty(&node, "agent"),
                model: crate::graph::node_string_or_empty(&node, "model"),
            })
            .collect())
    }

    pub async fn delete(&self, id: &str) -> GraphResult<()> {
        self.graph
            .run(query("MATCH (c:Conversation {id: $id}) DELETE c").param("id", id))
            .await
    }
}

fn conversation_from_node(node: neo4rs::Node) -> Conversation {
    Conversation {
        id: crate::graph::node_string_or_empty(&node, "id"),
        title: crate::graph::node_string_or_empty(&node, "title"),
        created_at: crate::graph::node_string_or_empty(&node, "created_at"),
        updated_at: crate::graph::node_string_or_empty(&node, "updated_at"),
        messages: crate::graph::node_string_or_empty(&node, "messages"),
        agent: crate::graph::node_string_or_empty(&node, "agent"),
        model: crate::graph::node_string_or_empty(&node, "model"),
        summary_chunk: crate::graph::node_string(&node, "summary_chunk"),
    }
}

// ── Title generation ─────────────────────────────────────────────────────────

/// Generate a short conversation title from the first exchange via a second,
/// small LLM completion.  Falls back to a truncated first message on any
/// failure.
pub async fn generate_title(
    llm: &dyn ChatClient,
    model: &str,
    user_message: &str,
    assistant_message: &str,
) -> String {
    let mut context = format!("User: {}", truncate_chars(user_message, 300));
    if !assistant_message.is_empty() {
        context.push_str(&format!("\n\nAssistant: {}", truncate_chars(assistant_message, 300)));
    }
    let prompt = format!(
        "Generate a very short title (3-5 words max) summarizing this conversation. \
         Reply with ONLY the title, nothing else. No quotes, no punctuation at the end.\n\n{context}"
    );

    match llm.chat(model, &[ChatMessage::user(prompt)]).await {
        Ok(reply) => {
            let title = reply.content.trim().trim_matches('"').trim_matches('\'').to_string();
            if title.is_empty() || title.chars().count() > 50 {
                fallback_title(user_message)
            } else {
                title
            }
        }
        Err(err) => {
            warn!(%err, "title generation failed, falling back to truncation");
            fallback_title(user_message)
        }
    }
}

/// Truncated first user message, the title of last resort.
pub fn fallback_title(user_message: &str) -> String {
    if user_message.chars().count() > 30 {
        format!("{}...", truncate_chars(user_message, 30))
    } else {
        user_message.to_string()
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

// ── Tests ────────────────────────────────────────────────────────────────────
