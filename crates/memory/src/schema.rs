//! Typed node schema for the knowledge graph.
//!
//! Each variant knows its label, merge key, and the text its embedding is
//! computed from.  This is the single place where node shapes are defined;
//! the memory API persists them through [`crate::graph::GraphStore`].

use serde_json::{Value, json};

use crate::graph::Label;

/// The singleton user node's merge key value.
pub const USER_NAME: &str = "User";

// ── Memory nodes ─────────────────────────────────────────────────────────────

/// A typed node destined for the graph.
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryNode {
    Person {
        name: String,
        description: String,
    },
    Event {
        description: String,
        date: String,
    },
    Fact {
        content: String,
        category: String,
    },
    Preference {
        instruction: String,
    },
    KnowledgeChunk {
        document_id: String,
        chunk_index: i64,
        content: String,
        summary: String,
        tags: Vec<String>,
        scope: String,
    },
}

impl MemoryNode {
    pub fn label(&self) -> Label {
        match self {
            MemoryNode::Person { .. } => Label::Person,
            MemoryNode::Event { .. } => Label::Event,
            MemoryNode::Fact { .. } => Label::Fact,
            MemoryNode::Preference { .. } => Label::Preference,
            MemoryNode::KnowledgeChunk { .. } => Label::KnowledgeChunk,
        }
    }

    /// Properties that uniquely identify this node within its label.
    pub fn merge_key(&self) -> Vec<(&'static str, Value)> {
        match self {
            MemoryNode::Person { name, .. } => vec![("name", json!(name))],
            MemoryNode::Event { description, date } => {
                vec![("date", json!(date)), ("description", json!(description))]
            }
            MemoryNode::Fact { content, .. } => vec![("content", json!(content))],
            MemoryNode::Preference { instruction } => vec![("instruction", json!(instruction))],
            MemoryNode::KnowledgeChunk { document_id, chunk_index, .. } => vec![
                ("document_id", json!(document_id)),
                ("chunk_index", json!(chunk_index)),
            ],
        }
    }

    /// Non-key properties written on every save.
    pub fn fields(&self) -> Vec<(&'static str, Value)> {
        match self {
            MemoryNode::Person { description, .. } => vec![("description", json!(description))],
            MemoryNode::Event { .. } => vec![],
            MemoryNode::Fact { category, .. } => vec![("category", json!(category))],
            MemoryNode::Preference { .. } => vec![],
            MemoryNode::KnowledgeChunk { content, summary, tags, scope, .. } => vec![
                ("content", json!(content)),
                ("summary", json!(summary)),
                ("tags", json!(tags)),
                ("scope", json!(scope)),
            ],
        }
    }

    /// Text the node's embedding is derived from.
    pub fn embedding_text(&self) -> String {
        match self {
            MemoryNode::Person { name, description } => format!("{name} {description}"),
            MemoryNode::Event { description, date } => format!("{description} {date}"),
            MemoryNode::Fact { content, category } => format!("{content} {category}"),
            MemoryNode::Preference { instruction } => instruction.clone(),
            MemoryNode::KnowledgeChunk { content, .. } => content.clone(),
        }
    }

    /// Human-readable one-liner used in tool output and retrieval results.
    pub fn display(&self) -> String {
        match self {
            MemoryNode::Person { name, description } => {
                if description.is_empty() {
                    name.clone()
                } else {
                    format!("{name}: {description}")
                }
            }
            MemoryNode::Event { description, date } => format!("[{date}] {description}"),
            MemoryNode::Fact { content, category } => format!("{content} ({category})"),
            MemoryNode::Preference { instruction } => instruction.clone(),
            MemoryNode::KnowledgeChunk { content, summary, .. } => {
                if summary.is_empty() {
                    content.clone()
                } else {
                    summary.clone()
                }
            }
        }
    }
}

// ── Relationship property bundles ────────────────────────────────────────────

/// Props on a `User-KNOWS->Person` or `Person-KNOWS->Person` edge.
#[derive(Debug, Clone, Default)]
pub struct Knows {
    pub relation_type: String,
    pub sentiment: Option<String>,
    pub since: Option<String>,
}

impl Knows {
    pub fn props(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("relation_type", json!(self.relation_type)),
            ("sentiment", self.sentiment.as_ref().map(|s| json!(s)).unwrap_or(Value::Null)),
            ("since", self.since.as_ref().map(|s| json!(s)).unwrap_or(Value::Null)),
        ]
    }
}

/// Props on a `Person-PARTICIPATED_IN->Event` edge.
#[derive(Debug, Clone)]
pub struct ParticipatedIn {
    pub role: String,
}

impl Default for ParticipatedIn {
    fn default() -> Self {
        Self { role: "participant".to_string() }
    }
}

/// Props on an `Event-MENTIONS->Person` edge.
#[derive(Debug, Clone)]
pub struct Mentions {
    pub sentiment: String,
}

impl Default for Mentions {
    fn default() -> Self {
        Self { sentiment: "neutral".to_string() }
    }
}

// ── Knowledge chunk tag vocabulary ───────────────────────────────────────────

/// Closed vocabulary of content-type tags a chunk may carry.  Tags outside
/// this set are dropped at save time so the tag space stays queryable.
pub const CHUNK_TAGS: &[&str] = &[
    "definition",
    "procedure",
    "example",
    "reference",
    "faq",
    "policy",
    "troubleshooting",
    "configuration",
    "api",
    "tutorial",
    "overview",
    "comparison",
    "statistics",
    "history",
    "biography",
    "legal",
    "finance",
    "health",
    "news",
    "opinion",
];

/// Lowercase, dedupe, and restrict `raw` to the closed vocabulary.
pub fn normalize_tags(raw: &[String]) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for tag in raw {
        let tag = tag.trim().to_lowercase();
        if CHUNK_TAGS.contains(&tag.as_str()) && !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags
}

// ── Tests ────────────────────────────────────────────────────────────────────
