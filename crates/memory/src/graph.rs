//! Low-level graph store over a single pooled Neo4j connection.
//!
//! All typed nodes and edges live here.  Writes are idempotent on their merge
//! keys, node labels come from the closed [`Label`] alphabet, and dynamic
//! relationship types pass through [`sanitize_rel_type`] — caller-supplied
//! text never reaches the query string, only `$parameters`.

use neo4rs::{BoltType, Graph, Query, query};
use serde_json::Value;
use tracing::{debug, info};

use engram_config::GraphConfig;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("embedding unavailable: {0}")]
    Embedding(String),
    #[error("graph backend failure: {0}")]
    Backend(#[from] neo4rs::Error),
}

pub type GraphResult<T> = Result<T, GraphError>;

impl From<engram_llm::EmbedError> for GraphError {
    fn from(err: engram_llm::EmbedError) -> Self {
        GraphError::Embedding(err.to_string())
    }
}

// ── Labels ───────────────────────────────────────────────────────────────────

/// Closed alphabet of node labels.  Labels are interpolated into query text,
/// so they must never come from caller strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    User,
    Person,
    Event,
    Fact,
    Preference,
    KnowledgeChunk,
    KnowledgeDocument,
    Agent,
    Conversation,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::User => "User",
            Label::Person => "Person",
            Label::Event => "Event",
            Label::Fact => "Fact",
            Label::Preference => "Preference",
            Label::KnowledgeChunk => "KnowledgeChunk",
            Label::KnowledgeDocument => "KnowledgeDocument",
            Label::Agent => "Agent",
            Label::Conversation => "Conversation",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "User" => Some(Label::User),
            "Person" => Some(Label::Person),
            "Event" => Some(Label::Event),
            "Fact" => Some(Label::Fact),
            "Preference" => Some(Label::Preference),
            "KnowledgeChunk" => Some(Label::KnowledgeChunk),
            "KnowledgeDocument" => Some(Label::KnowledgeDocument),
            "Agent" => Some(Label::Agent),
            "Conversation" => Some(Label::Conversation),
            _ => None,
        }
    }

    /// Name of this label's vector index.
    pub fn vector_index(&self) -> String {
        format!("embedding_index_{}", self.as_str())
    }
}

/// Labels that carry an embedding and get a vector index at startup.
pub const VECTOR_LABELS: &[Label] = &[
    Label::Person,
    Label::Event,
    Label::Fact,
    Label::Preference,
    Label::KnowledgeChunk,
];

// ── Relationship sanitization ────────────────────────────────────────────────

/// Fallback relationship type for dynamic types that sanitize to nothing.
pub const FALLBACK_REL_TYPE: &str = "RELATES_TO";

/// Sanitize a caller-supplied relationship type to the `[A-Z_]+` alphabet.
///
/// Relationship types cannot be parameterized in Cypher, so this is the only
/// path by which dynamic text may enter a query string.
pub fn sanitize_rel_type(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .map(|c| c.to_ascii_uppercase())
        .filter(|c| c.is_ascii_uppercase() || *c == '_')
        .collect();
    let cleaned = cleaned.trim_matches('_').to_string();
    if cleaned.is_empty() {
        FALLBACK_REL_TYPE.to_string()
    } else {
        cleaned
    }
}

/// Property keys are generated by this crate, but validate them anyway before
/// splicing into a SET clause.
fn valid_property_key(key: &str) -> bool {
    !key.is_empty()
        && key.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Convert a JSON value into a Bolt parameter.  `Null` entries are filtered
/// out by the callers before reaching this point; the arm is kept total.
fn to_bolt(value: &Value) -> BoltType {
    match value {
        Value::Null => String::new().into(),
        Value::Bool(b) => (*b).into(),
        Value::Number(n) => match n.as_i64() {
            Some(i) => i.into(),
            None => n.as_f64().unwrap_or(0.0).into(),
        },
        Value::String(s) => s.clone().into(),
        Value::Array(items) => items.iter().map(to_bolt).collect::<Vec<BoltType>>().into(),
        Value::Object(_) => value.to_string().into(),
    }
}

/// Embeddings are stored as float lists; Bolt floats are f64.
pub fn embedding_param(embedding: &[f32]) -> Vec<f64> {
    embedding.iter().map(|x| *x as f64).collect()
}

// ── A single vector hit ──────────────────────────────────────────────────────

/// One row returned from a vector index query.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub score: f64,
    pub node: neo4rs::Node,
}

// ── GraphStore ───────────────────────────────────────────────────────────────

/// One pooled connection manager for the process lifetime.  Individual
/// operations run in short sessions drawn from the pool.
pub struct GraphStore {
    graph: Graph,
    dimension: usize,
}

impl GraphStore {
    pub async fn connect(config: &GraphConfig, dimension: usize) -> GraphResult<Self> {
        let graph = Graph::new(&config.uri, &config.username, &config.password).await?;
        info!(uri = %config.uri, dimension, "connected to graph store");
        Ok(Self { graph, dimension })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Idempotently create the vector indexes for every embedded label.
    pub async fn ensure_vector_indexes(&self) -> GraphResult<()> {
        for label in VECTOR_LABELS {
            let cypher = format!(
                "CREATE VECTOR INDEX {index} IF NOT EXISTS \
                 FOR (n:{label}) ON n.embedding \
                 OPTIONS {{indexConfig: {{`vector.dimensions`: {dim}, `vector.similarity_function`: 'cosine'}}}}",
                index = label.vector_index(),
                label = label.as_str(),
                dim = self.dimension,
            );
            self.graph.run(query(&cypher)).await?;
            debug!(label = label.as_str(), "vector index ensured");
        }
        Ok(())
    }

    /// Run a query, discarding rows.
    pub async fn run(&self, q: Query) -> GraphResult<()> {
        self.graph.run(q).await?;
        Ok(())
    }

    /// Run a query and collect all rows.
    pub async fn fetch(&self, q: Query) -> GraphResult<Vec<neo4rs::Row>> {
        let mut stream = self.graph.execute(q).await?;
        let mut rows = Vec::new();
        while let Some(row) = stream.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Run a query expecting at most one row.
    pub async fn fetch_one(&self, q: Query) -> GraphResult<Option<neo4rs::Row>> {
        let mut stream = self.graph.execute(q).await?;
        Ok(stream.next().await?)
    }

    /// MERGE a node on its merge keys and SET the remaining fields.
    /// Null-valued fields are dropped.  Returns the node's element id.
    pub async fn merge_node(
        &self,
        label: Label,
        merge_keys: &[(&str, Value)],
        fields: &[(&str, Value)],
    ) -> GraphResult<String> {
        if merge_keys.is_empty() {
            return Err(GraphError::Validation("merge_node requires at least one merge key".into()));
        }
        for (key, _) in merge_keys.iter().chain(fields.iter()) {
            if !valid_property_key(key) {
                return Err(GraphError::Validation(format!("invalid property key: {key}")));
            }
        }

        let merge_clause = merge_keys
            .iter()
            .map(|(k, _)| format!("{k}: ${k}"))
            .collect::<Vec<_>>()
            .join(", ");
        let set_fields: Vec<&(&str, Value)> =
            fields.iter().filter(|(_, v)| !v.is_null()).collect();
        let set_clause = set_fields
            .iter()
            .map(|(k, _)| format!("n.{k} = ${k}"))
            .collect::<Vec<_>>()
            .join(", ");

        let cypher = if set_clause.is_empty() {
            format!(
                "MERGE (n:{label} {{{merge_clause}}}) RETURN elementId(n) AS id",
                label = label.as_str(),
            )
        } else {
            format!(
                "MERGE (n:{label} {{{merge_clause}}}) SET {set_clause} RETURN elementId(n) AS id",
                label = label.as_str(),
            )
        };

        let mut q = query(&cypher);
        for (key, value) in merge_keys {
            q = q.param(key, to_bolt(value));
        }
        for (key, value) in &set_fields {
            q = q.param(key, to_bolt(value));
        }

        let row = self
            .fetch_one(q)
            .await?
            .ok_or_else(|| GraphError::NotFound(format!("merge on {} returned nothing", label.as_str())))?;
        let id: String = row
            .get("id")
            .map_err(|e| GraphError::Validation(format!("merge result missing id: {e}")))?;
        debug!(label = label.as_str(), %id, "node merged");
        Ok(id)
    }

    /// MERGE an edge between two nodes addressed by element id.  The
    /// relationship type is sanitized to `[A-Z_]+` with a `RELATES_TO`
    /// fallback.
    pub async fn upsert_edge(
        &self,
        from_id: &str,
        rel_type: &str,
        to_id: &str,
        props: &[(&str, Value)],
    ) -> GraphResult<()> {
        let rel = sanitize_rel_type(rel_type);
        for (key, _) in props {
            if !valid_property_key(key) {
                return Err(GraphError::Validation(format!("invalid property key: {key}")));
            }
        }
        let set_props: Vec<&(&str, Value)> = props.iter().filter(|(_, v)| !v.is_null()).collect();
        let set_clause = if set_props.is_empty() {
            String::new()
        } else {
            format!(
                " SET {}",
                set_props
                    .iter()
                    .map(|(k, _)| format!("r.{k} = ${k}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };
        let cypher = format!(
            "MATCH (a) WHERE elementId(a) = $from_id \
             MATCH (b) WHERE elementId(b) = $to_id \
             MERGE (a)-[r:{rel}]->(b){set_clause}"
        );
        let mut q = query(&cypher).param("from_id", from_id).param("to_id", to_id);
        for (key, value) in &set_props {
            q = q.param(key, to_bolt(value));
        }
        self.run(q).await
    }

    /// Query a label's vector index for the `k` nearest nodes.
    pub async fn query_vector(
        &self,
        label: Label,
        k: usize,
        embedding: &[f32],
    ) -> GraphResult<Vec<VectorHit>> {
        let rows = self
            .fetch(
                query(
                    "CALL db.index.vector.queryNodes($index, $k, $embedding) \
                     YIELD node, score \
                     RETURN node, score, elementId(node) AS id",
                )
                .param("index", label.vector_index())
                .param("k", k as i64)
                .param("embedding", embedding_param(embedding)),
            )
            .await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row
                .get("id")
                .map_err(|e| GraphError::Validation(format!("vector hit missing id: {e}")))?;
            let score: f64 = row.get("score").unwrap_or(0.0);
            let node: neo4rs::Node = row
                .get("node")
                .map_err(|e| GraphError::Validation(format!("vector hit missing node: {e}")))?;
            hits.push(VectorHit { id, score, node });
        }
        Ok(hits)
    }

    /// DETACH DELETE a node by element id.  `Ok(false)` when nothing matched.
    pub async fn delete_by_id(&self, id: &str) -> GraphResult<bool> {
        let row = self
            .fetch_one(
                query(
                    "MATCH (n) WHERE elementId(n) = $id \
                     DETACH DELETE n RETURN count(n) AS deleted",
                )
                .param("id", id),
            )
            .await?;
        let deleted: i64 = row.and_then(|r| r.get("deleted").ok()).unwrap_or(0);
        Ok(deleted > 0)
    }
}

// ── Node property helpers ────────────────────────────────────────────────────

pub fn node_string(node: &neo4rs::Node, key: &str) -> Option<String> {
    node.get::<String>(key).ok()
}

pub fn node_string_or_empty(node: &neo4rs::Node, key: &str) -> String {
    node.get::<String>(key).unwrap_or_default()
}

pub fn node_string_list(node: &neo4rs::Node, key: &str) -> Vec<String> {
    node.get::<Vec<String>>(key).unwrap_or_default()
}

pub fn node_embedding(node: &neo4rs::Node) -> Option<Vec<f32>> {
    node.get::<Vec<f64>>("embedding")
        .ok()
        .map(|v| v.into_iter().map(|x| x as f32).collect())
}

// ── Tests ────────────────────────────────────────────────────────────────────
