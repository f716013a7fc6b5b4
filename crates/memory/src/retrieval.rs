//! Hybrid retrieval — vector similarity fused with a 1-hop subgraph around a
//! detected entity.
//!
//! Entity detection runs three passes in order of strictness: exact token
//! match against canonical names and aliases, fuzzy token match (normalized
//! edit distance), and — for short queries only — embedding similarity
//! against person vectors.  Detected entities contribute structurally-scored
//! neighbors that are merged with the vector hits into one deterministic
//! ranking.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, info};

use engram_llm::Embedder;
use neo4rs::query;

use crate::canonical::{PersonRef, load_people};
use crate::graph::{GraphError, GraphResult, GraphStore, Label, node_string_list, node_string_or_empty};
use crate::schema::MemoryNode;

/// Score assigned to memories reached through the detected entity's subgraph.
const STRUCTURAL_SCORE: f64 = 0.9;
/// Bonus applied when a memory is found by both the vector and the subgraph
/// path.
const OVERLAP_BONUS: f64 = 0.05;
/// Minimum fuzzy ratio for a token to count as a person reference.
const FUZZY_THRESHOLD: f64 = 0.8;
/// Minimum embedding similarity for the short-query person fallback.
const EMBED_FALLBACK_THRESHOLD: f32 = 0.85;
/// Queries with at most this many tokens may use the embedding fallback.
const SHORT_QUERY_TOKENS: usize = 4;

/// Labels searched when the caller does not restrict them.
pub const DEFAULT_RETRIEVAL_LABELS: &[Label] =
    &[Label::Person, Label::Event, Label::Fact, Label::Preference];

// ── Similarity ───────────────────────────────────────────────────────────────

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(-1.0, 1.0)
}

// ── Entity detection ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMatch {
    pub id: String,
    pub name: String,
}

fn word_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\w+").expect("static word pattern"))
}

pub(crate) fn tokenize_words(text: &str) -> Vec<String> {
    word_regex()
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// Detect which person (if any) a query refers to.
///
/// Exact token equality against a canonical name or alias wins immediately.
/// Otherwise the best fuzzy token ratio ≥ 0.8 wins.  For short queries
/// (≤ 4 tokens) with no lexical match, the query embedding is compared
/// against person embeddings, accepting the best ≥ 0.85.
pub fn detect_entity(
    query_text: &str,
    query_embedding: Option<&[f32]>,
    persons: &[PersonRef],
) -> Option<EntityMatch> {
    let tokens = tokenize_words(query_text);
    if tokens.is_empty() {
        return None;
    }

    let mut best_fuzzy: Option<(f64, &PersonRef)> = None;
    for person in persons {
        let mut candidates: Vec<String> = vec![person.name.to_lowercase()];
        candidates.extend(person.aliases.iter().map(|a| a.to_lowercase()));

        for token in &tokens {
            for candidate in &candidates {
                if token == candidate {
                    debug!(person = %person.name, token, "entity detected by exact token");
                    return Some(EntityMatch { id: person.id.clone(), name: person.name.clone() });
                }
                let ratio = strsim::normalized_levenshtein(token, candidate);
                if ratio >= FUZZY_THRESHOLD
                    && best_fuzzy.map(|(r, _)| ratio > r).unwrap_or(true)
                {
                    best_fuzzy = Some((ratio, person));
                }
            }
        }
    }

    if let Some((ratio, person)) = best_fuzzy {
        debug!(person = %person.name, ratio, "entity detected by fuzzy match");
        return Some(EntityMatch { id: person.id.clone(), name: person.name.clone() });
    }

    // Short-query heuristic: the whole query is probably *about* one person,
    // so its embedding can stand in for a name.
    if tokens.len() <= SHORT_QUERY_TOKENS {
        if let Some(q_emb) = query_embedding {
            let mut best: Option<(f32, &PersonRef)> = None;
            for person in persons {
                let Some(ref emb) = person.embedding else { continue };
                let similarity = cosine_similarity(q_emb, emb);
                if similarity >= EMBED_FALLBACK_THRESHOLD
                    && best.map(|(s, _)| similarity > s).unwrap_or(true)
                {
                    best = Some((similarity, person));
                }
            }
            if let Some((similarity, person)) = best {
                debug!(person = %person.name, similarity, "entity detected by embedding fallback");
                return Some(EntityMatch { id: person.id.clone(), name: person.name.clone() });
            }
        }
    }

    None
}

// ── Retrieved memories ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalSource {
    /// Reached through the detected entity's subgraph.
    Graph,
    /// Found by vector similarity alone.
    Semantic,
}

#[derive(Debug, Clone)]
pub struct RetrievedMemory {
    pub id: String,
    pub label: Label,
    pub content: String,
    pub score: f64,
    pub source: RetrievalSource,
    /// Relationship type linking the memory to the detected entity.
    pub rel_type: Option<String>,
    /// Name of the detected entity, for entity-linked hits.
    pub entity: Option<String>,
    /// Person names connected to this memory (semantic hits only).
    pub connections: Vec<String>,
}

impl RetrievedMemory {
    /// Human-readable line with the relationship or connection prefix.
    pub fn annotated(&self) -> String {
        if let (Some(rel), Some(entity)) = (&self.rel_type, &self.entity) {
            return format!("[{rel} {entity}] {}", self.content);
        }
        if !self.connections.is_empty() {
            return format!("[{}] {}", self.connections.join(", "), self.content);
        }
        self.content.clone()
    }
}

/// Fuse vector and structural hits into one ranking.
///
/// Memories present in both sets take `max(score) + 0.05` and keep the
/// structural annotation.  Ordering is total: score descending, graph-linked
/// before semantic on ties, then id ascending.
pub fn merge_and_rank(
    vector_hits: Vec<RetrievedMemory>,
    structural_hits: Vec<RetrievedMemory>,
    limit: usize,
) -> Vec<RetrievedMemory> {
    let mut by_id: HashMap<String, RetrievedMemory> = HashMap::new();
    for hit in vector_hits {
        by_id.insert(hit.id.clone(), hit);
    }
    for mut hit in structural_hits {
        match by_id.remove(&hit.id) {
            Some(existing) => {
                hit.score = existing.score.max(hit.score) + OVERLAP_BONUS;
                by_id.insert(hit.id.clone(), hit);
            }
            None => {
                by_id.insert(hit.id.clone(), hit);
            }
        }
    }

    let mut merged: Vec<RetrievedMemory> = by_id.into_values().collect();
    merged.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| source_rank(a.source).cmp(&source_rank(b.source)))
            .then_with(|| a.id.cmp(&b.id))
    });
    merged.truncate(limit);
    merged
}

/// Char-boundary-safe prefix for log lines.
pub fn preview(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn source_rank(source: RetrievalSource) -> u8 {
    match source {
        RetrievalSource::Graph => 0,
        RetrievalSource::Semantic => 1,
    }
}

/// Rebuild a display string from a fetched node.
pub fn render_node(label: Label, node: &neo4rs::Node) -> String {
    let node = match label {
        Label::Person => MemoryNode::Person {
            name: node_string_or_empty(node, "name"),
            description: node_string_or_empty(node, "description"),
        },
        Label::Event => MemoryNode::Event {
            description: node_string_or_empty(node, "description"),
            date: node_string_or_empty(node, "date"),
        },
        Label::Fact => MemoryNode::Fact {
            content: node_string_or_empty(node, "content"),
            category: node_string_or_empty(node, "category"),
        },
        Label::Preference => MemoryNode::Preference {
            instruction: node_string_or_empty(node, "instruction"),
        },
        Label::KnowledgeChunk => MemoryNode::KnowledgeChunk {
            document_id: node_string_or_empty(node, "document_id"),
            chunk_index: 0,
            content: node_string_or_empty(node, "content"),
            summary: node_string_or_empty(node, "summary"),
            tags: node_string_list(node, "tags"),
            scope: node_string_or_empty(node, "scope"),
        },
        other => return format!("{}: (unsupported)", other.as_str()),
    };
    node.display()
}

// ── Retriever ────────────────────────────────────────────────────────────────

pub struct Retriever<'a> {
    pub graph: &'a GraphStore,
    pub embedder: &'a dyn Embedder,
}

impl Retriever<'_> {
    /// Full hybrid retrieval per the ranking contract above.
    pub async fn retrieve(
        &self,
        query_text: &str,
        labels: &[Label],
        limit: usize,
        min_similarity: f64,
    ) -> GraphResult<Vec<RetrievedMemory>> {
        let q_emb = self.embedder.embed(query_text).await.map_err(GraphError::from)?;
        let people = load_people(self.graph).await?;
        let entity = detect_entity(query_text, Some(&q_emb), &people);

        let labels = if labels.is_empty() { DEFAULT_RETRIEVAL_LABELS } else { labels };

        let mut vector_hits = Vec::new();
        for label in labels {
            for hit in self.graph.query_vector(*label, limit, &q_emb).await? {
                if hit.score < min_similarity {
                    continue;
                }
                vector_hits.push(RetrievedMemory {
                    content: render_node(*label, &hit.node),
                    id: hit.id,
                    label: *label,
                    score: hit.score,
                    source: RetrievalSource::Semantic,
                    rel_type: None,
                    entity: None,
                    connections: Vec::new(),
                });
            }
        }

        let structural_hits = match &entity {
            Some(entity) => self.subgraph_hits(entity, 2 * limit).await?,
            None => Vec::new(),
        };

        info!(
            query = preview(query_text, 80),
            vector = vector_hits.len(),
            structural = structural_hits.len(),
            entity = entity.as_ref().map(|e| e.name.as_str()).unwrap_or("-"),
            "hybrid retrieval"
        );

        let mut merged = merge_and_rank(vector_hits, structural_hits, limit);

        // Semantic hits get annotated with their outgoing person links.
        for item in &mut merged {
            if item.source == RetrievalSource::Semantic {
                item.connections = self.person_connections(&item.id).await?;
            }
        }
        Ok(merged)
    }

    /// Memories within one hop of the detected entity.
    async fn subgraph_hits(&self, entity: &EntityMatch, max: usize) -> GraphResult<Vec<RetrievedMemory>> {
        let rows = self
            .graph
            .fetch(
                query(
                    "MATCH (p:Person) WHERE elementId(p) = $id \
                     MATCH (p)-[r]-(m) \
                     WHERE NOT m:User AND NOT m:Agent AND NOT m:Conversation AND NOT m:KnowledgeDocument \
                     RETURN elementId(m) AS id, labels(m)[0] AS label, type(r) AS rel, m AS node \
                     LIMIT $max",
                )
                .param("id", entity.id.as_str())
                .param("max", max as i64),
            )
            .await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row
                .get("id")
                .map_err(|e| GraphError::Validation(format!("subgraph row missing id: {e}")))?;
            let label_name: String = row.get("label").unwrap_or_default();
            let Some(label) = Label::parse(&label_name) else { continue };
            let rel: String = row.get("rel").unwrap_or_default();
            let node: neo4rs::Node = row
                .get("node")
                .map_err(|e| GraphError::Validation(format!("subgraph row missing node: {e}")))?;
            hits.push(RetrievedMemory {
                content: render_node(label, &node),
                id,
                label,
                score: STRUCTURAL_SCORE,
                source: RetrievalSource::Graph,
                rel_type: Some(rel),
                entity: Some(entity.name.clone()),
                connections: Vec::new(),
            });
        }
        Ok(hits)
    }

    /// Person names connected to a memory, for the `[conn1, conn2]` prefix.
    async fn person_connections(&self, memory_id: &str) -> GraphResult<Vec<String>> {
        let rows = self
            .graph
            .fetch(
                query(
                    "MATCH (m)-[]-(p:Person) WHERE elementId(m) = $id \
                     RETURN DISTINCT p.name AS name ORDER BY name LIMIT 5",
                )
                .param("id", memory_id),
            )
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.get::<String>("name").ok())
            .collect())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn person(id: &str, name: &str, aliases: &[&str], embedding: Option<Vec<f32>>) -> PersonRef {
        PersonRef {
            id: id.to_string(),
            name: name.to_string(),
            aliases: aliases.iter().map(|s| s.to_string()).collect(),
            embedding,
        }
    }

    fn hit(id: &str, score: f64, source: RetrievalSource) -> RetrievedMemory {
        RetrievedMemory {
            id: id.to_string(),
            label: Label::Fact,
            content: format!("memory {id}"),
            score,
            source,
            rel_type: if source == RetrievalSource::Graph { Some("PARTICIPATED_IN".into()) } else { None },
            entity: if source == RetrievalSource::Graph { Some("Ola".into()) } else { None },
            connections: Vec::new(),
        }
    }

    #[test]
    fn tokenize_handles_unicode_words() {
        assert_eq!(
            tokenize_words("alek znow mnie wkurwił!"),
            vec!["alek", "znow", "mnie", "wkurwił"]
        );
    }

    #[test]
    fn exact_token_match_wins_case_insensitively() {
        // The fuzzy-entity scenario: lowercase token, canonical "Alek".
        let persons = vec![
            person("p1", "Alek", &["Aleksander"], None),
            person("p2", "Ola", &["Olo"], None),
        ];
        let found = detect_entity("alek znow mnie wkurwil", None, &persons).unwrap();
        assert_eq!(found.id, "p1");
        assert_eq!(found.name, "Alek");
    }

    #[test]
    fn alias_token_matches_too() {
        let persons = vec![person("p1", "Alek", &["Aleksander"], None)];
        let found = detect_entity("co u aleksander slychac", None, &persons).unwrap();
        assert_eq!(found.id, "p1");
    }

    #[test]
    fn fuzzy_match_catches_typos() {
        let persons = vec![person("p1", "Aleksander", &[], None)];
        // One dropped char out of ten: ratio 0.9 ≥ 0.8.
        let found = detect_entity("rozmawialem z aleksnder wczoraj", None, &persons).unwrap();
        assert_eq!(found.id, "p1");
    }

    #[test]
    fn embedding_fallback_only_for_short_queries() {
        let emb = vec![1.0_f32, 0.0, 0.0];
        let persons = vec![person("p1", "Ola", &[], Some(vec![0.97, 0.05, 0.0]))];

        // Four tokens, none lexically close: fallback applies.
        let found = detect_entity("my best friend story", Some(&emb), &persons);
        assert_eq!(found.map(|e| e.id), Some("p1".to_string()));

        // Five tokens: the fallback is skipped.
        let found = detect_entity("my very best friend story", Some(&emb), &persons);
        assert!(found.is_none());
    }

    #[test]
    fn no_entity_in_unrelated_query() {
        let persons = vec![person("p1", "Alek", &[], None)];
        assert!(detect_entity("what is the weather today", None, &persons).is_none());
    }

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn overlap_takes_max_plus_bonus() {
        let vector = vec![hit("m1", 0.95, RetrievalSource::Semantic)];
        let structural = vec![hit("m1", 0.9, RetrievalSource::Graph)];
        let merged = merge_and_rank(vector, structural, 10);
        assert_eq!(merged.len(), 1);
        assert!((merged[0].score - 1.0).abs() < 1e-9);
        assert_eq!(merged[0].source, RetrievalSource::Graph);
        assert_eq!(merged[0].rel_type.as_deref(), Some("PARTICIPATED_IN"));
    }

    #[test]
    fn ties_prefer_graph_then_id() {
        let vector = vec![hit("b", 0.9, RetrievalSource::Semantic)];
        let structural = vec![hit("c", 0.9, RetrievalSource::Graph), hit("a", 0.9, RetrievalSource::Graph)];
        let merged = merge_and_rank(vector, structural, 10);
        let ids: Vec<&str> = merged.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
    }

    #[test]
    fn truncation_is_a_prefix_of_the_larger_ranking() {
        let vector = vec![
            hit("v1", 0.96, RetrievalSource::Semantic),
            hit("v2", 0.7, RetrievalSource::Semantic),
            hit("v3", 0.8, RetrievalSource::Semantic),
        ];
        let structural = vec![hit("s1", 0.9, RetrievalSource::Graph)];

        let top2 = merge_and_rank(vector.clone(), structural.clone(), 2);
        let top3 = merge_and_rank(vector, structural, 3);
        assert_eq!(top2.len(), 2);
        for (a, b) in top2.iter().zip(top3.iter()) {
            assert_eq!(a.id, b.id);
        }
    }

    #[test]
    fn structural_boost_puts_entity_memories_in_top_three() {
        // Two unrelated high-similarity facts plus two entity-linked events.
        let vector = vec![
            hit("f1", 0.93, RetrievalSource::Semantic),
            hit("f2", 0.92, RetrievalSource::Semantic),
        ];
        let structural = vec![
            hit("e1", 0.9, RetrievalSource::Graph),
            hit("e2", 0.9, RetrievalSource::Graph),
        ];
        let merged = merge_and_rank(vector, structural, 3);
        let has_entity_hit = merged
            .iter()
            .any(|m| m.source == RetrievalSource::Graph && m.score >= 0.9);
        assert!(has_entity_hit, "an entity-linked event must appear in the top 3");
    }

    #[test]
    fn annotation_prefixes() {
        let linked = hit("e1", 0.9, RetrievalSource::Graph);
        assert_eq!(linked.annotated(), "[PARTICIPATED_IN Ola] memory e1");

        let mut semantic = hit("f1", 0.8, RetrievalSource::Semantic);
        semantic.connections = vec!["Alek".into(), "Ola".into()];
        assert_eq!(semantic.annotated(), "[Alek, Ola] memory f1");

        let bare = hit("f2", 0.8, RetrievalSource::Semantic);
        assert_eq!(bare.annotated(), "memory f2");
    }
}
