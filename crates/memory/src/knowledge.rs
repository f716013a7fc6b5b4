//! Knowledge-base chunks — scoped document fragments with their own vector
//! search, separate from the conversational memory labels.
//!
//! Document ingestion (uploads, URL fetch, PDF partitioning) happens outside
//! this crate; what lives here is the chunker, chunk persistence keyed on
//! `(document_id, chunk_index)`, and scope-filtered similarity search.

use serde_json::json;
use tracing::info;

use engram_llm::Embedder;
use neo4rs::query;

use crate::api::MemoryApi;
use crate::graph::{GraphResult, GraphStore, Label, embedding_param};
use crate::schema::{MemoryNode, normalize_tags};

/// Target chunk size in characters.
pub const CHUNK_SIZE: usize = 800;
/// Overlap carried between consecutive chunks.
pub const CHUNK_OVERLAP: usize = 100;

/// Document kinds accepted by the knowledge base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocType {
    Text,
    Pdf,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Text => "text",
            DocType::Pdf => "pdf",
        }
    }
}

// ── Chunking ─────────────────────────────────────────────────────────────────

/// Split text into overlapping chunks, preferring sentence boundaries.
///
/// The split point is searched in a window around the target size; when a
/// sentence ending (`. `, `? `, `! `, newline) is found there, the chunk ends
/// on it.  Consecutive chunks overlap by [`CHUNK_OVERLAP`] characters.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = normalize_whitespace(text).chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    if chars.len() <= chunk_size {
        return vec![chars.iter().collect::<String>().trim().to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < chars.len() {
        let mut end = start + chunk_size;
        if end >= chars.len() {
            let tail: String = chars[start..].iter().collect();
            let tail = tail.trim().to_string();
            if !tail.is_empty() {
                chunks.push(tail);
            }
            break;
        }

        // Look for a sentence boundary near the target end.
        let search_start = (start + chunk_size).saturating_sub(100).max(start);
        let search_end = (start + chunk_size + 50).min(chars.len());
        if let Some(boundary) = find_sentence_break(&chars[search_start..search_end]) {
            let candidate = search_start + boundary;
            if candidate > start {
                end = candidate;
            }
        }

        let chunk: String = chars[start..end].iter().collect();
        let chunk = chunk.trim().to_string();
        if !chunk.is_empty() {
            chunks.push(chunk);
        }
        start = end.saturating_sub(overlap);
    }
    chunks
}

/// Index just past the last sentence ending within `window`, if any.
fn find_sentence_break(window: &[char]) -> Option<usize> {
    for pattern in [&['.', ' '][..], &['?', ' '], &['!', ' '], &['\n']] {
        let plen = pattern.len();
        if window.len() < plen {
            continue;
        }
        for i in (0..=window.len() - plen).rev() {
            if window[i..i + plen] == *pattern {
                return Some(i + plen);
            }
        }
    }
    None
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Persistence & search ─────────────────────────────────────────────────────

/// One chunk ready for persistence.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub document_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub summary: String,
    pub tags: Vec<String>,
    pub scope: String,
}

/// One search hit, formatted for tool output by [`format_chunks`].
#[derive(Debug, Clone)]
pub struct ChunkHit {
    pub content: String,
    pub summary: String,
    pub tags: Vec<String>,
    pub source: String,
    pub score: f64,
}

pub struct KnowledgeStore<'a> {
    pub api: &'a MemoryApi,
}

impl KnowledgeStore<'_> {
    fn graph(&self) -> &GraphStore {
        self.api.graph()
    }

    fn embedder(&self) -> &dyn Embedder {
        self.api.embedder()
    }

    /// Upsert one chunk; the merge key is `(document_id, chunk_index)` so
    /// re-ingesting a document is idempotent.
    pub async fn save_chunk(&self, record: &ChunkRecord) -> GraphResult<String> {
        let node = MemoryNode::KnowledgeChunk {
            document_id: record.document_id.clone(),
            chunk_index: record.chunk_index,
            content: record.content.clone(),
            summary: record.summary.clone(),
            tags: normalize_tags(&record.tags),
            scope: record.scope.clone(),
        };
        let embedding = self.embedder().embed(&node.embedding_text()).await?;
        let mut fields = node.fields();
        fields.push(("embedding", json!(embedding_param(&embedding))));
        self.graph().merge_node(Label::KnowledgeChunk, &node.merge_key(), &fields).await
    }

    /// Upsert the owning document record and its `HAS_CHUNK` edges.
    pub async fn save_document(
        &self,
        document_id: &str,
        filename: &str,
        doc_type: DocType,
        chunk_count: usize,
        created_at: &str,
    ) -> GraphResult<String> {
        let doc_id = self
            .graph()
            .merge_node(
                Label::KnowledgeDocument,
                &[("id", json!(document_id))],
                &[
                    ("filename", json!(filename)),
                    ("doc_type", json!(doc_type.as_str())),
                    ("chunk_count", json!(chunk_count as i64)),
                    ("created_at", json!(created_at)),
                ],
            )
            .await?;
        self.graph()
            .run(
                query(
                    "MATCH (d:KnowledgeDocument {id: $id}) \
                     MATCH (c:KnowledgeChunk {document_id: $id}) \
                     MERGE (d)-[:HAS_CHUNK]->(c)",
                )
                .param("id", document_id),
            )
            .await?;
        info!(document_id, chunk_count, "knowledge document saved");
        Ok(doc_id)
    }

    /// Scope-filtered vector search over chunks.  Over-fetches 2× before the
    /// scope/threshold filter so a crowded index doesn't starve the scope.
    pub async fn search(
        &self,
        scope: &str,
        query_text: &str,
        limit: usize,
        threshold: f64,
    ) -> GraphResult<Vec<ChunkHit>> {
        let embedding = self.embedder().embed(query_text).await?;
        let rows = self
            .graph()
            .fetch(
                query(
                    "CALL db.index.vector.queryNodes($index, $k, $embedding) \
                     YIELD node, score \
                     WHERE node.scope = $scope AND score >= $threshold \
                     MATCH (d:KnowledgeDocument {id: node.document_id}) \
                     RETURN node, score, d.filename AS source \
                     ORDER BY score DESC \
                     LIMIT $limit",
                )
                .param("index", Label::KnowledgeChunk.vector_index())
                .param("k", (limit * 2) as i64)
                .param("embedding", embedding_param(&embedding))
                .param("scope", scope)
                .param("threshold", threshold)
                .param("limit", limit as i64),
            )
            .await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            let node: neo4rs::Node = match row.get("node") {
                Ok(n) => n,
                Err(_) => continue,
            };
            hits.push(ChunkHit {
                content: crate::graph::node_string_or_empty(&node, "content"),
                summary: crate::graph::node_string_or_empty(&node, "summary"),
                tags: crate::graph::node_string_list(&node, "tags"),
                source: row.get("source").unwrap_or_default(),
                score: row.get("score").unwrap_or(0.0),
            });
        }
        Ok(hits)
    }
}

/// Render search hits the way the knowledge tool reports them.
pub fn format_chunks(hits: &[ChunkHit], max_content_chars: usize) -> String {
    if hits.is_empty() {
        return "No relevant knowledge found.".to_string();
    }
    hits.iter()
        .map(|hit| {
            let mut entry = format!("[{}] (sim: {:.2})", hit.source, hit.score);
            if !hit.summary.is_empty() {
                entry.push_str(&format!("\nSummary: {}", hit.summary));
            }
            if !hit.tags.is_empty() {
                entry.push_str(&format!("\nTags: {}", hit.tags.join(", ")));
            }
            let content: String = hit.content.chars().take(max_content_chars).collect();
            entry.push_str(&format!("\nContent: {content}"));
            entry
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = chunk_text("just a short note", CHUNK_SIZE, CHUNK_OVERLAP);
        assert_eq!(chunks, vec!["just a short note".to_string()]);
    }

    #[test]
    fn empty_text_yields_nothing() {
        assert!(chunk_text("", CHUNK_SIZE, CHUNK_OVERLAP).is_empty());
        assert!(chunk_text("   \n\t ", CHUNK_SIZE, CHUNK_OVERLAP).is_empty());
    }

    #[test]
    fn long_text_chunks_overlap() {
        let sentence = "The quick brown fox jumps over the lazy dog. ";
        let text = sentence.repeat(60); // ~2700 chars
        let chunks = chunk_text(&text, CHUNK_SIZE, CHUNK_OVERLAP);
        assert!(chunks.len() >= 3);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= CHUNK_SIZE + 50);
        }
        // The overlap means the tail of chunk N reappears near the head of N+1.
        let tail: String = chunks[0].chars().rev().take(40).collect::<String>().chars().rev().collect();
        assert!(chunks[1].contains(tail.trim()));
    }

    #[test]
    fn chunks_prefer_sentence_boundaries() {
        let sentence = "Alpha beta gamma delta epsilon zeta eta theta. ";
        let text = sentence.repeat(40);
        let chunks = chunk_text(&text, CHUNK_SIZE, CHUNK_OVERLAP);
        // Every non-final chunk should end on a sentence terminator.
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(
                chunk.ends_with('.'),
                "chunk should end at a sentence boundary: …{}",
                &chunk[chunk.len().saturating_sub(20)..]
            );
        }
    }

    #[test]
    fn whitespace_is_normalized_before_chunking() {
        let chunks = chunk_text("a\n\n  b\t\tc", CHUNK_SIZE, CHUNK_OVERLAP);
        assert_eq!(chunks, vec!["a b c".to_string()]);
    }

    #[test]
    fn format_chunks_includes_source_and_score() {
        let hits = vec![ChunkHit {
            content: "Rust ownership rules".into(),
            summary: "Ownership basics".into(),
            tags: vec!["definition".into()],
            source: "rust-book.pdf".into(),
            score: 0.83,
        }];
        let rendered = format_chunks(&hits, 600);
        assert!(rendered.contains("[rust-book.pdf] (sim: 0.83)"));
        assert!(rendered.contains("Summary: Ownership basics"));
        assert!(rendered.contains("Tags: definition"));
        assert!(rendered.contains("Content: Rust ownership rules"));
    }

    #[test]
    fn format_chunks_empty_is_sentinel() {
        assert_eq!(format_chunks(&[], 600), "No relevant knowledge found.");
    }
}
