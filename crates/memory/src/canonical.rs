//! Entity canonicalization — mapping alternate spellings to one stable
//! Person identity.
//!
//! Resolution order: exact name or alias match, then an embedding scan over
//! all persons gated by the acceptance heuristic, then creation.  When the
//! embedding backend is down only the exact pass runs; we never guess an
//! alias without a vector.

use serde_json::json;
use tracing::{debug, info, warn};

use engram_llm::Embedder;
use neo4rs::query;

use crate::graph::{GraphError, GraphResult, GraphStore, Label, embedding_param, node_embedding, node_string_list, node_string_or_empty};
use crate::retrieval::cosine_similarity;

/// Minimum cosine similarity for accepting a name as an alias of an existing
/// person.
const ALIAS_SIMILARITY: f32 = 0.85;

/// Maximum length difference (in chars) between a name and its candidate
/// canonical form.
const ALIAS_MAX_LEN_DIFF: usize = 6;

// ── Read model ───────────────────────────────────────────────────────────────

/// Compact person projection used by canonicalization and entity detection.
#[derive(Debug, Clone)]
pub struct PersonRef {
    pub id: String,
    pub name: String,
    pub aliases: Vec<String>,
    pub embedding: Option<Vec<f32>>,
}

/// Load every person with name, aliases, and embedding.
pub async fn load_people(graph: &GraphStore) -> GraphResult<Vec<PersonRef>> {
    let rows = graph
        .fetch(query(
            "MATCH (p:Person) \
             RETURN elementId(p) AS id, p AS node",
        ))
        .await?;
    let mut people = Vec::with_capacity(rows.len());
    for row in rows {
        let id: String = row
            .get("id")
            .map_err(|e| GraphError::Validation(format!("person row missing id: {e}")))?;
        let node: neo4rs::Node = row
            .get("node")
            .map_err(|e| GraphError::Validation(format!("person row missing node: {e}")))?;
        people.push(PersonRef {
            id,
            name: node_string_or_empty(&node, "name"),
            aliases: node_string_list(&node, "aliases"),
            embedding: node_embedding(&node),
        });
    }
    Ok(people)
}

// ── Acceptance heuristic ─────────────────────────────────────────────────────

/// Accept `candidate` as an alias of `canonical` iff the embedding similarity
/// clears the floor, the first letters agree case-insensitively, and the
/// lengths are within six characters of each other.
pub fn alias_accept(similarity: f32, candidate: &str, canonical: &str) -> bool {
    if similarity < ALIAS_SIMILARITY {
        return false;
    }
    let (Some(a), Some(b)) = (candidate.chars().next(), canonical.chars().next()) else {
        return false;
    };
    if !a.to_lowercase().eq(b.to_lowercase()) {
        return false;
    }
    let len_a = candidate.chars().count();
    let len_b = canonical.chars().count();
    len_a.abs_diff(len_b) <= ALIAS_MAX_LEN_DIFF
}

// ── Canonicalization ─────────────────────────────────────────────────────────

/// Resolve `name` to a stable person element id, creating the person when no
/// existing identity matches.
pub async fn canonicalize(
    graph: &GraphStore,
    embedder: &dyn Embedder,
    name: &str,
) -> GraphResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(GraphError::Validation("person name must not be empty".into()));
    }

    // 1. Exact match on canonical name or alias membership.
    if let Some(row) = graph
        .fetch_one(
            query(
                "MATCH (p:Person) WHERE p.name = $name OR $name IN p.aliases \
                 RETURN elementId(p) AS id",
            )
            .param("name", name),
        )
        .await?
    {
        let id: String = row
            .get("id")
            .map_err(|e| GraphError::Validation(format!("exact match missing id: {e}")))?;
        debug!(name, %id, "canonicalized by exact match");
        return Ok(id);
    }

    // 2. Embedding scan.  When the embedder is down we stop here and create
    //    the person without a vector rather than alias-matching blind.
    let name_emb = match embedder.embed(name).await {
        Ok(vector) => Some(vector),
        Err(err) => {
            warn!(name, %err, "embedding unavailable, skipping alias scan");
            None
        }
    };

    if let Some(ref name_emb) = name_emb {
        let people = load_people(graph).await?;
        let mut best: Option<(&PersonRef, f32)> = None;
        for person in &people {
            let Some(ref person_emb) = person.embedding else { continue };
            let similarity = cosine_similarity(name_emb, person_emb);
            if alias_accept(similarity, name, &person.name)
                && best.map(|(_, s)| similarity > s).unwrap_or(true)
            {
                best = Some((person, similarity));
            }
        }
        if let Some((person, similarity)) = best {
            graph
                .run(
                    query(
                        "MATCH (p:Person) WHERE elementId(p) = $id \
                         SET p.aliases = coalesce(p.aliases, []) + $name",
                    )
                    .param("id", person.id.as_str())
                    .param("name", name),
                )
                .await?;
            info!(name, canonical = %person.name, similarity, "appended alias to existing person");
            return Ok(person.id.clone());
        }
    }

    // 3. New identity.
    let mut fields = vec![("aliases", json!(Vec::<String>::new()))];
    if let Some(emb) = name_emb {
        fields.push(("embedding", json!(embedding_param(&emb))));
    }
    let id = graph
        .merge_node(Label::Person, &[("name", json!(name))], &fields)
        .await?;
    info!(name, %id, "created new person");
    Ok(id)
}

// ── Tests ────────────────────────────────────────────────────────────────────
