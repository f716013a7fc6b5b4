//! Typed memory operations over the graph store.
//!
//! Every mutation of the knowledge graph goes through this API.  All writes
//! are idempotent on their merge keys, and Fact/Preference insertions are
//! duplicate-guarded: a new node whose embedding is close enough to an
//! existing one updates that node in place instead of creating a sibling.
//!
//! Lookup misses are not errors here — they come back as sentinel strings
//! ("No results", "... not found") so the turn engine can hand them to the
//! model verbatim as tool output.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use engram_llm::Embedder;
use neo4rs::query;

use crate::graph::{GraphResult, GraphStore, Label, embedding_param};
use crate::retrieval::{RetrievedMemory, Retriever};
use crate::schema::{Knows, MemoryNode, Mentions, ParticipatedIn, USER_NAME};

/// Cosine floor above which a new Fact/Preference collapses into an existing
/// node.
pub const DUPLICATE_THRESHOLD: f64 = 0.93;

/// Result of a similarity probe against existing nodes of one label.
#[derive(Debug, Clone, Default)]
pub struct DuplicateCheck {
    pub matched: bool,
    pub id: Option<String>,
    pub score: f64,
    pub content: Option<String>,
}

/// Whether `score` collapses the insertion into the matched node.
pub fn is_duplicate(score: f64) -> bool {
    score >= DUPLICATE_THRESHOLD
}

/// Outcome of a duplicate-guarded insert, distinguishing "created new" from
/// "updated existing".
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub updated_existing: bool,
    pub id: String,
    pub message: String,
}

pub struct MemoryApi {
    graph: Arc<GraphStore>,
    embedder: Arc<dyn Embedder>,
}

impl MemoryApi {
    pub fn new(graph: Arc<GraphStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self { graph, embedder }
    }

    pub fn graph(&self) -> &GraphStore {
        &self.graph
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    fn retriever(&self) -> Retriever<'_> {
        Retriever { graph: &self.graph, embedder: self.embedder.as_ref() }
    }

    /// Merge the singleton user node and return its element id.
    pub async fn ensure_user(&self) -> GraphResult<String> {
        self.graph
            .merge_node(Label::User, &[("name", json!(USER_NAME))], &[])
            .await
    }

    /// Embed and merge a typed node, returning its element id.
    pub async fn save_node(&self, node: &MemoryNode) -> GraphResult<String> {
        let embedding = self.embedder.embed(&node.embedding_text()).await?;
        let mut fields = node.fields();
        fields.push(("embedding", json!(embedding_param(&embedding))));
        self.graph.merge_node(node.label(), &node.merge_key(), &fields).await
    }

    /// Probe a label's vector index for a near-duplicate of `embedding`.
    pub async fn check_duplicate(
        &self,
        label: Label,
        embedding: &[f32],
    ) -> GraphResult<DuplicateCheck> {
        let hits = self.graph.query_vector(label, 1, embedding).await?;
        let Some(top) = hits.into_iter().next() else {
            return Ok(DuplicateCheck::default());
        };
        let content = crate::retrieval::render_node(label, &top.node);
        Ok(DuplicateCheck {
            matched: is_duplicate(top.score),
            id: Some(top.id),
            score: top.score,
            content: Some(content),
        })
    }

    // ── Persons & relationships ──────────────────────────────────────────────

    /// Merge a person and optionally their relationship to the user.
    pub async fn add_or_update_person(
        &self,
        name: &str,
        description: Option<&str>,
        relation_type: Option<&str>,
        sentiment: Option<&str>,
    ) -> GraphResult<String> {
        let node = MemoryNode::Person {
            name: name.to_string(),
            description: description.unwrap_or_default().to_string(),
        };
        let person_id = self.save_node(&node).await?;

        if let Some(relation_type) = relation_type {
            let user_id = self.ensure_user().await?;
            let knows = Knows {
                relation_type: relation_type.to_string(),
                sentiment: sentiment.map(ToString::to_string),
                since: Some(today()),
            };
            self.graph.upsert_edge(&user_id, "KNOWS", &person_id, &knows.props()).await?;
        }

        let rel = match (relation_type, sentiment) {
            (Some(r), Some(s)) => format!(" | {r} ({s})"),
            (Some(r), None) => format!(" | {r}"),
            _ => String::new(),
        };
        info!(name, "person merged");
        Ok(format!("Person added: {name}{rel}"))
    }

    /// Merge a Person-KNOWS->Person edge between two existing people.
    pub async fn add_or_update_relationship(
        &self,
        start_person: &str,
        end_person: &str,
        relation_type: &str,
        sentiment: Option<&str>,
    ) -> GraphResult<String> {
        let Some(start_id) = self.person_id_by_name(start_person).await? else {
            return Ok(format!("Person not found: {start_person}"));
        };
        let Some(end_id) = self.person_id_by_name(end_person).await? else {
            return Ok(format!("Person not found: {end_person}"));
        };
        let knows = Knows {
            relation_type: relation_type.to_string(),
            sentiment: sentiment.map(ToString::to_string),
            since: None,
        };
        self.graph.upsert_edge(&start_id, "KNOWS", &end_id, &knows.props()).await?;
        Ok(format!("Relationship: {start_person} -[{relation_type}]-> {end_person}"))
    }

    async fn person_id_by_name(&self, name: &str) -> GraphResult<Option<String>> {
        let row = self
            .graph
            .fetch_one(
                query("MATCH (p:Person {name: $name}) RETURN elementId(p) AS id")
                    .param("name", name),
            )
            .await?;
        Ok(row.and_then(|r| r.get::<String>("id").ok()))
    }

    /// Resolve a name to a stable person identity (see [`crate::canonical`]).
    pub async fn canonicalize(&self, name: &str) -> GraphResult<String> {
        crate::canonical::canonicalize(&self.graph, self.embedder.as_ref(), name).await
    }

    pub async fn list_people(&self) -> GraphResult<Vec<crate::canonical::PersonRef>> {
        crate::canonical::load_people(&self.graph).await
    }

    // ── Events ───────────────────────────────────────────────────────────────

    /// Create an event with participant and mention edges.  Participants that
    /// don't exist yet are skipped (the model is instructed to add persons
    /// first).
    pub async fn add_event(
        &self,
        description: &str,
        participants: &[String],
        mentioned: &[String],
        date: Option<&str>,
    ) -> GraphResult<String> {
        let date = date.map(ToString::to_string).unwrap_or_else(today);
        let node = MemoryNode::Event { description: description.to_string(), date };
        let event_id = self.save_node(&node).await?;

        for name in participants {
            match self.person_id_by_name(name).await? {
                Some(person_id) => {
                    let props = ParticipatedIn::default();
                    self.graph
                        .upsert_edge(&person_id, "PARTICIPATED_IN", &event_id, &[("role", json!(props.role))])
                        .await?;
                }
                None => warn!(name, "participant unknown, edge skipped"),
            }
        }
        for name in mentioned {
            match self.person_id_by_name(name).await? {
                Some(person_id) => {
                    let props = Mentions::default();
                    self.graph
                        .upsert_edge(&event_id, "MENTIONS", &person_id, &[("sentiment", json!(props.sentiment))])
                        .await?;
                }
                None => warn!(name, "mentioned person unknown, edge skipped"),
            }
        }
        Ok(format!("Event added: {description}"))
    }

    // ── Facts & preferences (duplicate-guarded) ──────────────────────────────

    pub async fn add_fact(&self, content: &str, category: &str) -> GraphResult<UpsertOutcome> {
        let node = MemoryNode::Fact {
            content: content.to_string(),
            category: category.to_string(),
        };
        let embedding = self.embedder.embed(&node.embedding_text()).await?;
        let check = self.check_duplicate(Label::Fact, &embedding).await?;

        if check.matched {
            let id = check.id.expect("matched check carries an id");
            self.graph
                .run(
                    query(
                        "MATCH (f:Fact) WHERE elementId(f) = $id \
                         SET f.content = $content, f.category = $category, f.embedding = $embedding",
                    )
                    .param("id", id.as_str())
                    .param("content", content)
                    .param("category", category)
                    .param("embedding", embedding_param(&embedding)),
                )
                .await?;
            info!(score = check.score, "fact collapsed into existing node");
            return Ok(UpsertOutcome {
                updated_existing: true,
                message: format!("Fact updated (existing similar memory): {content}"),
                id,
            });
        }

        let mut fields = node.fields();
        fields.push(("embedding", json!(embedding_param(&embedding))));
        let fact_id = self.graph.merge_node(Label::Fact, &node.merge_key(), &fields).await?;
        let user_id = self.ensure_user().await?;
        self.graph.upsert_edge(&user_id, "HAS_FACT", &fact_id, &[]).await?;
        Ok(UpsertOutcome {
            updated_existing: false,
            id: fact_id,
            message: format!("Fact added: {content}"),
        })
    }

    pub async fn add_preference(&self, instruction: &str) -> GraphResult<UpsertOutcome> {
        let node = MemoryNode::Preference { instruction: instruction.to_string() };
        let embedding = self.embedder.embed(&node.embedding_text()).await?;
        let check = self.check_duplicate(Label::Preference, &embedding).await?;

        if check.matched {
            let id = check.id.expect("matched check carries an id");
            self.graph
                .run(
                    query(
                        "MATCH (p:Preference) WHERE elementId(p) = $id \
                         SET p.instruction = $instruction, p.embedding = $embedding",
                    )
                    .param("id", id.as_str())
                    .param("instruction", instruction)
                    .param("embedding", embedding_param(&embedding)),
                )
                .await?;
            return Ok(UpsertOutcome {
                updated_existing: true,
                message: format!("Preference updated (existing similar memory): {instruction}"),
                id,
            });
        }

        let mut fields = node.fields();
        fields.push(("embedding", json!(embedding_param(&embedding))));
        let pref_id = self.graph.merge_node(Label::Preference, &node.merge_key(), &fields).await?;
        let user_id = self.ensure_user().await?;
        self.graph.upsert_edge(&user_id, "HAS_PREFERENCE", &pref_id, &[]).await?;
        Ok(UpsertOutcome {
            updated_existing: false,
            id: pref_id,
            message: format!("Preference added: {instruction}"),
        })
    }

    /// Update an existing fact or preference by id, recomputing its embedding.
    pub async fn update_fact_or_preference(&self, id: &str, new_value: &str) -> GraphResult<String> {
        let fact_row = self
            .graph
            .fetch_one(
                query("MATCH (f:Fact) WHERE elementId(f) = $id RETURN f.category AS category")
                    .param("id", id),
            )
            .await?;
        if let Some(row) = fact_row {
            let category: String = row.get("category").unwrap_or_default();
            let node = MemoryNode::Fact { content: new_value.to_string(), category };
            let embedding = self.embedder.embed(&node.embedding_text()).await?;
            self.graph
                .run(
                    query(
                        "MATCH (f:Fact) WHERE elementId(f) = $id \
                         SET f.content = $content, f.embedding = $embedding",
                    )
                    .param("id", id)
                    .param("content", new_value)
                    .param("embedding", embedding_param(&embedding)),
                )
                .await?;
            return Ok(format!("Fact updated: {new_value}"));
        }

        let pref_row = self
            .graph
            .fetch_one(
                query("MATCH (p:Preference) WHERE elementId(p) = $id RETURN elementId(p) AS id")
                    .param("id", id),
            )
            .await?;
        if pref_row.is_some() {
            let embedding = self.embedder.embed(new_value).await?;
            self.graph
                .run(
                    query(
                        "MATCH (p:Preference) WHERE elementId(p) = $id \
                         SET p.instruction = $instruction, p.embedding = $embedding",
                    )
                    .param("id", id)
                    .param("instruction", new_value)
                    .param("embedding", embedding_param(&embedding)),
                )
                .await?;
            return Ok(format!("Preference updated: {new_value}"));
        }

        Ok("Memory not found".to_string())
    }

    /// Detach-delete any memory node by id.
    pub async fn delete_memory(&self, id: &str) -> GraphResult<String> {
        if self.graph.delete_by_id(id).await? {
            Ok("Memory deleted".to_string())
        } else {
            Ok("Memory not found".to_string())
        }
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    pub async fn get_user_preferences(&self) -> GraphResult<String> {
        let rows = self
            .graph
            .fetch(query(
                "MATCH (u:User)-[:HAS_PREFERENCE]->(p:Preference) \
                 RETURN p.instruction AS instruction",
            ))
            .await?;
        let prefs: Vec<String> = rows
            .into_iter()
            .filter_map(|row| row.get::<String>("instruction").ok())
            .collect();
        if prefs.is_empty() {
            Ok("No preferences".to_string())
        } else {
            Ok(prefs.iter().map(|p| format!("- {p}")).collect::<Vec<_>>().join("\n"))
        }
    }

    pub async fn check_relationship(&self, person_name: &str) -> GraphResult<String> {
        let row = self
            .graph
            .fetch_one(
                query(
                    "MATCH (u:User)-[r:KNOWS]->(p:Person {name: $name}) \
                     OPTIONAL MATCH (p)-[:PARTICIPATED_IN]->(e:Event) \
                     RETURN r.relation_type AS relation, r.sentiment AS sentiment, \
                            r.since AS since, collect(e.description) AS events",
                )
                .param("name", person_name),
            )
            .await?;
        let Some(row) = row else {
            return Ok(format!("No relationship with {person_name}"));
        };
        let relation: String = row.get("relation").unwrap_or_default();
        let sentiment: String = row.get("sentiment").unwrap_or_default();
        let since: String = row.get("since").unwrap_or_default();
        let events: Vec<String> = row.get("events").unwrap_or_default();

        let mut output = format!("{relation} | {sentiment} | since: {since}");
        let events: Vec<&String> = events.iter().filter(|e| !e.is_empty()).collect();
        if !events.is_empty() {
            output.push_str("\nEvents:\n");
            output.push_str(
                &events.iter().map(|e| format!("  - {e}")).collect::<Vec<_>>().join("\n"),
            );
        }
        Ok(output)
    }

    /// Hybrid context retrieval formatted for tool output.
    ///
    /// With explicit `entity_names` the lookup is a direct subgraph read;
    /// otherwise the full hybrid ranking runs (see [`crate::retrieval`]).
    pub async fn retrieve_context(
        &self,
        query_text: &str,
        entity_names: &[String],
        node_labels: &[Label],
        limit: usize,
        min_similarity: f64,
    ) -> GraphResult<String> {
        if !entity_names.is_empty() {
            return self.entity_context(entity_names).await;
        }
        let memories = self
            .retriever()
            .retrieve(query_text, node_labels, limit, min_similarity)
            .await?;
        if memories.is_empty() {
            return Ok("No results".to_string());
        }
        Ok(memories.iter().map(|m| m.annotated()).collect::<Vec<_>>().join("\n"))
    }

    /// Structured hybrid retrieval for prompt assembly.
    pub async fn retrieve_memories(
        &self,
        query_text: &str,
        limit: usize,
        min_similarity: f64,
    ) -> GraphResult<Vec<RetrievedMemory>> {
        self.retriever().retrieve(query_text, &[], limit, min_similarity).await
    }

    async fn entity_context(&self, entity_names: &[String]) -> GraphResult<String> {
        let rows = self
            .graph
            .fetch(
                query(
                    "MATCH (p:Person) WHERE p.name IN $names \
                     OPTIONAL MATCH (u:User)-[k:KNOWS]->(p) \
                     OPTIONAL MATCH (p)-[:PARTICIPATED_IN]->(e:Event) \
                     RETURN p.name AS name, p.description AS description, \
                            k.relation_type AS relation, k.sentiment AS sentiment, \
                            collect(DISTINCT e.description) AS events, elementId(p) AS id",
                )
                .param("names", entity_names.to_vec()),
            )
            .await?;

        let mut output = Vec::new();
        for row in rows {
            let name: String = row.get("name").unwrap_or_default();
            let description: String = row.get("description").unwrap_or_default();
            let relation: Option<String> = row.get("relation").ok();
            let sentiment: Option<String> = row.get("sentiment").ok();
            let events: Vec<String> = row.get("events").unwrap_or_default();
            let id: String = row.get("id").unwrap_or_default();

            let mut line = if description.is_empty() {
                name.clone()
            } else {
                format!("{name}: {description}")
            };
            if let (Some(relation), Some(sentiment)) = (relation, sentiment) {
                line.push_str(&format!(" [{relation}, {sentiment}]"));
            }
            line.push_str(&format!(" [ID: {id}]"));
            output.push(line);
            for event in events.iter().filter(|e| !e.is_empty()) {
                output.push(format!("  → {event}"));
            }
        }
        if output.is_empty() {
            Ok("No results".to_string())
        } else {
            Ok(output.join("\n"))
        }
    }
}

/// Today's date in ISO form, the default for new events and relationships.
pub fn today() -> String {
    chrono::Local::now().date_naive().to_string()
}

// ── Tests ────────────────────────────────────────────────────────────────────
