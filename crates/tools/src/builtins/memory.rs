//! The memory API wrapped as tools.
//!
//! Output strings (including the "not found" sentinels) come straight from
//! `engram_memory::MemoryApi` — the engine forwards them to the model
//! verbatim.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use engram_memory::{Label, MemoryApi};

use crate::{
    ParamKind, Tool, ToolCategory, ToolParam, ToolRegistry, ToolSpec, arg_str, arg_string_list,
    arg_usize, required_str,
};

// ── retrieve_context ─────────────────────────────────────────────────────────

struct RetrieveContextTool {
    api: Arc<MemoryApi>,
    min_similarity: f64,
}

#[async_trait]
impl Tool for RetrieveContextTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "retrieve_context".to_string(),
            description: "Search memories by query or entity names. Returns people, events, facts."
                .to_string(),
            category: ToolCategory::Memory,
            params: vec![
                ToolParam::required("query", "What to search for"),
                ToolParam::optional("entity_names", "Exact person names to look up directly")
                    .kind(ParamKind::StringArray),
                ToolParam::optional("node_labels", "Restrict to labels: Person, Event, Fact, Preference")
                    .kind(ParamKind::StringArray),
                ToolParam::optional("limit", "Maximum results (default 5)").kind(ParamKind::Integer),
            ],
        }
    }

    async fn run(&self, args: &Value) -> Result<String> {
        let query = required_str(args, "query")?;
        let entity_names = arg_string_list(args, "entity_names");
        let labels: Vec<Label> = arg_string_list(args, "node_labels")
            .iter()
            .filter_map(|name| Label::parse(name))
            .collect();
        let limit = arg_usize(args, "limit", 5);
        Ok(self
            .api
            .retrieve_context(query, &entity_names, &labels, limit, self.min_similarity)
            .await?)
    }
}

// ── get_user_preferences ─────────────────────────────────────────────────────

struct GetUserPreferencesTool {
    api: Arc<MemoryApi>,
}

#[async_trait]
impl Tool for GetUserPreferencesTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "get_user_preferences".to_string(),
            description: "Get user preferences for AI behavior.".to_string(),
            category: ToolCategory::Memory,
            params: vec![],
        }
    }

    async fn run(&self, _args: &Value) -> Result<String> {
        Ok(self.api.get_user_preferences().await?)
    }
}

// ── check_relationship ───────────────────────────────────────────────────────

struct CheckRelationshipTool {
    api: Arc<MemoryApi>,
}

#[async_trait]
impl Tool for CheckRelationshipTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "check_relationship".to_string(),
            description: "Check the relationship between the user and a person.".to_string(),
            category: ToolCategory::Memory,
            params: vec![ToolParam::required("person_name", "Canonical name of the person")],
        }
    }

    async fn run(&self, args: &Value) -> Result<String> {
        let name = required_str(args, "person_name")?;
        Ok(self.api.check_relationship(name).await?)
    }
}

// ── add_or_update_person ─────────────────────────────────────────────────────

struct AddOrUpdatePersonTool {
    api: Arc<MemoryApi>,
}

#[async_trait]
impl Tool for AddOrUpdatePersonTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "add_or_update_person".to_string(),
            description: "Add or update a person and their relationship with the user.".to_string(),
            category: ToolCategory::Memory,
            params: vec![
                ToolParam::required("name", "Person's name"),
                ToolParam::optional("description", "Dynamic bio, e.g. 'childhood friend, very protective'"),
                ToolParam::optional("relation_type", "e.g. 'friend', 'colleague', 'family'"),
                ToolParam::optional("sentiment", "positive, negative, neutral, or complicated"),
            ],
        }
    }

    async fn run(&self, args: &Value) -> Result<String> {
        let name = required_str(args, "name")?;
        Ok(self
            .api
            .add_or_update_person(
                name,
                arg_str(args, "description"),
                arg_str(args, "relation_type"),
                arg_str(args, "sentiment"),
            )
            .await?)
    }
}

// ── add_event ────────────────────────────────────────────────────────────────

struct AddEventTool {
    api: Arc<MemoryApi>,
}

#[async_trait]
impl Tool for AddEventTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "add_event".to_string(),
            description: "Add an event with participants. Add persons first with \
                          add_or_update_person."
                .to_string(),
            category: ToolCategory::Memory,
            params: vec![
                ToolParam::required("description", "What happened"),
                ToolParam::required("participants", "People who took part")
                    .kind(ParamKind::StringArray),
                ToolParam::optional("mentioned_people", "People talked about")
                    .kind(ParamKind::StringArray),
                ToolParam::optional("date", "ISO date; defaults to today"),
            ],
        }
    }

    async fn run(&self, args: &Value) -> Result<String> {
        let description = required_str(args, "description")?;
        let participants = arg_string_list(args, "participants");
        let mentioned = arg_string_list(args, "mentioned_people");
        Ok(self
            .api
            .add_event(description, &participants, &mentioned, arg_str(args, "date"))
            .await?)
    }
}

// ── add_fact ─────────────────────────────────────────────────────────────────

struct AddFactTool {
    api: Arc<MemoryApi>,
}

#[async_trait]
impl Tool for AddFactTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "add_fact".to_string(),
            description: "Add a fact about the user.".to_string(),
            category: ToolCategory::Memory,
            params: vec![
                ToolParam::required("content", "The fact, e.g. 'Owns a white Mazda'"),
                ToolParam::required("category", "e.g. 'possession', 'habit', 'location', 'medical'"),
            ],
        }
    }

    async fn run(&self, args: &Value) -> Result<String> {
        let content = required_str(args, "content")?;
        let category = required_str(args, "category")?;
        Ok(self.api.add_fact(content, category).await?.message)
    }
}

// ── add_preference ───────────────────────────────────────────────────────────

struct AddPreferenceTool {
    api: Arc<MemoryApi>,
}

#[async_trait]
impl Tool for AddPreferenceTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "add_preference".to_string(),
            description: "Add a user preference for AI behavior.".to_string(),
            category: ToolCategory::Memory,
            params: vec![ToolParam::required("instruction", "The preference instruction")],
        }
    }

    async fn run(&self, args: &Value) -> Result<String> {
        let instruction = required_str(args, "instruction")?;
        Ok(self.api.add_preference(instruction).await?.message)
    }
}

// ── add_or_update_relationship ───────────────────────────────────────────────

struct AddOrUpdateRelationshipTool {
    api: Arc<MemoryApi>,
}

#[async_trait]
impl Tool for AddOrUpdateRelationshipTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "add_or_update_relationship".to_string(),
            description: "Add or update a relationship between two people.".to_string(),
            category: ToolCategory::Memory,
            params: vec![
                ToolParam::required("start_person", "Name of the first person"),
                ToolParam::required("end_person", "Name of the second person"),
                ToolParam::required("relation_type", "e.g. 'friend', 'ex-girlfriend', 'colleague'"),
                ToolParam::optional("sentiment", "positive, negative, neutral, or complicated"),
            ],
        }
    }

    async fn run(&self, args: &Value) -> Result<String> {
        Ok(self
            .api
            .add_or_update_relationship(
                required_str(args, "start_person")?,
                required_str(args, "end_person")?,
                required_str(args, "relation_type")?,
                arg_str(args, "sentiment"),
            )
            .await?)
    }
}

// ── update_fact_or_preference ────────────────────────────────────────────────

struct UpdateFactOrPreferenceTool {
    api: Arc<MemoryApi>,
}

#[async_trait]
impl Tool for UpdateFactOrPreferenceTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "update_fact_or_preference".to_string(),
            description: "Update an existing fact or preference using its ID.".to_string(),
            category: ToolCategory::Memory,
            params: vec![
                ToolParam::required("item_id", "ID of the memory to update"),
                ToolParam::required("new_value", "Replacement text"),
            ],
        }
    }

    async fn run(&self, args: &Value) -> Result<String> {
        Ok(self
            .api
            .update_fact_or_preference(required_str(args, "item_id")?, required_str(args, "new_value")?)
            .await?)
    }
}

// ── delete_memory ────────────────────────────────────────────────────────────

struct DeleteMemoryTool {
    api: Arc<MemoryApi>,
}

#[async_trait]
impl Tool for DeleteMemoryTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "delete_memory".to_string(),
            description: "Delete a memory (fact, preference, person, or event) by its ID."
                .to_string(),
            category: ToolCategory::Memory,
            params: vec![ToolParam::required("item_id", "ID of the memory to delete")],
        }
    }

    async fn run(&self, args: &Value) -> Result<String> {
        Ok(self.api.delete_memory(required_str(args, "item_id")?).await?)
    }
}

// ── Registration ─────────────────────────────────────────────────────────────

/// Register the full memory tool set.
pub fn register_memory_tools(registry: &mut ToolRegistry, api: Arc<MemoryApi>, min_similarity: f64) {
    registry.register(Box::new(RetrieveContextTool { api: api.clone(), min_similarity }));
    registry.register(Box::new(GetUserPreferencesTool { api: api.clone() }));
    registry.register(Box::new(CheckRelationshipTool { api: api.clone() }));
    registry.register(Box::new(AddOrUpdatePersonTool { api: api.clone() }));
    registry.register(Box::new(AddEventTool { api: api.clone() }));
    registry.register(Box::new(AddFactTool { api: api.clone() }));
    registry.register(Box::new(AddPreferenceTool { api: api.clone() }));
    registry.register(Box::new(AddOrUpdateRelationshipTool { api: api.clone() }));
    registry.register(Box::new(UpdateFactOrPreferenceTool { api: api.clone() }));
    registry.register(Box::new(DeleteMemoryTool { api }));
}
