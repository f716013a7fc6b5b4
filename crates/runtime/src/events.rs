//! Typed events emitted during a turn.
//!
//! The wire format is one JSON object per event (the SSE façade writes each
//! as a `data:` line); `{"done": true}` terminates the stream.

use serde_json::{Value, json};

#[derive(Debug, Clone)]
pub enum AgentEvent {
    MemorySearchStart { query: String },
    MemorySearchEnd { memories: Vec<String> },
    KnowledgeSearchStart { query: String },
    KnowledgeSearchEnd { count: usize },
    Thinking { content: String },
    Content { content: String },
    ToolStart { id: String, name: String, input: Value },
    ToolConfirmationRequired { id: String, name: String, input: Value },
    ToolDenied { id: String, name: String },
    ToolEnd { id: String, name: String, input: Value, output: String, artifacts: Vec<String> },
    MemoriesSaved { memories: Vec<String> },
    SummaryGenerated {
        summary: String,
        messages_summarized: usize,
        tokens_before: usize,
        tokens_after: usize,
    },
    Metadata {
        elapsed_seconds: f64,
        input_tokens: u64,
        output_tokens: u64,
        tokens_per_second: f64,
    },
    Error { message: String },
    Done,
}

impl AgentEvent {
    /// Wire JSON object for this event.
    pub fn to_wire(&self) -> Value {
        match self {
            AgentEvent::MemorySearchStart { query } => {
                json!({"memory": "search", "status": "started", "query": query})
            }
            AgentEvent::MemorySearchEnd { memories } => {
                json!({"memory": "search", "status": "completed", "memories": memories})
            }
            AgentEvent::KnowledgeSearchStart { query } => {
                json!({"knowledge": "search", "status": "started", "query": query})
            }
            AgentEvent::KnowledgeSearchEnd { count } => {
                json!({"knowledge": "search", "status": "completed", "count": count})
            }
            AgentEvent::Thinking { content } => json!({"thinking": content}),
            AgentEvent::Content { content } => json!({"content": content}),
            AgentEvent::ToolStart { id, name, input } => {
                json!({"tool_call": name, "status": "started", "input": input, "tool_id": id})
            }
            AgentEvent::ToolConfirmationRequired { id, name, input } => {
                json!({"tool_call": name, "status": "confirmation_required", "input": input, "tool_id": id})
            }
            AgentEvent::ToolDenied { id, name } => {
                json!({"tool_call": name, "status": "denied", "tool_id": id})
            }
            AgentEvent::ToolEnd { id, name, input, output, artifacts } => json!({
                "tool_call": name,
                "status": "completed",
                "input": input,
                "output": output,
                "artifacts": artifacts,
                "tool_id": id,
            }),
            AgentEvent::MemoriesSaved { memories } => json!({"memories_saved": memories}),
            AgentEvent::SummaryGenerated {
                summary,
                messages_summarized,
                tokens_before,
                tokens_after,
            } => json!({
                "summary_generated": {
                    "summary": summary,
                    "messages_summarized": messages_summarized,
                    "tokens_before": tokens_before,
                    "tokens_after": tokens_after,
                    "tokens_saved": tokens_before.saturating_sub(*tokens_after),
                }
            }),
            AgentEvent::Metadata {
                elapsed_seconds,
                input_tokens,
                output_tokens,
                tokens_per_second,
            } => json!({
                "metadata": {
                    "elapsed_seconds": elapsed_seconds,
                    "input_tokens": input_tokens,
                    "output_tokens": output_tokens,
                    "tokens_per_second": tokens_per_second,
                }
            }),
            AgentEvent::Error { message } => json!({"error": message}),
            AgentEvent::Done => json!({"done": true}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_terminates_the_stream() {
        assert_eq!(AgentEvent::Done.to_wire(), json!({"done": true}));
    }

    #[test]
    fn tool_lifecycle_events_share_the_tool_id() {
        let input = json!({"item_id": "4:abc"});
        let start = AgentEvent::ToolStart {
            id: "call_1".into(),
            name: "delete_memory".into(),
            input: input.clone(),
        };
        let denied = AgentEvent::ToolDenied { id: "call_1".into(), name: "delete_memory".into() };

        assert_eq!(start.to_wire()["tool_id"], "call_1");
        assert_eq!(start.to_wire()["status"], "started");
        assert_eq!(denied.to_wire()["status"], "denied");
        assert_eq!(denied.to_wire()["tool_id"], "call_1");
    }

    #[test]
    fn summary_event_reports_token_savings() {
        let event = AgentEvent::SummaryGenerated {
            summary: "they discussed plans".into(),
            messages_summarized: 12,
            tokens_before: 9000,
            tokens_after: 4200,
        };
        let wire = event.to_wire();
        assert_eq!(wire["summary_generated"]["tokens_saved"], 4800);
    }
}
