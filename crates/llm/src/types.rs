//! Chat message and tool-call wire types shared by every provider.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

// ── Errors ───────────────────────────────────────────────────────────────────

/// Failures surfaced by chat providers.  `Transient` failures may be retried
/// by callers with a bounded budget; everything else is terminal for the
/// current call.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("transient transport failure: {0}")]
    Transient(String),
    #[error("provider returned {status}: {body}")]
    Provider { status: u16, body: String },
    #[error("malformed provider payload: {0}")]
    Protocol(String),
    #[error("missing credentials for provider: {0}")]
    Credentials(String),
}

/// Failures from the embedding backend.  Only `Transient` is retryable.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("transient embedding failure: {0}")]
    Transient(String),
    #[error("embedding provider returned {status}: {body}")]
    Provider { status: u16, body: String },
    #[error("malformed embedding payload: {0}")]
    Protocol(String),
}

// ── Messages ─────────────────────────────────────────────────────────────────

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One part of a multi-part message body (text or an inline image).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { url: String },
}

/// Message content: either a plain string or a list of typed parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Concatenated text across all parts (images contribute nothing).
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

/// A single message in a chat conversation.
///
/// Used with the structured chat APIs (`/api/chat` for Ollama,
/// `/chat/completions` for OpenAI-compatible endpoints) that support native
/// tool calling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Option<MessageContent>,
    /// Tool calls requested by the assistant (only present on assistant messages).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// When role == Tool, identifies which tool call this result is for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: Some(MessageContent::Text(content.into())),
            tool_calls: vec![],
            tool_call_id: None,
        }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: Some(MessageContent::Text(content.into())),
            tool_calls: vec![],
            tool_call_id: None,
        }
    }
    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: ChatRole::User,
            content: Some(MessageContent::Parts(parts)),
            tool_calls: vec![],
            tool_call_id: None,
        }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: Some(MessageContent::Text(content.into())),
            tool_calls: vec![],
            tool_call_id: None,
        }
    }
    pub fn assistant_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.map(MessageContent::Text),
            tool_calls,
            tool_call_id: None,
        }
    }
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: Some(MessageContent::Text(content.into())),
            tool_calls: vec![],
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    /// Text body of the message, empty when absent.
    pub fn text(&self) -> String {
        self.content.as_ref().map(|c| c.text()).unwrap_or_default()
    }
}

// ── Tool calls ───────────────────────────────────────────────────────────────

/// A tool call requested by the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique ID for this call (used to correlate tool results).
    /// Ollama may not always provide one, in which case we generate one.
    #[serde(default)]
    pub id: String,
    /// Always "function" for OpenAI-compatible APIs.
    #[serde(default = "default_tool_call_type", rename = "type")]
    pub call_type: String,
    pub function: ToolCallFunction,
}

fn default_tool_call_type() -> String {
    "function".to_string()
}

/// The function name and arguments within a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    /// Arguments as a JSON string (OpenAI-compatible) or parsed object
    /// (Ollama).  Normalized to a parsed value for downstream consumers.
    #[serde(default)]
    pub arguments: serde_json::Value,
}

// ── Streaming ────────────────────────────────────────────────────────────────

/// Token usage reported by the provider's terminal chunk.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// One streamed fragment forwarded to the caller while a chat request is in
/// flight.  Tool-call fragments arrive keyed by the provider's delta index;
/// the complete reconciled calls are available on the final [`ChatOutcome`].
#[derive(Debug, Clone)]
pub enum StreamDelta {
    Content(String),
    Reasoning(String),
    ToolCall {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        args_fragment: Option<String>,
    },
}

/// Final result of a streamed chat call, after all deltas were emitted.
#[derive(Debug, Clone, Default)]
pub struct ChatOutcome {
    pub content: String,
    pub reasoning: String,
    /// Complete tool calls, reconciled from streamed fragments and the
    /// provider's final message (the final message wins when both exist).
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: String,
    pub usage: Usage,
}

/// Result of a plain (non-streaming) chat call.
#[derive(Debug, Clone, Default)]
pub struct ChatReply {
    pub content: String,
    pub usage: Usage,
}

// ── Provider traits ──────────────────────────────────────────────────────────

/// A chat backend.  Implemented by [`crate::LlmRouter`] for real providers
/// and by stubs in tests.
#[async_trait::async_trait]
pub trait ChatClient: Send + Sync {
    /// Stream a chat completion.  Text/reasoning/tool-call fragments are sent
    /// through `deltas` as they arrive; the reconciled result is returned.
    async fn stream_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&serde_json::Value>,
        deltas: mpsc::Sender<StreamDelta>,
    ) -> Result<ChatOutcome, LlmError>;

    /// One-shot completion used for summaries and titles.
    async fn chat(&self, model: &str, messages: &[ChatMessage]) -> Result<ChatReply, LlmError>;
}

/// Maps text to a fixed-dimension dense vector.  Results are never cached
/// across calls; the graph store persists them.
#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    /// Vector dimension this backend produces.
    fn dimension(&self) -> usize;
}

// ── Tool-call delta accumulation ─────────────────────────────────────────────

/// Accumulates streamed tool-call fragments keyed by delta index.
///
/// OpenAI-compatible providers send the call id and function name once in the
/// first delta and the argument string in fragments; Ollama emits complete
/// calls only on the terminal chunk.  [`finish`](Self::finish) resolves both
/// paths: when the provider supplied final calls those replace the streamed
/// reconstruction entirely.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    entries: std::collections::BTreeMap<usize, (String, String, String)>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn apply(&mut self, index: usize, id: Option<&str>, name: Option<&str>, args: Option<&str>) {
        let entry = self.entries.entry(index).or_default();
        if let Some(id) = id {
            if !id.is_empty() {
                entry.0 = id.to_string();
            }
        }
        if let Some(name) = name {
            if !name.is_empty() {
                // Name is sent once in the first delta, not incrementally —
                // assign rather than append.
                entry.1 = name.to_string();
            }
        }
        if let Some(args) = args {
            entry.2.push_str(args);
        }
    }

    /// Resolve accumulated fragments into complete calls, preferring the
    /// provider's final list when present.
    pub fn finish(self, final_calls: Vec<ToolCall>) -> Vec<ToolCall> {
        if !final_calls.is_empty() {
            return final_calls;
        }
        self.entries
            .into_iter()
            .map(|(index, (id, name, args_str))| {
                let arguments =
                    serde_json::from_str(&args_str).unwrap_or(serde_json::Value::Object(Default::default()));
                ToolCall {
                    id: if id.is_empty() { format!("call_{index}") } else { id },
                    call_type: "function".to_string(),
                    function: ToolCallFunction { name, arguments },
                }
            })
            .collect()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_text_joins_parts() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text { text: "hello".into() },
            ContentPart::ImageUrl { url: "data:image/png;base64,xyz".into() },
            ContentPart::Text { text: "world".into() },
        ]);
        assert_eq!(content.text(), "hello world");
    }

    #[test]
    fn message_content_serde_is_untagged() {
        let plain: MessageContent = serde_json::from_str("\"hi\"").unwrap();
        assert_eq!(plain, MessageContent::Text("hi".into()));

        let parts: MessageContent =
            serde_json::from_str(r#"[{"type":"text","text":"hi"}]"#).unwrap();
        assert_eq!(parts.text(), "hi");
    }

    #[test]
    fn accumulator_reassembles_fragmented_args() {
        let mut acc = ToolCallAccumulator::new();
        acc.apply(0, Some("call_abc"), Some("add_fact"), Some("{\"con"));
        acc.apply(0, None, None, Some("tent\":\"x\"}"));

        let calls = acc.finish(vec![]);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_abc");
        assert_eq!(calls[0].function.name, "add_fact");
        assert_eq!(calls[0].function.arguments["content"], "x");
    }

    #[test]
    fn accumulator_generates_id_when_missing() {
        let mut acc = ToolCallAccumulator::new();
        acc.apply(2, None, Some("read_file"), Some("{}"));
        let calls = acc.finish(vec![]);
        assert_eq!(calls[0].id, "call_2");
    }

    #[test]
    fn accumulator_prefers_provider_final_calls() {
        let mut acc = ToolCallAccumulator::new();
        acc.apply(0, Some("streamed"), Some("partial_tool"), Some("{\"a\":1"));

        let final_calls = vec![ToolCall {
            id: "final".to_string(),
            call_type: "function".to_string(),
            function: ToolCallFunction {
                name: "resolved_tool".to_string(),
                arguments: serde_json::json!({"a": 1}),
            },
        }];
        let calls = acc.finish(final_calls);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "final");
        assert_eq!(calls[0].function.name, "resolved_tool");
    }

    #[test]
    fn accumulator_malformed_args_become_empty_map() {
        let mut acc = ToolCallAccumulator::new();
        acc.apply(0, Some("c1"), Some("broken"), Some("{oops"));
        let calls = acc.finish(vec![]);
        assert!(calls[0].function.arguments.as_object().unwrap().is_empty());
    }

    #[test]
    fn accumulator_preserves_issue_order() {
        let mut acc = ToolCallAccumulator::new();
        acc.apply(1, Some("b"), Some("second"), Some("{}"));
        acc.apply(0, Some("a"), Some("first"), Some("{}"));
        let calls = acc.finish(vec![]);
        assert_eq!(calls[0].function.name, "first");
        assert_eq!(calls[1].function.name, "second");
    }
}
