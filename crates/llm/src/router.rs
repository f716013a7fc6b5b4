//! Provider routing and HTTP plumbing for chat completions.
//!
//! Model names are routed by prefix: `grok*`, `gemini*`, `deepseek*` go to
//! external OpenAI-compatible endpoints (configured via env var pairs);
//! everything else is served by the local Ollama runtime.  Both wire formats
//! are parsed by hand from the raw byte stream — Ollama emits newline-
//! delimited JSON, OpenAI-compatible endpoints emit `data:` lines.

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use engram_config::{LlmConfig, provider_for_model};

use crate::types::{
    ChatClient, ChatMessage, ChatOutcome, ChatReply, ChatRole, ContentPart, LlmError,
    MessageContent, StreamDelta, ToolCall, ToolCallAccumulator, ToolCallFunction, Usage,
};

#[derive(Debug, Clone)]
pub struct LlmRouter {
    client: reqwest::Client,
    ollama_base_url: String,
}

impl LlmRouter {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            ollama_base_url: config.ollama_base_url.trim_end_matches('/').to_string(),
        }
    }

    fn ollama_endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.ollama_base_url)
    }
}

#[async_trait::async_trait]
impl ChatClient for LlmRouter {
    async fn stream_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&Value>,
        deltas: mpsc::Sender<StreamDelta>,
    ) -> Result<ChatOutcome, LlmError> {
        match provider_for_model(model) {
            Some(endpoint) => {
                self.stream_openai(&endpoint.base_url, &endpoint.api_key, model, messages, tools, deltas)
                    .await
            }
            None => self.stream_ollama(model, messages, tools, deltas).await,
        }
    }

    async fn chat(&self, model: &str, messages: &[ChatMessage]) -> Result<ChatReply, LlmError> {
        match provider_for_model(model) {
            Some(endpoint) => {
                let payload = json!({
                    "model": model,
                    "messages": messages_to_openai(messages),
                });
                let body = self
                    .post_json(
                        &format!("{}/chat/completions", endpoint.base_url.trim_end_matches('/')),
                        Some(&endpoint.api_key),
                        &payload,
                    )
                    .await?;
                Ok(parse_openai_reply(&body))
            }
            None => {
                let payload = json!({
                    "model": model,
                    "messages": messages_to_ollama(messages),
                    "stream": false,
                });
                let body = self
                    .post_json(&self.ollama_endpoint("/api/chat"), None, &payload)
                    .await?;
                Ok(parse_ollama_reply(&body))
            }
        }
    }
}

impl LlmRouter {
    async fn post_json(
        &self,
        endpoint: &str,
        bearer: Option<&str>,
        payload: &Value,
    ) -> Result<Value, LlmError> {
        let mut request = self.client.post(endpoint).json(payload);
        if let Some(key) = bearer {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| LlmError::Transient(e.to_string()))?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| LlmError::Protocol(e.to_string()))?;
        if !status.is_success() {
            return Err(LlmError::Provider { status: status.as_u16(), body: body.to_string() });
        }
        Ok(body)
    }

    /// Streaming structured chat against Ollama's `/api/chat`.
    async fn stream_ollama(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&Value>,
        deltas: mpsc::Sender<StreamDelta>,
    ) -> Result<ChatOutcome, LlmError> {
        let mut payload = json!({
            "model": model,
            "messages": messages_to_ollama(messages),
            "stream": true,
        });
        if let Some(tools_val) = tools {
            payload["tools"] = tools_val.clone();
        }

        let mut response = self
            .client
            .post(self.ollama_endpoint("/api/chat"))
            .json(&payload)
            .send()
            .await
            .map_err(|e| LlmError::Transient(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Provider { status: status.as_u16(), body });
        }

        let mut state = StreamState::default();
        let mut buffer = LineBuffer::default();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| LlmError::Transient(e.to_string()))?
        {
            for line in buffer.push(&chunk) {
                if let Ok(json) = serde_json::from_str::<Value>(&line) {
                    process_ollama_chunk(&json, &mut state, &deltas).await;
                }
            }
        }

        Ok(state.into_outcome())
    }

    /// Streaming structured chat against an OpenAI-compatible endpoint.
    async fn stream_openai(
        &self,
        base_url: &str,
        api_key: &str,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&Value>,
        deltas: mpsc::Sender<StreamDelta>,
    ) -> Result<ChatOutcome, LlmError> {
        if api_key.trim().is_empty() {
            return Err(LlmError::Credentials(model.to_string()));
        }
        let mut payload = json!({
            "model": model,
            "messages": messages_to_openai(messages),
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if let Some(tools_val) = tools {
            payload["tools"] = tools_val.clone();
        }

        let endpoint = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        let mut response = self
            .client
            .post(&endpoint)
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| LlmError::Transient(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Provider { status: status.as_u16(), body });
        }

        let mut state = StreamState::default();
        let mut buffer = LineBuffer::default();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| LlmError::Transient(e.to_string()))?
        {
            for line in buffer.push(&chunk) {
                let line = line.trim();
                if line.is_empty() || line == "data: [DONE]" {
                    continue;
                }
                let Some(data) = line.strip_prefix("data: ") else { continue };
                match serde_json::from_str::<Value>(data) {
                    Ok(json) => process_openai_chunk(&json, &mut state, &deltas).await,
                    Err(e) => warn!(error = %e, "skipping malformed stream line"),
                }
            }
        }

        Ok(state.into_outcome())
    }
}

// ── Stream parsing ───────────────────────────────────────────────────────────

/// Splits a raw byte stream into complete lines, carrying partial lines
/// across chunk boundaries.
#[derive(Debug, Default)]
struct LineBuffer {
    partial: String,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial.push_str(&String::from_utf8_lossy(chunk));
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let line = self.partial[..pos].trim_end_matches('\r').to_string();
            self.partial.drain(..=pos);
            if !line.trim().is_empty() {
                lines.push(line);
            }
        }
        lines
    }
}

/// Mutable accumulation state for one in-flight streamed completion.
#[derive(Debug, Default)]
struct StreamState {
    content: String,
    reasoning: String,
    accumulator: ToolCallAccumulator,
    final_calls: Vec<ToolCall>,
    finish_reason: String,
    usage: Usage,
}

impl StreamState {
    fn into_outcome(self) -> ChatOutcome {
        let had_streamed_calls = !self.accumulator.is_empty();
        let tool_calls = self.accumulator.finish(self.final_calls);
        let mut finish_reason = if self.finish_reason.is_empty() {
            "stop".to_string()
        } else {
            self.finish_reason
        };
        if (had_streamed_calls || !tool_calls.is_empty()) && finish_reason == "stop" {
            finish_reason = "tool_calls".to_string();
        }
        ChatOutcome {
            content: self.content,
            reasoning: self.reasoning,
            tool_calls,
            finish_reason,
            usage: self.usage,
        }
    }
}

async fn process_ollama_chunk(json: &Value, state: &mut StreamState, deltas: &mpsc::Sender<StreamDelta>) {
    if let Some(message) = json.get("message") {
        if let Some(content) = message.get("content").and_then(|v| v.as_str()) {
            if !content.is_empty() {
                state.content.push_str(content);
                let _ = deltas.send(StreamDelta::Content(content.to_string())).await;
            }
        }
        if let Some(thinking) = message.get("thinking").and_then(|v| v.as_str()) {
            if !thinking.is_empty() {
                state.reasoning.push_str(thinking);
                let _ = deltas.send(StreamDelta::Reasoning(thinking.to_string())).await;
            }
        }
    }
    // Tool calls and usage arrive on the terminal chunk.
    if json.get("done").and_then(|v| v.as_bool()).unwrap_or(false) {
        if let Some(calls) = json
            .get("message")
            .and_then(|m| m.get("tool_calls"))
            .and_then(|v| v.as_array())
        {
            state.final_calls = parse_ollama_tool_calls(calls);
            for (index, call) in state.final_calls.iter().enumerate() {
                let _ = deltas
                    .send(StreamDelta::ToolCall {
                        index,
                        id: Some(call.id.clone()),
                        name: Some(call.function.name.clone()),
                        args_fragment: None,
                    })
                    .await;
            }
        }
        state.usage.input_tokens = json.get("prompt_eval_count").and_then(|v| v.as_u64()).unwrap_or(0);
        state.usage.output_tokens = json.get("eval_count").and_then(|v| v.as_u64()).unwrap_or(0);
        debug!(
            input = state.usage.input_tokens,
            output = state.usage.output_tokens,
            "ollama stream finished"
        );
    }
}

async fn process_openai_chunk(json: &Value, state: &mut StreamState, deltas: &mpsc::Sender<StreamDelta>) {
    if let Some(usage) = json.get("usage") {
        if let Some(v) = usage.get("prompt_tokens").and_then(|v| v.as_u64()) {
            state.usage.input_tokens = v;
        }
        if let Some(v) = usage.get("completion_tokens").and_then(|v| v.as_u64()) {
            state.usage.output_tokens = v;
        }
    }

    let Some(choice) = json.get("choices").and_then(|c| c.get(0)) else { return };
    if let Some(fr) = choice.get("finish_reason").and_then(|v| v.as_str()) {
        state.finish_reason = fr.to_string();
    }
    let Some(delta) = choice.get("delta") else { return };

    if let Some(content) = delta.get("content").and_then(|v| v.as_str()) {
        if !content.is_empty() {
            state.content.push_str(content);
            let _ = deltas.send(StreamDelta::Content(content.to_string())).await;
        }
    }
    if let Some(reasoning) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
        if !reasoning.is_empty() {
            state.reasoning.push_str(reasoning);
            let _ = deltas.send(StreamDelta::Reasoning(reasoning.to_string())).await;
        }
    }
    if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
        for tc in tool_calls {
            let index = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
            let id = tc.get("id").and_then(|v| v.as_str());
            let name = tc
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(|v| v.as_str());
            let args = tc
                .get("function")
                .and_then(|f| f.get("arguments"))
                .and_then(|v| v.as_str());
            state.accumulator.apply(index, id, name, args);
            let _ = deltas
                .send(StreamDelta::ToolCall {
                    index,
                    id: id.map(ToString::to_string),
                    name: name.map(ToString::to_string),
                    args_fragment: args.map(ToString::to_string),
                })
                .await;
        }
    }
}

// ── Non-streaming response parsing ───────────────────────────────────────────

fn parse_openai_reply(body: &Value) -> ChatReply {
    let content = body
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let usage = Usage {
        input_tokens: body
            .pointer("/usage/prompt_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        output_tokens: body
            .pointer("/usage/completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
    };
    ChatReply { content, usage }
}

fn parse_ollama_reply(body: &Value) -> ChatReply {
    let content = body
        .pointer("/message/content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let usage = Usage {
        input_tokens: body.get("prompt_eval_count").and_then(|v| v.as_u64()).unwrap_or(0),
        output_tokens: body.get("eval_count").and_then(|v| v.as_u64()).unwrap_or(0),
    };
    ChatReply { content, usage }
}

/// Parse Ollama's `tool_calls` array into our [`ToolCall`] type.
fn parse_ollama_tool_calls(calls: &[Value]) -> Vec<ToolCall> {
    calls
        .iter()
        .enumerate()
        .filter_map(|(i, call)| {
            let func = call.get("function")?;
            let name = func.get("name")?.as_str()?.to_string();
            let arguments = func.get("arguments").cloned().unwrap_or(json!({}));
            let id = call
                .get("id")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .unwrap_or_else(|| format!("call_{i}"));
            Some(ToolCall {
                id,
                call_type: "function".to_string(),
                function: ToolCallFunction { name, arguments },
            })
        })
        .collect()
}

// ── Message conversion ───────────────────────────────────────────────────────

/// Convert our message array to Ollama's `/api/chat` format.  Inline images
/// are carried in the `images` array as raw base64.
pub fn messages_to_ollama(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let mut msg = json!({ "role": role_str(m.role) });
            match &m.content {
                Some(MessageContent::Text(text)) => msg["content"] = json!(text),
                Some(MessageContent::Parts(parts)) => {
                    let text: Vec<&str> = parts
                        .iter()
                        .filter_map(|p| match p {
                            ContentPart::Text { text } => Some(text.as_str()),
                            _ => None,
                        })
                        .collect();
                    msg["content"] = json!(text.join(" "));
                    let images: Vec<String> = parts
                        .iter()
                        .filter_map(|p| match p {
                            ContentPart::ImageUrl { url } => Some(strip_data_url(url)),
                            _ => None,
                        })
                        .collect();
                    if !images.is_empty() {
                        msg["images"] = json!(images);
                    }
                }
                None => {}
            }
            if !m.tool_calls.is_empty() {
                let calls: Vec<Value> = m
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "function": {
                                "name": tc.function.name,
                                "arguments": tc.function.arguments,
                            }
                        })
                    })
                    .collect();
                msg["tool_calls"] = json!(calls);
            }
            if let Some(ref id) = m.tool_call_id {
                msg["tool_call_id"] = json!(id);
            }
            msg
        })
        .collect()
}

/// Convert our message array to the OpenAI-compatible format.  Multi-part
/// content is passed through as a typed parts array.
pub fn messages_to_openai(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let mut msg = json!({ "role": role_str(m.role) });
            match &m.content {
                Some(MessageContent::Text(text)) => msg["content"] = json!(text),
                Some(MessageContent::Parts(parts)) => {
                    let rendered: Vec<Value> = parts
                        .iter()
                        .map(|p| match p {
                            ContentPart::Text { text } => json!({"type": "text", "text": text}),
                            ContentPart::ImageUrl { url } => {
                                json!({"type": "image_url", "image_url": {"url": url}})
                            }
                        })
                        .collect();
                    msg["content"] = json!(rendered);
                }
                None => msg["content"] = Value::Null,
            }
            if !m.tool_calls.is_empty() {
                let calls: Vec<Value> = m
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.function.name,
                                // OpenAI expects the arguments as a JSON string.
                                "arguments": if tc.function.arguments.is_string() {
                                    tc.function.arguments.clone()
                                } else {
                                    json!(tc.function.arguments.to_string())
                                }
                            }
                        })
                    })
                    .collect();
                msg["tool_calls"] = json!(calls);
            }
            if let Some(ref id) = m.tool_call_id {
                msg["tool_call_id"] = json!(id);
            }
            msg
        })
        .collect()
}

fn role_str(role: ChatRole) -> &'static str {
    match role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
        ChatRole::Tool => "tool",
    }
}

fn strip_data_url(url: &str) -> String {
    match url.split_once(";base64,") {
        Some((_, data)) => data.to_string(),
        None => url.to_string(),
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContentPart;

    #[test]
    fn line_buffer_carries_partials_across_chunks() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"{\"a\":").is_empty());
        let lines = buffer.push(b"1}\n{\"b\":2}\n{\"c\"");
        assert_eq!(lines, vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);
        let lines = buffer.push(b":3}\n");
        assert_eq!(lines, vec!["{\"c\":3}".to_string()]);
    }

    #[test]
    fn line_buffer_strips_carriage_returns() {
        let mut buffer = LineBuffer::default();
        let lines = buffer.push(b"data: {}\r\n");
        assert_eq!(lines, vec!["data: {}".to_string()]);
    }

    #[tokio::test]
    async fn openai_chunks_accumulate_content_and_tool_calls() {
        let (tx, mut rx) = mpsc::channel(32);
        let mut state = StreamState::default();

        let chunk1: Value = serde_json::json!({
            "choices": [{"delta": {"content": "Hel"}}]
        });
        let chunk2: Value = serde_json::json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "function": {"name": "add_fact", "arguments": "{\"con"}}
            ]}}]
        });
        let chunk3: Value = serde_json::json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "tent\":\"x\"}"}}
            ]}, "finish_reason": "tool_calls"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 7}
        });

        process_openai_chunk(&chunk1, &mut state, &tx).await;
        process_openai_chunk(&chunk2, &mut state, &tx).await;
        process_openai_chunk(&chunk3, &mut state, &tx).await;
        drop(tx);

        let outcome = state.into_outcome();
        assert_eq!(outcome.content, "Hel");
        assert_eq!(outcome.finish_reason, "tool_calls");
        assert_eq!(outcome.usage.input_tokens, 12);
        assert_eq!(outcome.usage.output_tokens, 7);
        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!(outcome.tool_calls[0].function.arguments["content"], "x");

        // First delta is the content fragment, then two tool-call fragments.
        let mut kinds = Vec::new();
        while let Some(delta) = rx.recv().await {
            kinds.push(match delta {
                StreamDelta::Content(_) => "content",
                StreamDelta::Reasoning(_) => "reasoning",
                StreamDelta::ToolCall { .. } => "tool_call",
            });
        }
        assert_eq!(kinds, vec!["content", "tool_call", "tool_call"]);
    }

    #[tokio::test]
    async fn ollama_terminal_chunk_carries_calls_and_usage() {
        let (tx, mut rx) = mpsc::channel(32);
        let mut state = StreamState::default();

        let streaming: Value = serde_json::json!({
            "message": {"content": "thinking about it", "thinking": "hmm"},
            "done": false
        });
        let terminal: Value = serde_json::json!({
            "message": {"content": "", "tool_calls": [
                {"function": {"name": "delete_memory", "arguments": {"item_id": "4:abc"}}}
            ]},
            "done": true,
            "prompt_eval_count": 100,
            "eval_count": 25
        });

        process_ollama_chunk(&streaming, &mut state, &tx).await;
        process_ollama_chunk(&terminal, &mut state, &tx).await;
        drop(tx);

        let outcome = state.into_outcome();
        assert_eq!(outcome.content, "thinking about it");
        assert_eq!(outcome.reasoning, "hmm");
        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!(outcome.tool_calls[0].function.name, "delete_memory");
        assert_eq!(outcome.tool_calls[0].id, "call_0");
        assert_eq!(outcome.finish_reason, "tool_calls");
        assert_eq!(outcome.usage.output_tokens, 25);

        let mut saw_tool_delta = false;
        while let Some(delta) = rx.recv().await {
            if matches!(delta, StreamDelta::ToolCall { .. }) {
                saw_tool_delta = true;
            }
        }
        assert!(saw_tool_delta, "terminal tool calls must still produce deltas");
    }

    #[test]
    fn finish_reason_defaults_to_stop_without_tool_calls() {
        let state = StreamState::default();
        let outcome = state.into_outcome();
        assert_eq!(outcome.finish_reason, "stop");
        assert!(outcome.tool_calls.is_empty());
    }

    #[test]
    fn openai_messages_stringify_tool_arguments() {
        let messages = vec![ChatMessage::assistant_tool_calls(
            None,
            vec![ToolCall {
                id: "c1".into(),
                call_type: "function".into(),
                function: ToolCallFunction {
                    name: "add_fact".into(),
                    arguments: serde_json::json!({"content": "x"}),
                },
            }],
        )];
        let rendered = messages_to_openai(&messages);
        let args = &rendered[0]["tool_calls"][0]["function"]["arguments"];
        assert!(args.is_string(), "OpenAI wire format carries args as a string");
    }

    #[test]
    fn ollama_messages_split_image_parts() {
        let messages = vec![ChatMessage::user_parts(vec![
            ContentPart::Text { text: "what is this".into() },
            ContentPart::ImageUrl { url: "data:image/png;base64,AAAA".into() },
        ])];
        let rendered = messages_to_ollama(&messages);
        assert_eq!(rendered[0]["content"], "what is this");
        assert_eq!(rendered[0]["images"][0], "AAAA");
    }

    #[test]
    fn tool_result_messages_carry_call_id() {
        let messages = vec![ChatMessage::tool_result("call_9", "Fact added: x")];
        let rendered = messages_to_openai(&messages);
        assert_eq!(rendered[0]["role"], "tool");
        assert_eq!(rendered[0]["tool_call_id"], "call_9");
    }
}
