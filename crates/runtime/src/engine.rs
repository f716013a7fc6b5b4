//! The agent turn engine — prompt assembly, the streaming model/tool loop,
//! confirmation gating, and event emission.
//!
//! One call to [`AgentEngine::stream_turn`] drives a complete user turn:
//! memory retrieval, system prompt rendering, history compaction, then up to
//! `max_tool_runs` rounds of streamed completion + tool execution.  Every
//! failure inside the turn becomes an [`AgentEvent`]; the stream always ends
//! with `Done` unless the caller disconnected, in which case the turn unwinds
//! quietly and pending confirmations resolve as denied.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Local;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use engram_llm::{ChatClient, ChatMessage, ChatRole, ContentPart, StreamDelta, ToolCall};
use engram_memory::{AgentDef, AgentStore, KnowledgeStore, MemoryApi, format_chunks};
use engram_tools::{ToolCategory, ToolRegistry, parse_artifacts, specs_to_openai_tools};

use crate::confirm::{ConfirmationBroker, requires_confirmation};
use crate::context::ContextManager;
use crate::events::AgentEvent;
use crate::prompt::{PromptVars, format_memories_block, render_system_prompt};

/// With a rolling summary present, histories longer than this compact down to
/// `[system, summary, last 6]` before the model call.
const COMPACT_AFTER_MESSAGES: usize = 15;
const COMPACT_KEEP_RECENT: usize = 6;

/// Output fed back to the model when a gated tool is declined.
fn denial_marker(tool_name: &str) -> String {
    format!("DENIED: the user declined to run {tool_name}. Do not retry this action.")
}

// ── Public types ─────────────────────────────────────────────────────────────

/// Per-conversation state the engine owns for the duration of a turn.
#[derive(Debug, Default)]
pub struct TurnSession {
    pub messages: Vec<ChatMessage>,
    /// Most recent rolling summary, if one has been generated.
    pub summary: Option<String>,
}

/// One message of caller-provided history (UI resend path).  Image
/// attachments become multi-part content.
#[derive(Debug, Clone)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
    pub image_urls: Vec<String>,
}

/// Everything needed to run one turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub user_input: String,
    pub agent_name: String,
    /// Resolved agent definition; when absent the engine loads it by name
    /// from the store (falling back to the default agent).
    pub agent: Option<AgentDef>,
    pub model: String,
    /// When present, the working message list is rebuilt from this history
    /// instead of extending the session's list.
    pub history: Option<Vec<HistoryMessage>>,
}

pub struct AgentEngine {
    llm: Arc<dyn ChatClient>,
    /// Absent in memory-less deployments (and engine tests); memory events
    /// then report empty results.
    memory: Option<Arc<MemoryApi>>,
    tools: Arc<ToolRegistry>,
    broker: Arc<ConfirmationBroker>,
    summary_model: String,
}

impl AgentEngine {
    pub fn new(
        llm: Arc<dyn ChatClient>,
        memory: Option<Arc<MemoryApi>>,
        tools: Arc<ToolRegistry>,
        broker: Arc<ConfirmationBroker>,
        summary_model: &str,
    ) -> Self {
        Self { llm, memory, tools, broker, summary_model: summary_model.to_string() }
    }

    pub fn broker(&self) -> &Arc<ConfirmationBroker> {
        &self.broker
    }

    /// Drive one turn, writing events into `events`.  Completes silently when
    /// the receiver is dropped mid-turn.
    pub async fn stream_turn(
        &self,
        session: &mut TurnSession,
        request: TurnRequest,
        events: mpsc::Sender<AgentEvent>,
    ) {
        let sink = EventSink { tx: events };
        if let Err(Disconnected) = self.run_turn(session, &request, &sink).await {
            debug!("caller disconnected, turn abandoned");
        }
    }

    async fn run_turn(
        &self,
        session: &mut TurnSession,
        request: &TurnRequest,
        sink: &EventSink,
    ) -> Result<(), Disconnected> {
        let started = Instant::now();
        let agent = self.resolve_agent(request).await;
        info!(agent = %agent.name, model = %request.model, "turn started");

        // ── Memory retrieval ────────────────────────────────────────────────
        let query_preview: String = request.user_input.chars().take(100).collect();
        sink.emit(AgentEvent::MemorySearchStart { query: query_preview }).await?;

        let mut memory_lines: Vec<(String, String)> = Vec::new();
        if let Some(memory) = &self.memory {
            match memory
                .retrieve_memories(&request.user_input, agent.max_memories, agent.min_similarity)
                .await
            {
                Ok(memories) => {
                    memory_lines =
                        memories.iter().map(|m| (m.id.clone(), m.annotated())).collect();
                }
                Err(err) => {
                    warn!(%err, "memory retrieval failed");
                    sink.emit(AgentEvent::Error { message: format!("memory search failed: {err}") })
                        .await?;
                }
            }
        }
        sink.emit(AgentEvent::MemorySearchEnd {
            memories: memory_lines.iter().map(|(_, text)| text.clone()).collect(),
        })
        .await?;

        // ── Preferences, known people, knowledge ────────────────────────────
        let mut user_preferences = "No preferences".to_string();
        let mut known_people = String::new();
        if let Some(memory) = &self.memory {
            if let Ok(prefs) = memory.get_user_preferences().await {
                user_preferences = prefs;
            }
            if let Ok(people) = memory.list_people().await {
                known_people =
                    people.iter().map(|p| p.name.as_str()).collect::<Vec<_>>().join(", ");
            }
        }

        let mut agent_knowledge = String::new();
        if agent.prompt.contains("{agent_knowledge}") {
            if let Some(memory) = &self.memory {
                sink.emit(AgentEvent::KnowledgeSearchStart {
                    query: request.user_input.chars().take(100).collect(),
                })
                .await?;
                let store = KnowledgeStore { api: memory.as_ref() };
                let hits = store
                    .search(&agent.name, &request.user_input, agent.max_memories, 0.7)
                    .await
                    .unwrap_or_default();
                sink.emit(AgentEvent::KnowledgeSearchEnd { count: hits.len() }).await?;
                if !hits.is_empty() {
                    agent_knowledge = format_chunks(&hits, 500);
                }
            }
        }

        // ── System prompt + working message list ────────────────────────────
        let vars = PromptVars {
            datetime: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            memories: format_memories_block(&memory_lines),
            user_preferences,
            known_people,
            agent_knowledge,
        };
        let system_prompt = render_system_prompt(&agent.prompt, &vars);

        let mut messages: Vec<ChatMessage> = match &request.history {
            Some(history) => {
                let mut rebuilt = vec![ChatMessage::system(system_prompt)];
                rebuilt.extend(history.iter().map(history_to_message));
                rebuilt.push(ChatMessage::user(request.user_input.clone()));
                rebuilt
            }
            None => {
                let mut extended = std::mem::take(&mut session.messages);
                extended.push(ChatMessage::user(request.user_input.clone()));
                // Slot 0 always holds the freshly rendered system prompt.
                if extended.first().map(|m| m.role == ChatRole::System).unwrap_or(false) {
                    extended[0] = ChatMessage::system(system_prompt);
                } else {
                    extended.insert(0, ChatMessage::system(system_prompt));
                }
                extended
            }
        };

        // ── Rolling-summary compaction ──────────────────────────────────────
        if let Some(summary) = &session.summary {
            if messages.len() > COMPACT_AFTER_MESSAGES {
                info!(from = messages.len(), "compacting history around rolling summary");
                let system = messages[0].clone();
                let recent: Vec<ChatMessage> =
                    messages[messages.len() - COMPACT_KEEP_RECENT..].to_vec();
                let mut compacted = vec![
                    system,
                    ChatMessage::system(format!("[Previous conversation summary: {summary}]")),
                ];
                compacted.extend(recent);
                messages = compacted;
            }
        }

        // ── Context-manager compression ─────────────────────────────────────
        let context = ContextManager::new(
            agent.context_compression,
            agent.context_max_tokens,
            agent.context_window_tokens,
            &self.summary_model,
        );
        let (processed, summary_outcome) = context
            .process(
                self.llm.as_ref(),
                messages,
                session.summary.as_deref().unwrap_or(""),
            )
            .await;
        messages = processed;
        if let Some(outcome) = summary_outcome {
            session.summary = Some(outcome.summary.clone());
            sink.emit(AgentEvent::SummaryGenerated {
                summary: outcome.summary,
                messages_summarized: outcome.messages_summarized,
                tokens_before: outcome.tokens_before,
                tokens_after: outcome.tokens_after,
            })
            .await?;
        }

        // ── Tool schema ─────────────────────────────────────────────────────
        let enabled: Option<&[String]> =
            if agent.enabled_tools.is_empty() { None } else { Some(&agent.enabled_tools) };
        let specs = self.tools.enabled_specs(enabled);
        let tools_json = if specs.is_empty() { None } else { Some(specs_to_openai_tools(&specs)) };

        // ── The tool loop ───────────────────────────────────────────────────
        let mut input_tokens: u64 = 0;
        let mut output_tokens: u64 = 0;
        let mut saved_memories: Vec<String> = Vec::new();

        for iteration in 0..agent.max_tool_runs {
            debug!(iteration, messages = messages.len(), "tool loop iteration");

            let (delta_tx, mut delta_rx) = mpsc::channel::<StreamDelta>(64);
            let llm = self.llm.clone();
            let model = request.model.clone();
            let call_messages = messages.clone();
            let call_tools = tools_json.clone();
            let handle = tokio::spawn(async move {
                llm.stream_chat(&model, &call_messages, call_tools.as_ref(), delta_tx).await
            });

            let mut started_calls: HashSet<String> = HashSet::new();
            while let Some(delta) = delta_rx.recv().await {
                match delta {
                    StreamDelta::Content(content) => {
                        sink.emit(AgentEvent::Content { content }).await.inspect_err(|_| {
                            handle.abort();
                        })?;
                    }
                    StreamDelta::Reasoning(content) => {
                        sink.emit(AgentEvent::Thinking { content }).await.inspect_err(|_| {
                            handle.abort();
                        })?;
                    }
                    StreamDelta::ToolCall { index, id, name, .. } => {
                        // First sight of a call (the delta carrying the name)
                        // announces it; args keep streaming afterwards.
                        if let Some(name) = name {
                            let key = id.filter(|s| !s.is_empty()).unwrap_or_else(|| format!("call_{index}"));
                            if started_calls.insert(key.clone()) {
                                sink.emit(AgentEvent::ToolStart {
                                    id: key,
                                    name,
                                    input: Value::Object(Default::default()),
                                })
                                .await
                                .inspect_err(|_| handle.abort())?;
                            }
                        }
                    }
                }
            }

            let outcome = match handle.await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(err)) => {
                    warn!(%err, "llm stream failed");
                    sink.emit(AgentEvent::Error { message: err.to_string() }).await?;
                    break;
                }
                Err(join_err) => {
                    sink.emit(AgentEvent::Error { message: join_err.to_string() }).await?;
                    break;
                }
            };
            input_tokens += outcome.usage.input_tokens;
            output_tokens += outcome.usage.output_tokens;

            let content =
                if outcome.content.is_empty() { None } else { Some(outcome.content.clone()) };
            messages.push(ChatMessage::assistant_tool_calls(content, outcome.tool_calls.clone()));

            if outcome.tool_calls.is_empty() {
                break;
            }
            info!(count = outcome.tool_calls.len(), iteration, "model requested tool calls");

            for call in &outcome.tool_calls {
                let args = parse_call_args(call);
                // Providers that only resolve calls at stream end never
                // produced a ToolStart above.
                if !started_calls.contains(&call.id) {
                    sink.emit(AgentEvent::ToolStart {
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        input: args.clone(),
                    })
                    .await?;
                }

                let output = self.execute_gated(call, &args, sink).await?;
                let (clean, artifacts) = parse_artifacts(&output);

                // Denials already emitted their terminal event in execute_gated.
                if !output.starts_with("DENIED:") {
                    sink.emit(AgentEvent::ToolEnd {
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        input: args.clone(),
                        output: clean.clone(),
                        artifacts,
                    })
                    .await?;
                    if self.tools.category_of(&call.function.name) == ToolCategory::Memory
                        && is_mutation(&call.function.name)
                        && !clean.starts_with("Error")
                    {
                        saved_memories.push(clean.chars().take(120).collect());
                    }
                }

                messages.push(ChatMessage::tool_result(call.id.clone(), output));
            }
        }

        // ── Wrap-up ─────────────────────────────────────────────────────────
        if !saved_memories.is_empty() {
            sink.emit(AgentEvent::MemoriesSaved { memories: saved_memories }).await?;
        }

        let elapsed = started.elapsed().as_secs_f64();
        let tokens_per_second =
            if elapsed > 0.0 { output_tokens as f64 / elapsed } else { 0.0 };
        sink.emit(AgentEvent::Metadata {
            elapsed_seconds: elapsed,
            input_tokens,
            output_tokens,
            tokens_per_second,
        })
        .await?;
        sink.emit(AgentEvent::Done).await?;

        // The turn is complete; the session takes the message list back.
        session.messages = messages;
        info!(elapsed, input_tokens, output_tokens, "turn finished");
        Ok(())
    }

    /// Execute one tool call, gating side-effecting tools on human approval.
    /// Returns the output string fed back to the model.
    async fn execute_gated(
        &self,
        call: &ToolCall,
        args: &Value,
        sink: &EventSink,
    ) -> Result<String, Disconnected> {
        let name = &call.function.name;

        if requires_confirmation(name) {
            // Register before emitting so a decision posted the moment the
            // event is seen cannot miss the pending entry.
            let waiter = self.broker.register(&call.id);
            sink.emit(AgentEvent::ToolConfirmationRequired {
                id: call.id.clone(),
                name: name.clone(),
                input: args.clone(),
            })
            .await?;

            // A disconnect while suspended counts as a denial; the waiter's
            // guard clears the tables either way.
            let approved = tokio::select! {
                approved = waiter.wait() => approved,
                _ = sink.closed() => false,
            };
            if !approved {
                info!(tool = %name, id = %call.id, "tool call denied");
                sink.emit(AgentEvent::ToolDenied { id: call.id.clone(), name: name.clone() })
                    .await?;
                return Ok(denial_marker(name));
            }
        }

        let output = match self.tools.get(name) {
            None => "Tool not found".to_string(),
            Some(tool) => match tool.run(args).await {
                Ok(output) => output,
                // Tool failures are data for the model, not stream failures.
                Err(err) => format!("Error: {err}"),
            },
        };
        Ok(output)
    }

    async fn resolve_agent(&self, request: &TurnRequest) -> AgentDef {
        if let Some(agent) = &request.agent {
            return agent.clone();
        }
        if let Some(memory) = &self.memory {
            let store = AgentStore { graph: memory.graph() };
            match store.get(&request.agent_name).await {
                Ok(Some(agent)) => return agent,
                Ok(None) => warn!(agent = %request.agent_name, "unknown agent, using default"),
                Err(err) => warn!(%err, "agent lookup failed, using default"),
            }
        }
        AgentDef { name: request.agent_name.clone(), ..AgentDef::default() }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Best-effort structured view of a call's arguments: objects pass through,
/// JSON strings are parsed, anything else becomes an empty map.
fn parse_call_args(call: &ToolCall) -> Value {
    match &call.function.arguments {
        Value::Object(_) => call.function.arguments.clone(),
        Value::String(raw) => serde_json::from_str(raw)
            .ok()
            .filter(Value::is_object)
            .unwrap_or_else(|| Value::Object(Default::default())),
        _ => Value::Object(Default::default()),
    }
}

fn is_mutation(tool_name: &str) -> bool {
    tool_name.starts_with("add_") || tool_name.starts_with("update_")
}

fn history_to_message(entry: &HistoryMessage) -> ChatMessage {
    let role_is_assistant = entry.role.eq_ignore_ascii_case("assistant");
    if entry.image_urls.is_empty() {
        if role_is_assistant {
            ChatMessage::assistant(entry.content.clone())
        } else {
            ChatMessage::user(entry.content.clone())
        }
    } else {
        let mut parts = vec![ContentPart::Text { text: entry.content.clone() }];
        parts.extend(
            entry.image_urls.iter().map(|url| ContentPart::ImageUrl { url: url.clone() }),
        );
        ChatMessage::user_parts(parts)
    }
}

/// The caller dropped the event receiver.
struct Disconnected;

struct EventSink {
    tx: mpsc::Sender<AgentEvent>,
}

impl EventSink {
    async fn emit(&self, event: AgentEvent) -> Result<(), Disconnected> {
        self.tx.send(event).await.map_err(|_| Disconnected)
    }

    async fn closed(&self) {
        self.tx.closed().await
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
