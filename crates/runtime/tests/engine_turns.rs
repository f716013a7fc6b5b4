//! End-to-end turn-engine tests against a scripted model stub.
//!
//! The stub plays back a fixed sequence of completions (text, tool calls, or
//! failures), which lets these tests pin down the event ordering, the
//! confirmation gating, the iteration bound, and the cleanup invariants
//! without any network dependency.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use engram_llm::{
    ChatClient, ChatMessage, ChatOutcome, ChatReply, LlmError, StreamDelta, ToolCall,
    ToolCallFunction, Usage,
};
use engram_memory::AgentDef;
use engram_runtime::{AgentEngine, AgentEvent, ConfirmationBroker, TurnRequest, TurnSession};
use engram_tools::{Tool, ToolCategory, ToolParam, ToolRegistry, ToolSpec};

// ── Model stub ───────────────────────────────────────────────────────────────

#[derive(Clone)]
enum Step {
    Text(&'static str),
    CallTool { name: &'static str, args: Value },
    Fail,
}

struct StubChat {
    steps: Mutex<VecDeque<Step>>,
    stream_calls: AtomicUsize,
}

impl StubChat {
    fn new(steps: Vec<Step>) -> Self {
        Self { steps: Mutex::new(steps.into()), stream_calls: AtomicUsize::new(0) }
    }

    fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ChatClient for StubChat {
    async fn stream_chat(
        &self,
        _model: &str,
        _messages: &[ChatMessage],
        _tools: Option<&Value>,
        deltas: mpsc::Sender<StreamDelta>,
    ) -> Result<ChatOutcome, LlmError> {
        let call_no = self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Text("all steps consumed"));

        match step {
            Step::Text(text) => {
                let _ = deltas.send(StreamDelta::Content(text.to_string())).await;
                Ok(ChatOutcome {
                    content: text.to_string(),
                    usage: Usage { input_tokens: 100, output_tokens: 20 },
                    finish_reason: "stop".to_string(),
                    ..Default::default()
                })
            }
            Step::CallTool { name, args } => {
                let id = format!("call_{call_no}");
                let _ = deltas
                    .send(StreamDelta::ToolCall {
                        index: 0,
                        id: Some(id.clone()),
                        name: Some(name.to_string()),
                        args_fragment: Some(args.to_string()),
                    })
                    .await;
                Ok(ChatOutcome {
                    tool_calls: vec![ToolCall {
                        id,
                        call_type: "function".to_string(),
                        function: ToolCallFunction { name: name.to_string(), arguments: args },
                    }],
                    usage: Usage { input_tokens: 100, output_tokens: 10 },
                    finish_reason: "tool_calls".to_string(),
                    ..Default::default()
                })
            }
            Step::Fail => Err(LlmError::Transient("stub transport failure".to_string())),
        }
    }

    async fn chat(&self, _model: &str, _messages: &[ChatMessage]) -> Result<ChatReply, LlmError> {
        Ok(ChatReply {
            content: "The user and the assistant discussed earlier plans in detail.".to_string(),
            usage: Usage { input_tokens: 50, output_tokens: 30 },
        })
    }
}

// ── Tool stubs ───────────────────────────────────────────────────────────────

struct CountingTool {
    name: &'static str,
    category: ToolCategory,
    invocations: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Tool for CountingTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.to_string(),
            description: format!("stub tool {}", self.name),
            category: self.category,
            params: vec![ToolParam::optional("item_id", "target id")],
        }
    }

    async fn run(&self, _args: &Value) -> anyhow::Result<String> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{} ran", self.name))
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

struct Harness {
    engine: Arc<AgentEngine>,
    llm: Arc<StubChat>,
    broker: Arc<ConfirmationBroker>,
}

fn harness(steps: Vec<Step>, tools: Vec<(&'static str, ToolCategory, Arc<AtomicUsize>)>) -> Harness {
    let llm = Arc::new(StubChat::new(steps));
    let broker = Arc::new(ConfirmationBroker::new());
    let mut registry = ToolRegistry::default();
    for (name, category, invocations) in tools {
        registry.register(Box::new(CountingTool { name, category, invocations }));
    }
    let engine = Arc::new(AgentEngine::new(
        llm.clone(),
        None,
        Arc::new(registry),
        broker.clone(),
        "stub-summary-model",
    ));
    Harness { engine, llm, broker }
}

fn request(agent: AgentDef) -> TurnRequest {
    TurnRequest {
        user_input: "hello there".to_string(),
        agent_name: agent.name.clone(),
        agent: Some(agent),
        model: "stub-model".to_string(),
        history: None,
    }
}

/// Run a turn to completion, resolving every confirmation with `approve`.
async fn run_turn(
    harness: &Harness,
    req: TurnRequest,
    session: TurnSession,
    approve: bool,
) -> (Vec<AgentEvent>, TurnSession) {
    let (tx, mut rx) = mpsc::channel(256);
    let engine = harness.engine.clone();
    let turn = tokio::spawn(async move {
        let mut session = session;
        engine.stream_turn(&mut session, req, tx).await;
        session
    });

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        if let AgentEvent::ToolConfirmationRequired { id, .. } = &event {
            assert!(harness.broker.resolve(id, approve), "pending entry must exist when the event is visible");
        }
        events.push(event);
    }
    let session = turn.await.unwrap();
    (events, session)
}

fn event_names(events: &[AgentEvent]) -> Vec<&'static str> {
    events
        .iter()
        .map(|event| match event {
            AgentEvent::MemorySearchStart { .. } => "memory_search_start",
            AgentEvent::MemorySearchEnd { .. } => "memory_search_end",
            AgentEvent::KnowledgeSearchStart { .. } => "knowledge_search_start",
            AgentEvent::KnowledgeSearchEnd { .. } => "knowledge_search_end",
            AgentEvent::Thinking { .. } => "thinking",
            AgentEvent::Content { .. } => "content",
            AgentEvent::ToolStart { .. } => "tool_start",
            AgentEvent::ToolConfirmationRequired { .. } => "tool_confirmation_required",
            AgentEvent::ToolDenied { .. } => "tool_denied",
            AgentEvent::ToolEnd { .. } => "tool_end",
            AgentEvent::MemoriesSaved { .. } => "memories_saved",
            AgentEvent::SummaryGenerated { .. } => "summary_generated",
            AgentEvent::Metadata { .. } => "metadata",
            AgentEvent::Error { .. } => "error",
            AgentEvent::Done => "done",
        })
        .collect()
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn plain_text_turn_emits_content_then_done() {
    let h = harness(vec![Step::Text("Hi!")], vec![]);
    let (events, session) = run_turn(&h, request(AgentDef::default()), TurnSession::default(), true).await;

    let names = event_names(&events);
    assert_eq!(
        names,
        vec!["memory_search_start", "memory_search_end", "content", "metadata", "done"]
    );
    assert_eq!(h.llm.stream_calls(), 1);
    // Session took the list back: system + user + assistant.
    assert_eq!(session.messages.len(), 3);
    assert_eq!(session.messages[2].text(), "Hi!");
}

#[tokio::test]
async fn denied_tool_is_never_executed_and_feeds_the_marker_back() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let h = harness(
        vec![
            Step::CallTool { name: "delete_memory", args: json!({"item_id": "4:x"}) },
            Step::Text("understood, leaving it alone"),
        ],
        vec![("delete_memory", ToolCategory::Memory, invocations.clone())],
    );

    let (events, session) = run_turn(&h, request(AgentDef::default()), TurnSession::default(), false).await;
    let names = event_names(&events);

    // Lifecycle order: started → confirmation → denied; no tool_end for it.
    let start = names.iter().position(|n| *n == "tool_start").unwrap();
    let confirm = names.iter().position(|n| *n == "tool_confirmation_required").unwrap();
    let denied = names.iter().position(|n| *n == "tool_denied").unwrap();
    assert!(start < confirm && confirm < denied);
    assert!(!names.contains(&"tool_end"));
    assert_eq!(names.last(), Some(&"done"));

    // The tool body never ran; nothing was mutated.
    assert_eq!(invocations.load(Ordering::SeqCst), 0);

    // The denial marker went back to the model as the tool result.
    let denial = session
        .messages
        .iter()
        .find(|m| m.tool_call_id.is_some())
        .expect("tool-result message present");
    assert!(denial.text().starts_with("DENIED:"));

    // The model saw it and answered without retrying.
    assert_eq!(h.llm.stream_calls(), 2);
    assert!(h.broker.is_clean(), "no pending/result entries may outlive the turn");
}

#[tokio::test]
async fn approved_tool_runs_and_completes() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let h = harness(
        vec![
            Step::CallTool { name: "add_fact", args: json!({"content": "likes Rust", "category": "habit"}) },
            Step::Text("noted"),
        ],
        vec![("add_fact", ToolCategory::Memory, invocations.clone())],
    );

    let (events, _) = run_turn(&h, request(AgentDef::default()), TurnSession::default(), true).await;
    let names = event_names(&events);
    assert!(names.contains(&"tool_confirmation_required"));
    assert!(names.contains(&"tool_end"));
    assert!(!names.contains(&"tool_denied"));
    assert!(names.contains(&"memories_saved"));
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert!(h.broker.is_clean());
}

#[tokio::test]
async fn tool_loop_is_bounded_by_max_tool_runs() {
    let invocations = Arc::new(AtomicUsize::new(0));
    // The model asks for a (non-gated) tool on every single completion.
    let steps = std::iter::repeat_n(
        Step::CallTool { name: "echo_probe", args: json!({}) },
        10,
    )
    .collect();
    let h = harness(steps, vec![("echo_probe", ToolCategory::Other, invocations.clone())]);

    let agent = AgentDef { max_tool_runs: 3, ..AgentDef::default() };
    let (events, _) = run_turn(&h, request(agent), TurnSession::default(), true).await;

    // Exactly three model calls, then a clean wrap-up — no hang.
    assert_eq!(h.llm.stream_calls(), 3);
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    let names = event_names(&events);
    assert!(names.contains(&"metadata"));
    assert_eq!(names.last(), Some(&"done"));
}

#[tokio::test]
async fn unknown_tool_becomes_a_normal_result() {
    let h = harness(
        vec![
            Step::CallTool { name: "does_not_exist", args: json!({}) },
            Step::Text("sorry, no such capability"),
        ],
        vec![],
    );
    let (events, session) = run_turn(&h, request(AgentDef::default()), TurnSession::default(), true).await;

    let output = events.iter().find_map(|e| match e {
        AgentEvent::ToolEnd { output, .. } => Some(output.clone()),
        _ => None,
    });
    assert_eq!(output.as_deref(), Some("Tool not found"));

    let result_msg = session.messages.iter().find(|m| m.tool_call_id.is_some()).unwrap();
    assert_eq!(result_msg.text(), "Tool not found");
    assert_eq!(event_names(&events).last(), Some(&"done"));
}

#[tokio::test]
async fn llm_failure_still_terminates_with_done() {
    let h = harness(vec![Step::Fail], vec![]);
    let (events, _) = run_turn(&h, request(AgentDef::default()), TurnSession::default(), true).await;
    let names = event_names(&events);
    assert!(names.contains(&"error"));
    assert!(names.contains(&"metadata"));
    assert_eq!(names.last(), Some(&"done"));
}

#[tokio::test]
async fn oversized_history_is_compressed_under_the_budget() {
    let h = harness(vec![Step::Text("continuing")], vec![]);

    // ~9000 estimated tokens of history against a 6000-token budget.
    let mut session = TurnSession::default();
    session.messages.push(ChatMessage::system("base system prompt"));
    for i in 0..30 {
        session.messages.push(ChatMessage::user(format!("question {i}: {}", "x".repeat(580))));
        session.messages.push(ChatMessage::assistant(format!("answer {i}: {}", "y".repeat(580))));
    }

    let agent = AgentDef {
        context_compression: true,
        context_max_tokens: 6000,
        context_window_tokens: 2000,
        ..AgentDef::default()
    };
    let (events, session) = run_turn(&h, request(agent), session, true).await;

    let summary = events.iter().find_map(|e| match e {
        AgentEvent::SummaryGenerated { tokens_before, tokens_after, .. } => {
            Some((*tokens_before, *tokens_after))
        }
        _ => None,
    });
    let (before, after) = summary.expect("exactly one summary_generated event");
    assert!(before > 6000);
    assert!(after <= 6000, "post-compression tokens {after} exceed the budget");

    // Shape: system first, summary second, most recent conversation last.
    assert_eq!(session.messages[0].role, engram_llm::ChatRole::System);
    assert!(session.messages[1].text().contains("CONVERSATION SUMMARY"));
    let tail = &session.messages[session.messages.len() - 2];
    assert_eq!(tail.text(), "hello there");
    assert!(session.summary.is_some());
}

#[tokio::test]
async fn disconnect_during_confirmation_denies_and_cleans_up() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let h = harness(
        vec![Step::CallTool { name: "delete_memory", args: json!({"item_id": "4:x"}) }],
        vec![("delete_memory", ToolCategory::Memory, invocations.clone())],
    );

    let (tx, mut rx) = mpsc::channel(256);
    let engine = h.engine.clone();
    let turn = tokio::spawn(async move {
        let mut session = TurnSession::default();
        engine.stream_turn(&mut session, request(AgentDef::default()), tx).await;
    });

    // Read until the confirmation request, then vanish like a closed tab.
    while let Some(event) = rx.recv().await {
        if matches!(event, AgentEvent::ToolConfirmationRequired { .. }) {
            break;
        }
    }
    drop(rx);

    turn.await.unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 0, "disconnect counts as denial");
    assert!(h.broker.is_clean(), "cancellation must not leak broker entries");
}
