pub mod confirm;
pub mod context;
pub mod engine;
pub mod events;
pub mod prompt;

pub use confirm::{ConfirmationBroker, requires_confirmation};
pub use context::{ContextManager, SummaryOutcome, count_message_tokens, estimate_tokens};
pub use engine::{AgentEngine, HistoryMessage, TurnRequest, TurnSession};
pub use events::AgentEvent;
pub use prompt::{PLACEHOLDERS, PromptVars, format_memories_block, render_system_prompt};
