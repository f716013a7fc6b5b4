pub mod embed;
pub mod models;
pub mod router;
pub mod types;

pub use embed::OllamaEmbedder;
pub use models::{ModelCatalog, ModelInfo};
pub use router::{LlmRouter, messages_to_ollama, messages_to_openai};
pub use types::{
    ChatClient, ChatMessage, ChatOutcome, ChatReply, ChatRole, ContentPart, EmbedError, Embedder,
    LlmError, MessageContent, StreamDelta, ToolCall, ToolCallAccumulator, ToolCallFunction, Usage,
};
