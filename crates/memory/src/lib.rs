pub mod api;
pub mod canonical;
pub mod graph;
pub mod knowledge;
pub mod retrieval;
pub mod schema;
pub mod store;

pub use api::{DUPLICATE_THRESHOLD, DuplicateCheck, MemoryApi, UpsertOutcome, is_duplicate, today};
pub use canonical::{PersonRef, alias_accept, canonicalize, load_people};
pub use graph::{GraphError, GraphResult, GraphStore, Label, VECTOR_LABELS, sanitize_rel_type};
pub use knowledge::{
    CHUNK_OVERLAP, CHUNK_SIZE, ChunkHit, ChunkRecord, DocType, KnowledgeStore, chunk_text,
    format_chunks,
};
pub use retrieval::{
    DEFAULT_RETRIEVAL_LABELS, EntityMatch, RetrievalSource, RetrievedMemory, Retriever,
    cosine_similarity, detect_entity, merge_and_rank,
};
pub use schema::{CHUNK_TAGS, Knows, MemoryNode, Mentions, ParticipatedIn, USER_NAME, normalize_tags};
pub use store::{
    AgentDef, AgentStore, Conversation, ConversationMeta, ConversationStore, fallback_title,
    generate_title,
};
