//! Provider adapters and chat orchestration for the Murmur chat client.
//!
//! The [`providers`] module wraps two structurally different streaming
//! backends (AWS Bedrock's binary event stream and OpenAI-style SSE
//! endpoints) behind one chunk-stream contract; [`chat::ChatService`] is
//! the entry point the presentation layer drives.

pub mod chat;
pub mod knowledge;
pub mod providers;
pub mod reasoning;
pub mod types;

pub use chat::{ChatError, ChatService};
pub use knowledge::KnowledgeService;
pub use providers::{ChunkStream, Provider, ProviderError};
pub use types::{Document, Message, Role, StreamChunk};
