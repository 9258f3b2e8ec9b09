//! Platform layer for the Murmur chat client: configuration, conversation
//! persistence, and logging bootstrap.

pub mod config;
pub mod logging;
pub mod persistence;

pub use config::{AgentConfig, AppSettings, Config, KnowledgeSource, ModelConfig, ProviderKind};
pub use persistence::{Storage, StoredConversation};
