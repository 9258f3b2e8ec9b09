//! Chat orchestration: conversation state, model/agent selection,
//! capability gating, system-prompt assembly, and stream bookkeeping.
//!
//! This is the single entry point the presentation layer calls to send a
//! user turn and receive a streamed answer.

use std::sync::Arc;

use async_stream::try_stream;
use futures::{Stream, StreamExt};
use tracing::{debug, info, warn};

use murmur_core::config::{AgentConfig, Config, ModelConfig};
use murmur_core::persistence::{self, Storage};

use crate::knowledge::KnowledgeService;
use crate::providers::{Provider, ProviderError};
use crate::reasoning::{extract_reasoning_tags, has_reasoning_tags};
use crate::types::{Document, Message, Role, StreamChunk};

/// Cap on knowledge sources injected into one system prompt.
const MAX_KNOWLEDGE_SOURCES: usize = 3;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures raised by the chat service itself, plus provider failures
/// passed through. Capability gating and key validation are configuration
/// problems, distinct from the provider taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Model '{key}' not found. Available: {available}")]
    UnknownModel { key: String, available: String },

    #[error("Agent '{key}' not found. Available: {available}")]
    UnknownAgent { key: String, available: String },

    #[error("Model {model} does not support {capability}. Please select a model with {capability} support.")]
    UnsupportedAttachment {
        model: String,
        capability: &'static str,
    },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Storage error: {0}")]
    Storage(String),
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Owns in-memory conversation state and drives provider streams.
///
/// Only one response stream may be in flight per service instance at a
/// time; the presentation layer is responsible for not submitting a second
/// turn while one is outstanding.
pub struct ChatService {
    config: Arc<Config>,
    storage: Option<Storage>,
    knowledge: KnowledgeService,
    messages: Vec<Message>,
    current_model_key: String,
    current_agent_key: String,
    conversation_id: Option<String>,
    title_set: bool,
    #[cfg(test)]
    scripted: Option<crate::providers::scripted::ScriptedProvider>,
}

impl ChatService {
    pub fn new(config: Arc<Config>, storage: Option<Storage>, knowledge: KnowledgeService) -> Self {
        let current_model_key = config.app.default_model.clone();
        let current_agent_key = config.app.default_agent.clone();
        info!(
            "ChatService initialized with default model: {current_model_key}, \
             default agent: {current_agent_key}"
        );
        Self {
            config,
            storage,
            knowledge,
            messages: Vec::new(),
            current_model_key,
            current_agent_key,
            conversation_id: None,
            title_set: false,
            #[cfg(test)]
            scripted: None,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn history(&self) -> &[Message] {
        &self.messages
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn current_model_key(&self) -> &str {
        &self.current_model_key
    }

    pub fn current_agent_key(&self) -> &str {
        &self.current_agent_key
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn current_model_config(&self) -> Result<&ModelConfig, ChatError> {
        self.config
            .models
            .get(&self.current_model_key)
            .ok_or_else(|| ChatError::UnknownModel {
                key: self.current_model_key.clone(),
                available: murmur_core::config::sorted_keys(&self.config.models).join(", "),
            })
    }

    pub fn current_agent_config(&self) -> Result<&AgentConfig, ChatError> {
        self.config
            .agents
            .get(&self.current_agent_key)
            .ok_or_else(|| ChatError::UnknownAgent {
                key: self.current_agent_key.clone(),
                available: murmur_core::config::sorted_keys(&self.config.agents).join(", "),
            })
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    /// Switch the active model. An unknown key leaves the selection
    /// unchanged.
    pub fn set_model(&mut self, model_key: &str) -> Result<(), ChatError> {
        if !self.config.models.contains_key(model_key) {
            return Err(ChatError::UnknownModel {
                key: model_key.to_string(),
                available: murmur_core::config::sorted_keys(&self.config.models).join(", "),
            });
        }
        self.current_model_key = model_key.to_string();
        info!("Switched to model: {model_key}");
        Ok(())
    }

    /// Switch the active agent. An unknown key leaves the selection
    /// unchanged.
    pub fn set_agent(&mut self, agent_key: &str) -> Result<(), ChatError> {
        if !self.config.agents.contains_key(agent_key) {
            return Err(ChatError::UnknownAgent {
                key: agent_key.to_string(),
                available: murmur_core::config::sorted_keys(&self.config.agents).join(", "),
            });
        }
        self.current_agent_key = agent_key.to_string();
        info!("Switched to agent: {agent_key}");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Conversation lifecycle
    // -----------------------------------------------------------------------

    /// Start a new conversation. Returns the persisted conversation id
    /// when storage is enabled.
    pub fn new_conversation(&mut self) -> Result<Option<String>, ChatError> {
        self.messages.clear();
        self.conversation_id = None;
        self.title_set = false;

        if let Some(storage) = &self.storage {
            let record = storage
                .create_conversation("New Conversation", &self.current_model_key)
                .map_err(|e| ChatError::Storage(e.to_string()))?;
            info!("Created new conversation: {}", record.id);
            self.conversation_id = Some(record.id.clone());
            return Ok(Some(record.id));
        }
        Ok(None)
    }

    /// Load an existing conversation from storage, rebuilding in-memory
    /// history including attachment bytes. Returns false when storage is
    /// absent or the conversation does not exist.
    pub fn load_conversation(&mut self, conversation_id: &str) -> Result<bool, ChatError> {
        let Some(storage) = &self.storage else {
            warn!("Cannot load conversation: no storage configured");
            return Ok(false);
        };

        let stored = storage
            .get_conversation(conversation_id)
            .map_err(|e| ChatError::Storage(e.to_string()))?;
        let Some(stored) = stored else {
            warn!("Conversation not found: {conversation_id}");
            return Ok(false);
        };

        self.messages.clear();
        for persisted in &stored.messages {
            let mut images = Vec::new();
            let mut documents = Vec::new();
            for attachment in &persisted.attachments {
                let data = storage
                    .load_attachment_data(attachment)
                    .map_err(|e| ChatError::Storage(e.to_string()))?;
                match attachment.attachment_type {
                    persistence::AttachmentKind::Image => images.push(data),
                    persistence::AttachmentKind::Document => {
                        documents.push(Document::new(attachment.filename.clone(), data))
                    }
                }
            }

            let role = match persisted.role.as_str() {
                "assistant" => Role::Assistant,
                "system" => Role::System,
                _ => Role::User,
            };
            self.messages.push(Message::with_attachments(
                role,
                persisted.content.clone(),
                images,
                documents,
            ));
        }

        // Keep the selection invariant intact when the conversation was
        // saved under a model that no longer exists in configuration.
        if self.config.models.contains_key(&stored.record.model_key) {
            self.current_model_key = stored.record.model_key.clone();
        } else {
            warn!(
                "Conversation model '{}' is no longer configured; keeping '{}'",
                stored.record.model_key, self.current_model_key
            );
        }

        self.conversation_id = Some(conversation_id.to_string());
        self.title_set = true;

        info!(
            "Loaded conversation: {conversation_id} ({} messages)",
            self.messages.len()
        );
        Ok(true)
    }

    /// Clear history, starting a fresh persisted conversation when storage
    /// is enabled.
    pub fn clear_history(&mut self) -> Result<(), ChatError> {
        let message_count = self.messages.len();
        if self.storage.is_some() {
            self.new_conversation()?;
        } else {
            self.messages.clear();
            self.conversation_id = None;
            self.title_set = false;
        }
        info!("Cleared conversation history ({message_count} messages)");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    /// Append a turn to history and, when enabled, to persistence.
    /// Reasoning is persisted as auxiliary data only; it never becomes a
    /// future turn's content.
    pub fn add_message(
        &mut self,
        role: Role,
        content: impl Into<String>,
        images: Vec<Vec<u8>>,
        documents: Vec<Document>,
        reasoning: Option<String>,
    ) -> Result<(), ChatError> {
        let content = content.into();

        if let (Some(storage), Some(conversation_id)) = (&self.storage, &self.conversation_id) {
            let document_tuples: Vec<(String, Vec<u8>)> = documents
                .iter()
                .map(|d| (d.filename.clone(), d.bytes.clone()))
                .collect();
            storage
                .add_message(
                    conversation_id,
                    role.as_str(),
                    &content,
                    reasoning.as_deref(),
                    &images,
                    &document_tuples,
                )
                .map_err(|e| ChatError::Storage(e.to_string()))?;

            if role == Role::User && !self.title_set {
                let title = persistence::generate_title(&content, 50);
                storage
                    .update_conversation_title(conversation_id, &title)
                    .map_err(|e| ChatError::Storage(e.to_string()))?;
                self.title_set = true;
                debug!("Set conversation title: {title}");
            }
        }

        self.messages
            .push(Message::with_attachments(role, content, images, documents));
        info!(
            "Added {role} message to history (total: {})",
            self.messages.len()
        );
        Ok(())
    }

    /// Build the outbound message list: optional agent system prompt
    /// (with injected knowledge) followed by the full history.
    async fn build_outbound(&mut self, user_text: &str) -> Vec<Message> {
        let Some(agent) = self.config.agents.get(&self.current_agent_key).cloned() else {
            return self.messages.clone();
        };

        let mut outbound = Vec::new();
        if !agent.instructions.is_empty() {
            let mut system_content = agent.instructions.clone();

            if agent.inject_knowledge_automatically && !agent.knowledge_sources.is_empty() {
                let parts = self
                    .knowledge
                    .fetch_relevant_knowledge(user_text, &agent, MAX_KNOWLEDGE_SOURCES)
                    .await;
                if !parts.is_empty() {
                    let knowledge_text = parts
                        .iter()
                        .map(|(name, content)| format!("### Reference: {name}\n{content}"))
                        .collect::<Vec<_>>()
                        .join("\n\n");
                    system_content.push_str(&format!("\n\n## Relevant Knowledge\n\n{knowledge_text}"));
                    debug!("Injected {} knowledge source(s) into system prompt", parts.len());
                }
            }

            debug!("Added system prompt ({} chars)", system_content.len());
            outbound.push(Message::text(Role::System, system_content));
        }

        outbound.extend(self.messages.iter().cloned());
        outbound
    }

    // -----------------------------------------------------------------------
    // Streaming
    // -----------------------------------------------------------------------

    /// Send a user turn and stream the assistant's answer.
    ///
    /// Capability gating happens before any history mutation or network
    /// call. The user turn is recorded once gating passes, even if the
    /// request later fails; the assistant turn is recorded only after the
    /// stream completes with visible content. Dropping the stream abandons
    /// the response: partial content is discarded, not committed.
    pub fn stream_response(
        &mut self,
        user_text: String,
        images: Vec<Vec<u8>>,
        documents: Vec<Document>,
    ) -> impl Stream<Item = Result<StreamChunk, ChatError>> + '_ {
        try_stream! {
            let model_config = self.current_model_config()?.clone();

            #[cfg(test)]
            let provider = match self.scripted.take() {
                Some(scripted) => Provider::Scripted(scripted),
                None => Provider::from_config(&model_config)?,
            };
            #[cfg(not(test))]
            let provider = Provider::from_config(&model_config)?;

            // Capability gating, before any history mutation or network call.
            if !images.is_empty() && !provider.supports_feature("images") {
                warn!("Model {} does not support images", model_config.name);
                Err(ChatError::UnsupportedAttachment {
                    model: model_config.name.clone(),
                    capability: "images",
                })?;
            }
            if !documents.is_empty() && !provider.supports_feature("documents") {
                warn!("Model {} does not support documents", model_config.name);
                Err(ChatError::UnsupportedAttachment {
                    model: model_config.name.clone(),
                    capability: "documents",
                })?;
            }

            // The user turn is recorded unconditionally from here on, so a
            // later network failure still leaves it in history.
            self.add_message(Role::User, user_text.clone(), images, documents, None)?;

            let outbound = self.build_outbound(&user_text).await;

            info!(
                "Streaming response from {} with agent '{}' (conversation length: {})",
                model_config.name,
                self.current_agent_key,
                self.messages.len()
            );

            let mut stream = provider
                .stream_chat(&outbound, model_config.max_tokens, model_config.temperature)
                .await?;

            let mut assistant_content = String::new();
            let mut assistant_reasoning = String::new();

            while let Some(item) = stream.next().await {
                let chunk = item?;
                if !chunk.content.is_empty() {
                    assistant_content.push_str(&chunk.content);
                }
                if !chunk.reasoning.is_empty() {
                    assistant_reasoning.push_str(&chunk.reasoning);
                }
                yield chunk;
            }

            if !assistant_content.is_empty() {
                let mut content = assistant_content;
                let mut reasoning = assistant_reasoning;

                // Local models may inline their reasoning in the answer text.
                if reasoning.is_empty() && has_reasoning_tags(&content) {
                    let (extracted, cleaned) = extract_reasoning_tags(&content);
                    if let Some(extracted) = extracted {
                        reasoning = extracted;
                        content = cleaned;
                    }
                }

                let reasoning = if reasoning.is_empty() {
                    None
                } else {
                    Some(reasoning)
                };
                self.add_message(Role::Assistant, content, Vec::new(), Vec::new(), reasoning)?;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn set_scripted_provider(
        &mut self,
        provider: crate::providers::scripted::ScriptedProvider,
    ) {
        self.scripted = Some(provider);
    }

    #[cfg(test)]
    pub(crate) async fn build_outbound_for_test(&mut self, user_text: &str) -> Vec<Message> {
        self.build_outbound(user_text).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
