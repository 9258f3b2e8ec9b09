//! Provider adapters and the shared streaming contract.
//!
//! Exactly two backend kinds exist, so the seam is a closed enum dispatched
//! by match rather than an open trait-object registry. The factory is
//! [`Provider::from_config`].

pub mod bedrock;
pub mod eventstream;
pub mod openai_compatible;

use std::pin::Pin;

use futures::Stream;
use murmur_core::config::{ModelConfig, ProviderKind};

use crate::types::{Message, StreamChunk};

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Errors either backend may surface. Messages identify the offending
/// model by its configured display name.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Credentials or access invalid; not retryable without operator action.
    #[error("{0}")]
    Authentication(String),

    /// Transport failure, including timeouts; retryable.
    #[error("{0}")]
    Connection(String),

    /// Throttled; retryable after backoff. This core never retries itself.
    #[error("{0}")]
    RateLimit(String),

    /// Vendor-specific or unexpected failure.
    #[error("{0}")]
    Provider(String),
}

// ---------------------------------------------------------------------------
// Streaming contract
// ---------------------------------------------------------------------------

/// The async sequence a provider yields for one chat completion.
///
/// Pull-driven: every wire read is a suspension point, chunks arrive in
/// wire order, and nothing is buffered ahead. Dropping the stream is the
/// way to abandon a response early.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

// ---------------------------------------------------------------------------
// Provider dispatch
// ---------------------------------------------------------------------------

/// A constructed backend adapter. Immutable after construction and used
/// for exactly one streaming call; concurrent calls each build their own.
pub enum Provider {
    Bedrock(bedrock::BedrockProvider),
    OpenaiCompatible(openai_compatible::OpenAiCompatibleProvider),
    #[cfg(test)]
    Scripted(scripted::ScriptedProvider),
}

impl Provider {
    /// Construct the adapter matching a model's provider tag.
    pub fn from_config(config: &ModelConfig) -> Result<Self, ProviderError> {
        match config.provider {
            ProviderKind::Bedrock => Ok(Provider::Bedrock(bedrock::BedrockProvider::new(config)?)),
            ProviderKind::OpenaiCompatible => Ok(Provider::OpenaiCompatible(
                openai_compatible::OpenAiCompatibleProvider::new(config)?,
            )),
        }
    }

    /// Stream a chat completion for the given history.
    pub async fn stream_chat(
        &self,
        messages: &[Message],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<ChunkStream, ProviderError> {
        match self {
            Provider::Bedrock(p) => p.stream_chat(messages, max_tokens, temperature).await,
            Provider::OpenaiCompatible(p) => p.stream_chat(messages, max_tokens, temperature).await,
            #[cfg(test)]
            Provider::Scripted(p) => p.stream_chat(),
        }
    }

    /// Whether the selected model supports a named feature
    /// ("images", "documents", "reasoning"). Unknown names are false.
    pub fn supports_feature(&self, feature: &str) -> bool {
        match self {
            Provider::Bedrock(p) => p.supports_feature(feature),
            Provider::OpenaiCompatible(p) => p.supports_feature(feature),
            #[cfg(test)]
            Provider::Scripted(p) => p.supports_feature(feature),
        }
    }
}

// ---------------------------------------------------------------------------
// Scripted provider (test support)
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_core::config::ProviderKind;

    fn openai_config() -> ModelConfig {
        ModelConfig {
            provider: ProviderKind::OpenaiCompatible,
            name: "Local Llama".into(),
            supports_images: true,
            supports_documents: false,
            supports_reasoning: false,
            max_tokens: 2048,
            temperature: 0.7,
            model_id: None,
            region: None,
            base_url: Some("http://localhost:11434/v1".into()),
            model: Some("llama3".into()),
            api_key: None,
        }
    }

    fn bedrock_config() -> ModelConfig {
        ModelConfig {
            provider: ProviderKind::Bedrock,
            name: "Claude Sonnet".into(),
            supports_images: false,
            supports_documents: false,
            supports_reasoning: false,
            max_tokens: 4096,
            temperature: 0.7,
            model_id: Some("anthropic.claude-3-5-sonnet-20241022-v2:0".into()),
            region: Some("us-east-1".into()),
            base_url: None,
            model: None,
            api_key: Some("test-bearer-token".into()),
        }
    }

    #[test]
    fn factory_builds_openai_compatible() {
        let provider = Provider::from_config(&openai_config()).unwrap();
        assert!(matches!(provider, Provider::OpenaiCompatible(_)));
    }

    #[test]
    fn factory_builds_bedrock() {
        let provider = Provider::from_config(&bedrock_config()).unwrap();
        assert!(matches!(provider, Provider::Bedrock(_)));
    }

    #[test]
    fn factory_delegates_feature_flags() {
        let provider = Provider::from_config(&openai_config()).unwrap();
        assert!(provider.supports_feature("images"));
        assert!(!provider.supports_feature("documents"));
        assert!(!provider.supports_feature("telepathy"));
    }

    #[test]
    fn factory_mapping_is_deterministic() {
        for _ in 0..3 {
            assert!(matches!(
                Provider::from_config(&bedrock_config()).unwrap(),
                Provider::Bedrock(_)
            ));
            assert!(matches!(
                Provider::from_config(&openai_config()).unwrap(),
                Provider::OpenaiCompatible(_)
            ));
        }
    }
}
