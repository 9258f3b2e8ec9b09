//! Provider for OpenAI-compatible endpoints (Ollama, LM Studio, llama.cpp,
//! vLLM and friends).
//!
//! Speaks the `/chat/completions` streaming protocol: a JSON POST with
//! `stream: true`, answered with Server-Sent-Events terminated by a literal
//! `data: [DONE]` line.

use std::time::Duration;

use async_stream::try_stream;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use murmur_core::config::ModelConfig;

use super::{ChunkStream, ProviderError};
use crate::types::{sniff_image_format, Document, Message, Role, StreamChunk};

const CONNECT_TIMEOUT_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// Wire types (serialization)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequestBody {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: WireContent,
}

/// Plain messages use a bare string; messages with attachments use a
/// content-part array. The two encodings are not interchangeable, so the
/// distinction is kept at the type level.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

// ---------------------------------------------------------------------------
// Wire types (deserialization)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SseFrame {
    #[serde(default)]
    choices: Vec<SseChoice>,
}

#[derive(Debug, Deserialize)]
struct SseChoice {
    #[serde(default)]
    delta: Option<SseDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SseDelta {
    #[serde(default)]
    content: Option<String>,
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Adapter for a self-hosted OpenAI-protocol endpoint. Capability support
/// is declared in configuration, not inferred; local servers have no
/// discoverable naming convention.
#[derive(Debug)]
pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    display_name: String,
    base_url: String,
    model: String,
    api_key: String,
    supports_images: bool,
    supports_documents: bool,
    supports_reasoning: bool,
}

impl OpenAiCompatibleProvider {
    pub fn new(config: &ModelConfig) -> Result<Self, ProviderError> {
        let base_url = config
            .base_url
            .clone()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                ProviderError::Provider(format!(
                    "OpenAI-compatible provider requires base_url for {}",
                    config.name
                ))
            })?;
        let model = config
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| {
                ProviderError::Provider(format!(
                    "OpenAI-compatible provider requires model for {}",
                    config.name
                ))
            })?;

        let base_url = base_url.trim_end_matches('/').to_string();
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.is_empty())
            .unwrap_or_else(|| "not-needed".to_string());

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        info!(
            "Initialized OpenAI-compatible provider: {} (base_url={base_url}, model={model})",
            config.name
        );

        Ok(Self {
            client,
            display_name: config.name.clone(),
            base_url,
            model,
            api_key,
            supports_images: config.supports_images,
            supports_documents: config.supports_documents,
            supports_reasoning: config.supports_reasoning,
        })
    }

    /// Stream a chat completion. One network call, no retries.
    pub async fn stream_chat(
        &self,
        messages: &[Message],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<ChunkStream, ProviderError> {
        let endpoint = format!("{}/chat/completions", self.base_url);
        let body = ChatRequestBody {
            model: self.model.clone(),
            messages: convert_messages(messages),
            max_tokens,
            temperature,
            stream: true,
        };

        info!(
            "Starting chat stream: model={}, messages={}, max_tokens={max_tokens}",
            self.model,
            messages.len()
        );

        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if let Some(err) = self.classify_status(status) {
            let body_text = response.text().await.unwrap_or_default();
            error!("HTTP {status} from {}: {body_text}", self.display_name);
            return Err(err);
        }

        debug!("Stream started successfully");
        Ok(parse_sse_stream(
            response.bytes_stream(),
            self.display_name.clone(),
        ))
    }

    /// Map a pre-stream HTTP status to an error, or None for success.
    fn classify_status(&self, status: reqwest::StatusCode) -> Option<ProviderError> {
        match status.as_u16() {
            401 => Some(ProviderError::Authentication(format!(
                "Authentication failed for {}",
                self.display_name
            ))),
            429 => Some(ProviderError::RateLimit(format!(
                "Rate limit exceeded for {}",
                self.display_name
            ))),
            code if code >= 400 => Some(ProviderError::Provider(format!(
                "Provider error: HTTP {status}"
            ))),
            _ => None,
        }
    }

    fn map_transport_error(&self, error: reqwest::Error) -> ProviderError {
        if error.is_connect() {
            ProviderError::Connection(format!(
                "Cannot connect to {} at {}. Is the server running?",
                self.display_name, self.base_url
            ))
        } else if error.is_timeout() {
            ProviderError::Connection(format!("Request to {} timed out", self.display_name))
        } else {
            ProviderError::Provider(format!("Unexpected error: {error}"))
        }
    }

    /// Capability support comes straight from the model's declared flags.
    pub fn supports_feature(&self, feature: &str) -> bool {
        match feature {
            "images" => self.supports_images,
            "documents" => self.supports_documents,
            "reasoning" => self.supports_reasoning,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Message translation
// ---------------------------------------------------------------------------

fn convert_messages(messages: &[Message]) -> Vec<WireMessage> {
    messages
        .iter()
        .map(|msg| {
            // System messages are simple text only.
            if msg.role == Role::System || !msg.has_attachments() {
                return WireMessage {
                    role: msg.role.as_str(),
                    content: WireContent::Text(msg.content.clone()),
                };
            }

            let mut parts = Vec::new();
            if !msg.content.is_empty() {
                parts.push(ContentPart::Text {
                    text: msg.content.clone(),
                });
            }
            for image in &msg.images {
                let format = sniff_image_format(image);
                let data_url = format!(
                    "data:{};base64,{}",
                    format.mime_type(),
                    BASE64.encode(image)
                );
                debug!(
                    "Added image (format: {}, size: {} bytes)",
                    format.as_str(),
                    image.len()
                );
                parts.push(ContentPart::ImageUrl {
                    image_url: ImageUrl { url: data_url },
                });
            }
            for document in &msg.documents {
                parts.push(document_part(document));
            }

            WireMessage {
                role: msg.role.as_str(),
                content: WireContent::Parts(parts),
            }
        })
        .collect()
}

/// Plain-text and markdown documents are inlined verbatim; everything else
/// is represented by its header alone (extraction lives elsewhere).
fn document_part(document: &Document) -> ContentPart {
    let name = &document.filename;
    if name.ends_with(".txt") || name.ends_with(".md") {
        match std::str::from_utf8(&document.bytes) {
            Ok(text) => {
                debug!("Added text document: {name} ({} chars)", text.len());
                return ContentPart::Text {
                    text: format!("\n\n[Document: {name}]\n{text}\n"),
                };
            }
            Err(e) => warn!("Failed to decode document {name}: {e}"),
        }
    }
    ContentPart::Text {
        text: format!("\n\n[Document: {name}]\n"),
    }
}

// ---------------------------------------------------------------------------
// SSE parsing
// ---------------------------------------------------------------------------

/// Parse an SSE response body line by line into a [`ChunkStream`].
///
/// Blank lines and `:` comments are skipped. `data: [DONE]` terminates the
/// stream; malformed JSON on a data line is logged and skipped, not fatal.
fn parse_sse_stream<S, B>(source: S, provider_name: String) -> ChunkStream
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    Box::pin(try_stream! {
        let mut source = Box::pin(source);

        let mut buffer = String::new();
        let mut finished = false;

        'read: while let Some(chunk) = source.next().await {
            let bytes = chunk.map_err(|e| {
                ProviderError::Connection(format!(
                    "Stream read failed for {provider_name}: {e}"
                ))
            })?;
            buffer.push_str(&String::from_utf8_lossy(bytes.as_ref()));

            while let Some(newline_at) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline_at).collect();
                let line = line.trim();

                // Skip empty lines and SSE comments.
                if line.is_empty() || line.starts_with(':') {
                    continue;
                }
                let data = match line.strip_prefix("data: ") {
                    Some(data) => data.trim(),
                    None => continue,
                };

                if data == "[DONE]" {
                    debug!("Received [DONE] marker");
                    yield StreamChunk::done();
                    finished = true;
                    break 'read;
                }

                match serde_json::from_str::<SseFrame>(data) {
                    Ok(frame) => {
                        if let Some(choice) = frame.choices.first() {
                            let content = choice
                                .delta
                                .as_ref()
                                .and_then(|d| d.content.clone())
                                .unwrap_or_default();
                            if !content.is_empty() {
                                yield StreamChunk::content(content);
                            }
                            if let Some(reason) = &choice.finish_reason {
                                debug!("Stream finished: {reason}");
                                yield StreamChunk::done();
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Failed to parse SSE data line: {e}");
                    }
                }
            }
        }

        // Connection closed without [DONE]; still mark the end.
        if !finished {
            yield StreamChunk::done();
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
