//! AWS Bedrock provider, streaming over the `converse-stream` REST API.
//!
//! The response body is the binary event-stream framing decoded by
//! [`super::eventstream`]. Content arrives as typed events keyed by a
//! content-block index; a block's reasoning/text classification is only
//! announced on its `contentBlockStart` event, so the demultiplexer keeps
//! a call-local map from block index to classification.

use std::collections::HashMap;
use std::time::Duration;

use async_stream::try_stream;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use murmur_core::config::ModelConfig;

use super::{eventstream, ChunkStream, ProviderError};
use crate::types::{sniff_image_format, Message, Role, StreamChunk};

const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Environment fallback for the bearer credential when the model entry
/// does not carry one.
pub const BEDROCK_TOKEN_ENV: &str = "AWS_BEARER_TOKEN_BEDROCK";

// ---------------------------------------------------------------------------
// Wire types (serialization)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ConverseRequest {
    messages: Vec<ConverseMessage>,
    #[serde(rename = "inferenceConfig")]
    inference_config: InferenceConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<Vec<SystemBlock>>,
}

#[derive(Debug, Serialize)]
struct ConverseMessage {
    role: String,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum ContentBlock {
    Text(String),
    Image(ImageBlock),
}

#[derive(Debug, Serialize)]
struct ImageBlock {
    format: String,
    source: ImageSource,
}

#[derive(Debug, Serialize)]
struct ImageSource {
    /// Base64-encoded image data.
    bytes: String,
}

#[derive(Debug, Serialize)]
struct SystemBlock {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InferenceConfig {
    max_tokens: u32,
    temperature: f32,
}

// ---------------------------------------------------------------------------
// Wire types (deserialization)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentBlockStartPayload {
    #[serde(default)]
    content_block_index: u64,
    #[serde(default)]
    start: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentBlockDeltaPayload {
    #[serde(default)]
    content_block_index: u64,
    #[serde(default)]
    delta: Option<DeltaPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeltaPayload {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    reasoning_content: Option<ReasoningDelta>,
}

#[derive(Debug, Deserialize)]
struct ReasoningDelta {
    #[serde(default)]
    text: Option<String>,
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Bedrock adapter. Holds resolved endpoint and credential data derived
/// from configuration; immutable after construction.
#[derive(Debug)]
pub struct BedrockProvider {
    client: reqwest::Client,
    display_name: String,
    model_id: String,
    region: String,
    api_key: String,
}

impl BedrockProvider {
    pub fn new(config: &ModelConfig) -> Result<Self, ProviderError> {
        let model_id = config
            .model_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                ProviderError::Provider(format!(
                    "Bedrock provider requires model_id in config for {}",
                    config.name
                ))
            })?;

        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.is_empty())
            .or_else(|| std::env::var(BEDROCK_TOKEN_ENV).ok().filter(|key| !key.is_empty()))
            .ok_or_else(|| {
                ProviderError::Authentication(format!(
                    "AWS credentials not configured for {}. \
                     Set api_key in the model config or export {BEDROCK_TOKEN_ENV}.",
                    config.name
                ))
            })?;

        let region = config
            .region
            .clone()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "us-east-1".to_string());

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        info!("Bedrock provider initialized: model={model_id}, region={region}");
        Ok(Self {
            client,
            display_name: config.name.clone(),
            model_id,
            region,
            api_key,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "https://bedrock-runtime.{}.amazonaws.com/model/{}/converse-stream",
            self.region,
            urlencoding::encode(&self.model_id)
        )
    }

    /// Convert the message history to the converse API shape. System turns
    /// go into the dedicated `system` field; the API only accepts user and
    /// assistant roles inside `messages`.
    fn build_request(
        &self,
        messages: &[Message],
        max_tokens: u32,
        temperature: f32,
    ) -> ConverseRequest {
        let system_texts: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let system = if system_texts.is_empty() {
            None
        } else {
            Some(vec![SystemBlock {
                text: system_texts.join("\n\n"),
            }])
        };

        let converse_messages = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                let mut content = vec![ContentBlock::Text(m.content.clone())];
                for image in &m.images {
                    let format = sniff_image_format(image);
                    content.push(ContentBlock::Image(ImageBlock {
                        format: format.as_str().to_string(),
                        source: ImageSource {
                            bytes: BASE64.encode(image),
                        },
                    }));
                }
                for document in &m.documents {
                    // No extraction at this layer; the document service owns that.
                    content.push(ContentBlock::Text(format!(
                        "[Document: {}]",
                        document.filename
                    )));
                }
                ConverseMessage {
                    role: m.role.as_str().to_string(),
                    content,
                }
            })
            .collect();

        ConverseRequest {
            messages: converse_messages,
            inference_config: InferenceConfig {
                max_tokens,
                temperature,
            },
            system,
        }
    }

    /// Stream a chat completion. One network call, no retries; failures
    /// surface immediately.
    pub async fn stream_chat(
        &self,
        messages: &[Message],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<ChunkStream, ProviderError> {
        let body = self.build_request(messages, max_tokens, temperature);

        info!(
            "Starting Bedrock stream: model={}, messages={}, max_tokens={max_tokens}",
            self.model_id,
            messages.len()
        );

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .header("accept", "application/vnd.amazon.eventstream")
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_code = response
                .headers()
                .get("x-amzn-errortype")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.split(':').next().unwrap_or(v).to_string())
                .unwrap_or_default();
            let body_text = response.text().await.unwrap_or_default();
            warn!("Bedrock request failed: {status} {error_code}");
            return Err(self.map_api_error(status, &error_code, &body_text));
        }

        debug!("Bedrock stream response received");
        Ok(demux_event_stream(
            response.bytes_stream(),
            self.display_name.clone(),
        ))
    }

    fn map_transport_error(&self, error: reqwest::Error) -> ProviderError {
        if error.is_timeout() {
            ProviderError::Connection(format!("Request to {} timed out", self.display_name))
        } else if error.is_connect() {
            ProviderError::Connection(format!(
                "Cannot connect to AWS Bedrock in region {}. \
                 Please check your network connection.",
                self.region
            ))
        } else {
            ProviderError::Provider(format!(
                "Unexpected Bedrock error for {}: {error}",
                self.display_name
            ))
        }
    }

    /// Map a request-level client error by its vendor code, falling back to
    /// the HTTP status when no code is present.
    fn map_api_error(
        &self,
        status: reqwest::StatusCode,
        error_code: &str,
        body: &str,
    ) -> ProviderError {
        match error_code {
            "UnrecognizedClientException" | "InvalidSignatureException" => {
                ProviderError::Authentication(format!(
                    "AWS authentication failed for {}. Please check your credentials.",
                    self.display_name
                ))
            }
            "ThrottlingException" => ProviderError::RateLimit(format!(
                "Rate limit exceeded for {}. Please try again later.",
                self.display_name
            )),
            "AccessDeniedException" | "ResourceNotFoundException" => {
                ProviderError::Authentication(format!(
                    "Access denied to model {}. \
                     Please check model access in the AWS Bedrock console.",
                    self.model_id
                ))
            }
            "" => match status.as_u16() {
                401 | 403 => ProviderError::Authentication(format!(
                    "AWS authentication failed for {}. Please check your credentials.",
                    self.display_name
                )),
                429 => ProviderError::RateLimit(format!(
                    "Rate limit exceeded for {}. Please try again later.",
                    self.display_name
                )),
                _ => ProviderError::Provider(format!(
                    "Bedrock error {status}: {}",
                    error_message_from_body(body.as_bytes())
                )),
            },
            _ => ProviderError::Provider(format!(
                "Bedrock error: {}",
                error_message_from_body(body.as_bytes())
            )),
        }
    }

    /// Capability heuristics over the model identifier. Bedrock has no
    /// per-model capability flags, so support is inferred from which model
    /// family the identifier addresses.
    pub fn supports_feature(&self, feature: &str) -> bool {
        let model_id = self.model_id.to_lowercase();
        match feature {
            "images" | "documents" => model_id.contains("claude"),
            "reasoning" => model_id.contains("extended") || model_id.contains("thinking"),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Stream demultiplexing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Reasoning,
}

/// Turn the raw response byte stream into a [`ChunkStream`].
///
/// The classification map lives inside the returned stream, scoped to this
/// one call; the adapter itself stays call-stateless.
fn demux_event_stream<S, B>(source: S, provider_name: String) -> ChunkStream
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    Box::pin(try_stream! {
        let mut source = Box::pin(source);

        let mut buffer: Vec<u8> = Vec::new();
        let mut classifications: HashMap<u64, BlockKind> = HashMap::new();
        let mut finished = false;

        'read: while let Some(chunk) = source.next().await {
            let bytes = chunk.map_err(|e| {
                ProviderError::Connection(format!(
                    "Stream read failed for {provider_name}: {e}"
                ))
            })?;
            buffer.extend_from_slice(bytes.as_ref());

            loop {
                let step = eventstream::decode_frame(&buffer).map_err(|e| {
                    ProviderError::Provider(format!(
                        "Corrupt event stream from {provider_name}: {e}"
                    ))
                })?;
                let (frame, consumed) = match step {
                    Some(decoded) => decoded,
                    None => break,
                };
                buffer.drain(..consumed);

                for out in process_frame(&frame, &mut classifications, &provider_name)? {
                    let is_terminal = out.done;
                    yield out;
                    if is_terminal {
                        finished = true;
                        break 'read;
                    }
                }
            }
        }

        // Connection closed without a terminal event; still mark the end.
        if !finished {
            yield StreamChunk::done();
        }
    })
}

/// Translate one decoded frame into zero or more chunks, updating the
/// block classification map. An exception frame aborts the stream.
fn process_frame(
    frame: &eventstream::Frame,
    classifications: &mut HashMap<u64, BlockKind>,
    provider_name: &str,
) -> Result<Vec<StreamChunk>, ProviderError> {
    if frame.message_type() == Some("exception") {
        let kind = frame.exception_type().unwrap_or("unknown");
        let detail = error_message_from_body(&frame.payload);
        return Err(ProviderError::Provider(format!(
            "Stream error from {provider_name}: {kind}: {detail}"
        )));
    }

    match frame.event_type().unwrap_or("") {
        "contentBlockStart" => {
            if let Ok(payload) =
                serde_json::from_slice::<ContentBlockStartPayload>(&frame.payload)
            {
                if let Some(start) = &payload.start {
                    let kind = classify_start(start);
                    if kind == BlockKind::Reasoning {
                        debug!(
                            "Detected reasoning block at index {}",
                            payload.content_block_index
                        );
                    }
                    classifications.insert(payload.content_block_index, kind);
                }
            }
            Ok(Vec::new())
        }

        "contentBlockDelta" => match serde_json::from_slice::<ContentBlockDeltaPayload>(
            &frame.payload,
        ) {
            Ok(payload) => {
                let mut out = Vec::new();
                if let Some(delta) = payload.delta {
                    // Classification was recorded at block start; unclassified
                    // indexes are treated as visible text.
                    let is_reasoning = matches!(
                        classifications.get(&payload.content_block_index),
                        Some(BlockKind::Reasoning)
                    );
                    if let Some(text) = delta.text {
                        out.push(if is_reasoning {
                            StreamChunk::reasoning(text)
                        } else {
                            StreamChunk::content(text)
                        });
                    }
                    if let Some(reasoning) = delta.reasoning_content {
                        if let Some(text) = reasoning.text {
                            out.push(StreamChunk::reasoning(text));
                        }
                    }
                }
                Ok(out)
            }
            Err(e) => {
                debug!("Skipping malformed contentBlockDelta payload: {e}");
                Ok(Vec::new())
            }
        },

        "messageStop" => Ok(vec![StreamChunk::done()]),

        "metadata" => {
            let has_stop_reason = serde_json::from_slice::<serde_json::Value>(&frame.payload)
                .ok()
                .map(|v| v.get("stopReason").is_some())
                .unwrap_or(false);
            if has_stop_reason {
                Ok(vec![StreamChunk::done()])
            } else {
                Ok(Vec::new())
            }
        }

        other => {
            debug!("Ignoring Bedrock event type {other:?}");
            Ok(Vec::new())
        }
    }
}

fn classify_start(start: &serde_json::Value) -> BlockKind {
    let rendered = start.to_string().to_lowercase();
    if rendered.contains("reasoning") || rendered.contains("thinking") {
        BlockKind::Reasoning
    } else {
        BlockKind::Text
    }
}

/// Pull a human-readable message out of an AWS error body.
fn error_message_from_body(body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        for key in ["message", "Message"] {
            if let Some(message) = value.get(key).and_then(|m| m.as_str()) {
                return message.to_string();
            }
        }
    }
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if trimmed.chars().count() > 200 {
        let head: String = trimmed.chars().take(200).collect();
        format!("{head}...")
    } else {
        trimmed.to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::eventstream::{encode_event, encode_frame};
    use crate::types::Document;
    use murmur_core::config::ProviderKind;

    fn test_config() -> ModelConfig {
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

    fn test_provider() -> BedrockProvider {
        BedrockProvider::new(&test_config()).unwrap()
    }

    async fn collect(stream: ChunkStream) -> Vec<Result<StreamChunk, ProviderError>> {
        stream.collect::<Vec<_>>().await
    }

    // -- Construction --

    #[test]
    fn new_requires_model_id() {
        let mut config = test_config();
        config.model_id = None;
        let err = BedrockProvider::new(&config).unwrap_err();
        assert!(matches!(err, ProviderError::Provider(_)));
        assert!(err.to_string().contains("model_id"));
    }

    #[test]
    fn new_without_credentials_is_authentication_error() {
        if std::env::var(BEDROCK_TOKEN_ENV).is_ok() {
            // Ambient credentials would make this pass construction.
            return;
        }
        let mut config = test_config();
        config.api_key = None;
        let err = BedrockProvider::new(&config).unwrap_err();
        assert!(matches!(err, ProviderError::Authentication(_)));
    }

    #[test]
    fn region_defaults_to_us_east_1() {
        let mut config = test_config();
        config.region = None;
        let provider = BedrockProvider::new(&config).unwrap();
        assert!(provider.endpoint().contains("bedrock-runtime.us-east-1"));
    }

    #[test]
    fn endpoint_encodes_model_id() {
        let provider = test_provider();
        let url = provider.endpoint();
        assert!(url.ends_with("/converse-stream"));
        // The ':0' suffix in the model id must be percent-encoded.
        assert!(url.contains("anthropic.claude-3-5-sonnet-20241022-v2%3A0"));
    }

    // -- Request building --

    #[test]
    fn build_request_basic_shape() {
        let provider = test_provider();
        let messages = vec![
            Message::text(Role::User, "Hello"),
            Message::text(Role::Assistant, "Hi!"),
        ];
        let body = provider.build_request(&messages, 1024, 0.5);
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["inferenceConfig"]["maxTokens"], 1024);
        assert_eq!(json["inferenceConfig"]["temperature"], 0.5);
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"][0]["text"], "Hello");
        assert_eq!(json["messages"][1]["role"], "assistant");
        assert!(json.get("system").is_none());
    }

    #[test]
    fn build_request_lifts_system_messages() {
        let provider = test_provider();
        let messages = vec![
            Message::text(Role::System, "Be concise."),
            Message::text(Role::User, "Hi"),
        ];
        let body = provider.build_request(&messages, 4096, 0.7);
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["system"][0]["text"], "Be concise.");
        let messages_json = json["messages"].as_array().unwrap();
        assert_eq!(messages_json.len(), 1);
        assert_eq!(messages_json[0]["role"], "user");
    }

    #[test]
    fn build_request_sniffs_image_format() {
        let provider = test_provider();
        let jpeg = b"\xff\xd8\xff\xe0rest".to_vec();
        let messages = vec![Message::with_attachments(
            Role::User,
            "look",
            vec![jpeg.clone()],
            vec![],
        )];
        let body = provider.build_request(&messages, 4096, 0.7);
        let json = serde_json::to_value(&body).unwrap();

        let image = &json["messages"][0]["content"][1]["image"];
        assert_eq!(image["format"], "jpeg");
        assert_eq!(image["source"]["bytes"], BASE64.encode(&jpeg));
    }

    #[test]
    fn build_request_documents_become_placeholders() {
        let provider = test_provider();
        let messages = vec![Message::with_attachments(
            Role::User,
            "read this",
            vec![],
            vec![Document::new("report.pdf", vec![1, 2, 3])],
        )];
        let body = provider.build_request(&messages, 4096, 0.7);
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(
            json["messages"][0]["content"][1]["text"],
            "[Document: report.pdf]"
        );
    }

    // -- Capability heuristics --

    #[test]
    fn supports_images_and_documents_for_claude() {
        let provider = test_provider();
        assert!(provider.supports_feature("images"));
        assert!(provider.supports_feature("documents"));
        assert!(!provider.supports_feature("reasoning"));
        assert!(!provider.supports_feature("unknown"));
    }

    #[test]
    fn supports_reasoning_for_thinking_models() {
        let mut config = test_config();
        config.model_id = Some("anthropic.claude-extended-thinking-v1".into());
        let provider = BedrockProvider::new(&config).unwrap();
        assert!(provider.supports_feature("reasoning"));
    }

    #[test]
    fn non_claude_model_supports_nothing() {
        let mut config = test_config();
        config.model_id = Some("amazon.titan-text-express-v1".into());
        let provider = BedrockProvider::new(&config).unwrap();
        assert!(!provider.supports_feature("images"));
        assert!(!provider.supports_feature("documents"));
    }

    // -- Error mapping --

    #[test]
    fn vendor_code_mapping_is_deterministic() {
        let provider = test_provider();
        let cases: Vec<(&str, fn(&ProviderError) -> bool)> = vec![
            ("ThrottlingException", |e| {
                matches!(e, ProviderError::RateLimit(_))
            }),
            ("UnrecognizedClientException", |e| {
                matches!(e, ProviderError::Authentication(_))
            }),
            ("InvalidSignatureException", |e| {
                matches!(e, ProviderError::Authentication(_))
            }),
            ("AccessDeniedException", |e| {
                matches!(e, ProviderError::Authentication(_))
            }),
            ("ResourceNotFoundException", |e| {
                matches!(e, ProviderError::Authentication(_))
            }),
            ("ValidationException", |e| {
                matches!(e, ProviderError::Provider(_))
            }),
        ];

        for (code, check) in cases {
            for _ in 0..2 {
                let err = provider.map_api_error(
                    reqwest::StatusCode::BAD_REQUEST,
                    code,
                    r#"{"message":"details"}"#,
                );
                assert!(check(&err), "code {code} mapped to {err:?}");
            }
        }
    }

    #[test]
    fn status_fallback_without_vendor_code() {
        let provider = test_provider();
        assert!(matches!(
            provider.map_api_error(reqwest::StatusCode::UNAUTHORIZED, "", ""),
            ProviderError::Authentication(_)
        ));
        assert!(matches!(
            provider.map_api_error(reqwest::StatusCode::TOO_MANY_REQUESTS, "", ""),
            ProviderError::RateLimit(_)
        ));
        assert!(matches!(
            provider.map_api_error(reqwest::StatusCode::INTERNAL_SERVER_ERROR, "", "boom"),
            ProviderError::Provider(_)
        ));
    }

    #[test]
    fn error_messages_name_the_model() {
        let provider = test_provider();
        let err = provider.map_api_error(reqwest::StatusCode::BAD_REQUEST, "ThrottlingException", "");
        assert!(err.to_string().contains("Claude Sonnet"));
    }

    #[test]
    fn error_message_extraction() {
        assert_eq!(
            error_message_from_body(br#"{"message":"no such model"}"#),
            "no such model"
        );
        assert_eq!(error_message_from_body(b"plain text"), "plain text");
        let long = "x".repeat(300);
        assert!(error_message_from_body(long.as_bytes()).ends_with("..."));
    }

    // -- Demultiplexing --

    fn byte_stream(
        chunks: Vec<Vec<u8>>,
    ) -> impl Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send {
        futures::stream::iter(chunks.into_iter().map(Ok))
    }

    #[tokio::test]
    async fn demux_text_stream() {
        let mut wire = Vec::new();
        wire.extend(encode_event(
            "contentBlockStart",
            r#"{"contentBlockIndex":0,"start":{"text":""}}"#,
        ));
        for text in ["Hello", " from", " Bedrock!"] {
            wire.extend(encode_event(
                "contentBlockDelta",
                &format!(r#"{{"contentBlockIndex":0,"delta":{{"text":"{text}"}}}}"#),
            ));
        }
        wire.extend(encode_event("contentBlockStop", r#"{"contentBlockIndex":0}"#));
        wire.extend(encode_event(
            "metadata",
            r#"{"usage":{"inputTokens":10,"outputTokens":5},"stopReason":"end_turn"}"#,
        ));

        let chunks = collect(demux_event_stream(
            byte_stream(vec![wire]),
            "Claude Sonnet".into(),
        ))
        .await;

        let chunks: Vec<StreamChunk> = chunks.into_iter().map(|c| c.unwrap()).collect();
        let text: String = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(text, "Hello from Bedrock!");
        assert!(chunks.last().unwrap().done);
        assert!(chunks.iter().all(|c| !c.is_reasoning));
    }

    #[tokio::test]
    async fn demux_classifies_reasoning_blocks_by_index() {
        let mut wire = Vec::new();
        wire.extend(encode_event(
            "contentBlockStart",
            r#"{"contentBlockIndex":0,"start":{"reasoningContent":{}}}"#,
        ));
        wire.extend(encode_event(
            "contentBlockDelta",
            r#"{"contentBlockIndex":0,"delta":{"text":"thinking it over"}}"#,
        ));
        wire.extend(encode_event(
            "contentBlockStart",
            r#"{"contentBlockIndex":1,"start":{"text":""}}"#,
        ));
        wire.extend(encode_event(
            "contentBlockDelta",
            r#"{"contentBlockIndex":1,"delta":{"text":"The answer."}}"#,
        ));
        wire.extend(encode_event("messageStop", r#"{"stopReason":"end_turn"}"#));

        let chunks = collect(demux_event_stream(
            byte_stream(vec![wire]),
            "Claude Sonnet".into(),
        ))
        .await;
        let chunks: Vec<StreamChunk> = chunks.into_iter().map(|c| c.unwrap()).collect();

        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].is_reasoning);
        assert_eq!(chunks[0].reasoning, "thinking it over");
        assert!(chunks[0].content.is_empty());

        assert!(!chunks[1].is_reasoning);
        assert_eq!(chunks[1].content, "The answer.");

        assert!(chunks[2].done);
    }

    #[tokio::test]
    async fn demux_unclassified_delta_defaults_to_text() {
        let mut wire = Vec::new();
        // Delta with no preceding contentBlockStart for its index.
        wire.extend(encode_event(
            "contentBlockDelta",
            r#"{"contentBlockIndex":7,"delta":{"text":"plain"}}"#,
        ));
        wire.extend(encode_event("messageStop", "{}"));

        let chunks = collect(demux_event_stream(
            byte_stream(vec![wire]),
            "Claude Sonnet".into(),
        ))
        .await;
        let chunks: Vec<StreamChunk> = chunks.into_iter().map(|c| c.unwrap()).collect();
        assert_eq!(chunks[0].content, "plain");
        assert!(!chunks[0].is_reasoning);
    }

    #[tokio::test]
    async fn demux_reasoning_content_delta() {
        let mut wire = Vec::new();
        wire.extend(encode_event(
            "contentBlockDelta",
            r#"{"contentBlockIndex":0,"delta":{"reasoningContent":{"text":"hmm"}}}"#,
        ));
        wire.extend(encode_event("messageStop", "{}"));

        let chunks = collect(demux_event_stream(
            byte_stream(vec![wire]),
            "Claude Sonnet".into(),
        ))
        .await;
        let chunks: Vec<StreamChunk> = chunks.into_iter().map(|c| c.unwrap()).collect();
        assert!(chunks[0].is_reasoning);
        assert_eq!(chunks[0].reasoning, "hmm");
    }

    #[tokio::test]
    async fn demux_frames_split_across_reads() {
        let mut wire = Vec::new();
        wire.extend(encode_event(
            "contentBlockDelta",
            r#"{"contentBlockIndex":0,"delta":{"text":"split"}}"#,
        ));
        wire.extend(encode_event("messageStop", "{}"));

        // Feed the wire bytes in small slices that cut through frames.
        let pieces: Vec<Vec<u8>> = wire.chunks(7).map(|c| c.to_vec()).collect();
        let chunks = collect(demux_event_stream(
            byte_stream(pieces),
            "Claude Sonnet".into(),
        ))
        .await;
        let chunks: Vec<StreamChunk> = chunks.into_iter().map(|c| c.unwrap()).collect();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content, "split");
        assert!(chunks[1].done);
    }

    #[tokio::test]
    async fn demux_exception_frame_aborts() {
        let mut wire = Vec::new();
        wire.extend(encode_event(
            "contentBlockDelta",
            r#"{"contentBlockIndex":0,"delta":{"text":"partial"}}"#,
        ));
        wire.extend(encode_frame(
            &[
                (":message-type", "exception"),
                (":exception-type", "modelStreamErrorException"),
            ],
            br#"{"message":"stream blew up"}"#,
        ));
        // Anything after the exception must never be emitted.
        wire.extend(encode_event(
            "contentBlockDelta",
            r#"{"contentBlockIndex":0,"delta":{"text":"never seen"}}"#,
        ));

        let results = collect(demux_event_stream(
            byte_stream(vec![wire]),
            "Claude Sonnet".into(),
        ))
        .await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().content, "partial");
        let err = results[1].as_ref().unwrap_err();
        assert!(matches!(err, ProviderError::Provider(_)));
        let message = err.to_string();
        assert!(message.contains("modelStreamErrorException"));
        assert!(message.contains("stream blew up"));
    }

    #[tokio::test]
    async fn demux_ignores_unknown_events() {
        let mut wire = Vec::new();
        wire.extend(encode_event("messageStart", r#"{"role":"assistant"}"#));
        wire.extend(encode_event("somethingNew", r#"{"surprise":true}"#));
        wire.extend(encode_event(
            "contentBlockDelta",
            r#"{"contentBlockIndex":0,"delta":{"text":"ok"}}"#,
        ));
        wire.extend(encode_event("messageStop", "{}"));

        let chunks = collect(demux_event_stream(
            byte_stream(vec![wire]),
            "Claude Sonnet".into(),
        ))
        .await;
        let chunks: Vec<StreamChunk> = chunks.into_iter().map(|c| c.unwrap()).collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content, "ok");
        assert!(chunks[1].done);
    }

    #[tokio::test]
    async fn demux_synthesizes_done_when_connection_closes() {
        let wire = encode_event(
            "contentBlockDelta",
            r#"{"contentBlockIndex":0,"delta":{"text":"cut off"}}"#,
        );
        let chunks = collect(demux_event_stream(
            byte_stream(vec![wire]),
            "Claude Sonnet".into(),
        ))
        .await;
        let chunks: Vec<StreamChunk> = chunks.into_iter().map(|c| c.unwrap()).collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content, "cut off");
        assert!(chunks[1].done);
    }

    #[tokio::test]
    async fn demux_corrupt_frame_is_an_error() {
        let mut wire = encode_event("messageStop", "{}");
        wire[8] ^= 0xFF; // break the prelude CRC
        let results = collect(demux_event_stream(
            byte_stream(vec![wire]),
            "Claude Sonnet".into(),
        ))
        .await;
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0].as_ref().unwrap_err(),
            ProviderError::Provider(_)
        ));
    }
}
