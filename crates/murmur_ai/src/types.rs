use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Who authored a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Wire name used by both chat protocols.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A document attached to a message: filename plus raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl Document {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
        }
    }
}

/// One conversation turn.
///
/// Messages are created once per turn and never mutated afterwards;
/// corrections happen by appending a new message. A message carrying
/// attachments must not reach a model that does not support them; the
/// chat service gates that before dispatch, not this type.
#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Raw image bytes, in attachment order.
    pub images: Vec<Vec<u8>>,
    pub documents: Vec<Document>,
}

impl Message {
    /// A plain text message with no attachments.
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            images: Vec::new(),
            documents: Vec::new(),
        }
    }

    pub fn with_attachments(
        role: Role,
        content: impl Into<String>,
        images: Vec<Vec<u8>>,
        documents: Vec<Document>,
    ) -> Self {
        Self {
            role,
            content: content.into(),
            images,
            documents,
        }
    }

    pub fn has_attachments(&self) -> bool {
        !self.images.is_empty() || !self.documents.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Stream chunks
// ---------------------------------------------------------------------------

/// One increment of a streamed response.
///
/// A chunk carries at most one kind of payload: visible answer text,
/// reasoning text, or the terminal marker. Chunks are produced by a
/// provider adapter, consumed immediately by the chat service, and never
/// stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamChunk {
    /// Visible answer delta; empty if none.
    pub content: String,
    /// Reasoning ("thinking") delta; empty if none.
    pub reasoning: String,
    /// True when this chunk is reasoning-only.
    pub is_reasoning: bool,
    /// Stream-terminal marker.
    pub done: bool,
}

impl StreamChunk {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: text.into(),
            ..Default::default()
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            reasoning: text.into(),
            is_reasoning: true,
            ..Default::default()
        }
    }

    pub fn done() -> Self {
        Self {
            done: true,
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Image format sniffing
// ---------------------------------------------------------------------------

/// Image formats both chat protocols accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    Webp,
}

impl ImageFormat {
    /// Wire name ("png", "jpeg", ...), also the MIME subtype.
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Gif => "gif",
            ImageFormat::Webp => "webp",
        }
    }

    pub fn mime_type(&self) -> String {
        format!("image/{}", self.as_str())
    }
}

/// Detect an image format from its magic bytes.
///
/// Unrecognized data falls back to PNG so a request still goes out; the
/// backend reports its own error if the bytes really are garbage.
pub fn sniff_image_format(data: &[u8]) -> ImageFormat {
    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        ImageFormat::Png
    } else if data.starts_with(b"\xff\xd8\xff") {
        ImageFormat::Jpeg
    } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        ImageFormat::Gif
    } else if data.starts_with(b"RIFF") && data.len() >= 12 && &data[8..12] == b"WEBP" {
        ImageFormat::Webp
    } else {
        tracing::warn!("unknown image format, defaulting to png");
        ImageFormat::Png
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
