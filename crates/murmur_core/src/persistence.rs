use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Conversation header row.
#[derive(Debug, Clone)]
pub struct ConversationRecord {
    pub id: String,
    pub title: String,
    pub model_key: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Summary row for the conversation list, including its message count.
#[derive(Debug, Clone)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub model_key: String,
    pub message_count: usize,
    pub created_at: String,
    pub updated_at: String,
}

/// A persisted message with its attachments.
#[derive(Debug, Clone)]
pub struct PersistedMessage {
    pub id: String,
    pub role: String,
    pub content: String,
    pub reasoning: Option<String>,
    pub created_at: String,
    pub message_order: i64,
    pub attachments: Vec<PersistedAttachment>,
}

/// An attachment row; the bytes live on the filesystem at `storage_path`.
#[derive(Debug, Clone)]
pub struct PersistedAttachment {
    pub id: String,
    pub message_id: String,
    pub filename: String,
    pub storage_path: String,
    pub mime_type: String,
    pub attachment_type: AttachmentKind,
    pub size_bytes: u64,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Image,
    Document,
}

impl AttachmentKind {
    fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::Document => "document",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "image" => AttachmentKind::Image,
            _ => AttachmentKind::Document,
        }
    }
}

/// A full conversation as loaded from storage.
#[derive(Debug, Clone)]
pub struct StoredConversation {
    pub record: ConversationRecord,
    pub messages: Vec<PersistedMessage>,
}

// ---------------------------------------------------------------------------
// Title generation
// ---------------------------------------------------------------------------

/// Derive a conversation title from a message, truncated to `max_length`
/// at a character boundary.
pub fn generate_title(content: &str, max_length: usize) -> String {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return "New Conversation".to_string();
    }
    if trimmed.chars().count() <= max_length {
        return trimmed.to_string();
    }
    let truncated: String = trimmed.chars().take(max_length).collect();
    format!("{}...", truncated.trim_end())
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// SQLite-backed conversation store with attachment bytes on the filesystem.
///
/// Layout under the data directory:
/// `chat.db` for conversations/messages/attachments rows, and
/// `attachments/{conversation_id}/` for raw attachment files.
pub struct Storage {
    conn: Connection,
    attachments_dir: PathBuf,
}

impl Storage {
    /// Opens (or creates) the store rooted at `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data dir: {}", data_dir.display()))?;
        let attachments_dir = data_dir.join("attachments");
        std::fs::create_dir_all(&attachments_dir).with_context(|| {
            format!(
                "Failed to create attachments dir: {}",
                attachments_dir.display()
            )
        })?;

        let db_path = data_dir.join("chat.db");
        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let storage = Self {
            conn,
            attachments_dir,
        };
        storage.init_schema()?;
        info!("Storage opened at {}", data_dir.display());
        Ok(storage)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                model_key TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                reasoning TEXT,
                created_at TEXT NOT NULL,
                message_order INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS attachments (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                filename TEXT NOT NULL,
                storage_path TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                attachment_type TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, message_order);
            CREATE INDEX IF NOT EXISTS idx_attachments_message
                ON attachments(message_id);
            CREATE INDEX IF NOT EXISTS idx_conversations_updated
                ON conversations(updated_at DESC);
            ",
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Conversations
    // -----------------------------------------------------------------------

    /// Creates a new conversation and its attachment subdirectory.
    pub fn create_conversation(&self, title: &str, model_key: &str) -> Result<ConversationRecord> {
        let now = Utc::now().to_rfc3339();
        let record = ConversationRecord {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            model_key: model_key.to_string(),
            created_at: now.clone(),
            updated_at: now,
        };

        self.conn.execute(
            "INSERT INTO conversations (id, title, model_key, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id,
                record.title,
                record.model_key,
                record.created_at,
                record.updated_at
            ],
        )?;

        std::fs::create_dir_all(self.attachments_dir.join(&record.id))?;
        info!("Created conversation {} - {}", record.id, title);
        Ok(record)
    }

    /// Loads a conversation with all messages and attachment rows.
    pub fn get_conversation(&self, id: &str) -> Result<Option<StoredConversation>> {
        let record = {
            let mut stmt = self.conn.prepare(
                "SELECT id, title, model_key, created_at, updated_at
                 FROM conversations WHERE id = ?1",
            )?;
            let mut rows = stmt.query_map(params![id], |row| {
                Ok(ConversationRecord {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    model_key: row.get(2)?,
                    created_at: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            })?;
            match rows.next() {
                Some(row) => row.context("Failed to read conversation row")?,
                None => return Ok(None),
            }
        };

        let mut messages = {
            let mut stmt = self.conn.prepare(
                "SELECT id, role, content, reasoning, created_at, message_order
                 FROM messages WHERE conversation_id = ?1
                 ORDER BY message_order ASC",
            )?;
            let rows = stmt.query_map(params![id], |row| {
                Ok(PersistedMessage {
                    id: row.get(0)?,
                    role: row.get(1)?,
                    content: row.get(2)?,
                    reasoning: row.get(3)?,
                    created_at: row.get(4)?,
                    message_order: row.get(5)?,
                    attachments: Vec::new(),
                })
            })?;
            let mut messages = Vec::new();
            for row in rows {
                messages.push(row.context("Failed to read message row")?);
            }
            messages
        };

        for message in &mut messages {
            message.attachments = self.attachments_for(&message.id)?;
        }

        Ok(Some(StoredConversation { record, messages }))
    }

    /// Lists conversation summaries, most recently updated first.
    pub fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT c.id, c.title, c.model_key, c.created_at, c.updated_at,
                    (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id)
             FROM conversations c
             ORDER BY c.updated_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ConversationSummary {
                id: row.get(0)?,
                title: row.get(1)?,
                model_key: row.get(2)?,
                created_at: row.get(3)?,
                updated_at: row.get(4)?,
                message_count: row.get::<_, i64>(5)? as usize,
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row.context("Failed to read conversation summary")?);
        }
        Ok(result)
    }

    pub fn update_conversation_title(&self, id: &str, title: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE conversations SET title = ?1, updated_at = ?2 WHERE id = ?3",
            params![title, Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Deletes a conversation, its messages and attachment rows (via
    /// ON DELETE CASCADE), and its attachment files.
    pub fn delete_conversation(&self, id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        let dir = self.attachments_dir.join(id);
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!("Failed to remove attachment dir {}: {e}", dir.display());
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Messages and attachments
    // -----------------------------------------------------------------------

    /// Appends a message (and its attachments) to a conversation.
    /// Returns the new message id.
    #[allow(clippy::too_many_arguments)]
    pub fn add_message(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
        reasoning: Option<&str>,
        images: &[Vec<u8>],
        documents: &[(String, Vec<u8>)],
    ) -> Result<String> {
        let message_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        let next_order: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(message_order), -1) + 1
             FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;

        self.conn.execute(
            "INSERT INTO messages
                 (id, conversation_id, role, content, reasoning, created_at, message_order)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![message_id, conversation_id, role, content, reasoning, now, next_order],
        )?;

        for (index, data) in images.iter().enumerate() {
            let filename = format!("image_{index}.png");
            self.save_attachment(
                conversation_id,
                &message_id,
                &filename,
                data,
                AttachmentKind::Image,
            )?;
        }
        for (filename, data) in documents {
            self.save_attachment(
                conversation_id,
                &message_id,
                filename,
                data,
                AttachmentKind::Document,
            )?;
        }

        self.conn.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![now, conversation_id],
        )?;

        Ok(message_id)
    }

    fn save_attachment(
        &self,
        conversation_id: &str,
        message_id: &str,
        filename: &str,
        data: &[u8],
        kind: AttachmentKind,
    ) -> Result<PersistedAttachment> {
        let attachment_id = uuid::Uuid::new_v4().to_string();
        let safe_name = sanitize_filename(filename);
        let file_path = self
            .attachments_dir
            .join(conversation_id)
            .join(format!("{attachment_id}_{safe_name}"));

        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&file_path, data)
            .with_context(|| format!("Failed to write attachment: {}", file_path.display()))?;

        let mime_type = mime_guess::from_path(filename)
            .first_or_octet_stream()
            .to_string();

        let attachment = PersistedAttachment {
            id: attachment_id,
            message_id: message_id.to_string(),
            filename: filename.to_string(),
            storage_path: file_path.to_string_lossy().into_owned(),
            mime_type,
            attachment_type: kind,
            size_bytes: data.len() as u64,
            created_at: Utc::now().to_rfc3339(),
        };

        self.conn.execute(
            "INSERT INTO attachments
                 (id, message_id, filename, storage_path, mime_type,
                  attachment_type, size_bytes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                attachment.id,
                attachment.message_id,
                attachment.filename,
                attachment.storage_path,
                attachment.mime_type,
                attachment.attachment_type.as_str(),
                attachment.size_bytes as i64,
                attachment.created_at
            ],
        )?;

        Ok(attachment)
    }

    fn attachments_for(&self, message_id: &str) -> Result<Vec<PersistedAttachment>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, message_id, filename, storage_path, mime_type,
                    attachment_type, size_bytes, created_at
             FROM attachments WHERE message_id = ?1
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![message_id], |row| {
            Ok(PersistedAttachment {
                id: row.get(0)?,
                message_id: row.get(1)?,
                filename: row.get(2)?,
                storage_path: row.get(3)?,
                mime_type: row.get(4)?,
                attachment_type: AttachmentKind::from_str(&row.get::<_, String>(5)?),
                size_bytes: row.get::<_, i64>(6)? as u64,
                created_at: row.get(7)?,
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row.context("Failed to read attachment row")?);
        }
        Ok(result)
    }

    /// Reads attachment bytes back from the filesystem.
    pub fn load_attachment_data(&self, attachment: &PersistedAttachment) -> Result<Vec<u8>> {
        std::fs::read(&attachment.storage_path)
            .with_context(|| format!("Attachment file missing: {}", attachment.storage_path))
    }
}

/// Keep attachment filenames filesystem-safe.
fn sanitize_filename(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if safe.is_empty() {
        "attachment".to_string()
    } else {
        safe
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
