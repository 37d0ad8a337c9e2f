//! Conversation persistence on top of [`Database`].
//!
//! Messages carry an `ordinal` giving their append position, so reads come
//! back in exactly the order they were written regardless of timestamps.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::OptionalExtension;
use uuid::Uuid;

use quire_core::error::QuireError;
use quire_core::store::ConversationStore;
use quire_core::types::{Conversation, Message, Role};

use crate::db::Database;

/// One row of the conversation list.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSummary {
    pub id: Uuid,
    pub title: Option<String>,
    pub message_count: usize,
    pub updated_at: DateTime<Utc>,
}

/// Repository for conversations and their messages.
#[derive(Debug, Clone)]
pub struct ConversationRepository {
    db: Arc<Database>,
}

impl ConversationRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Create an empty conversation.
    pub fn create(&self, title: Option<&str>) -> Result<Uuid, QuireError> {
        let id = Uuid::new_v4();
        let now = Utc::now().timestamp_millis();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversations (id, title, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                rusqlite::params![id.to_string(), title, now],
            )
            .map_err(|e| QuireError::Storage(format!("Failed to create conversation: {}", e)))?;
            Ok(())
        })?;
        tracing::debug!(conversation_id = %id, "Conversation created");
        Ok(id)
    }

    /// Append messages after the last stored one, all or nothing.
    pub fn append_messages(
        &self,
        conversation_id: Uuid,
        messages: &[Message],
    ) -> Result<(), QuireError> {
        self.db.with_conn(|conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| QuireError::Storage(e.to_string()))?;

            let touched = tx
                .execute(
                    "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
                    rusqlite::params![conversation_id.to_string(), Utc::now().timestamp_millis()],
                )
                .map_err(|e| QuireError::Storage(e.to_string()))?;
            if touched == 0 {
                return Err(QuireError::ConversationNotFound(conversation_id));
            }

            let next: i64 = tx
                .query_row(
                    "SELECT COALESCE(MAX(ordinal) + 1, 0) FROM messages WHERE conversation_id = ?1",
                    rusqlite::params![conversation_id.to_string()],
                    |row| row.get(0),
                )
                .map_err(|e| QuireError::Storage(e.to_string()))?;

            {
                let mut stmt = tx
                    .prepare(
                        "INSERT INTO messages
                            (id, conversation_id, ordinal, role, content, reasoning_content, attachments, timestamp)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    )
                    .map_err(|e| QuireError::Storage(e.to_string()))?;

                for (offset, message) in messages.iter().enumerate() {
                    let attachments = serde_json::to_string(&message.attachments)?;
                    stmt.execute(rusqlite::params![
                        message.id.to_string(),
                        conversation_id.to_string(),
                        next + offset as i64,
                        message.role.as_str(),
                        message.content,
                        message.reasoning_content,
                        attachments,
                        message.timestamp.timestamp_millis(),
                    ])
                    .map_err(|e| QuireError::Storage(format!("Failed to save message: {}", e)))?;
                }
            }

            tx.commit()
                .map_err(|e| QuireError::Storage(e.to_string()))?;
            Ok(())
        })?;

        tracing::debug!(
            conversation_id = %conversation_id,
            count = messages.len(),
            "Messages appended"
        );
        Ok(())
    }

    /// All messages of a conversation in append order.
    pub fn messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, QuireError> {
        self.db.with_conn(|conn| {
            if find_title(conn, conversation_id)?.is_none() {
                return Err(QuireError::ConversationNotFound(conversation_id));
            }
            select_messages(conn, conversation_id)
        })
    }

    pub fn load_conversation(&self, conversation_id: Uuid) -> Result<Conversation, QuireError> {
        self.db.with_conn(|conn| {
            let title = find_title(conn, conversation_id)?
                .ok_or(QuireError::ConversationNotFound(conversation_id))?;
            let messages = select_messages(conn, conversation_id)?;
            Ok(Conversation::from_messages(conversation_id, title, messages))
        })
    }

    /// Most recently updated conversations first.
    pub fn list_conversations(&self, limit: usize) -> Result<Vec<ConversationSummary>, QuireError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT c.id, c.title, c.updated_at, COUNT(m.id)
                     FROM conversations c
                     LEFT JOIN messages m ON m.conversation_id = c.id
                     GROUP BY c.id
                     ORDER BY c.updated_at DESC, c.rowid DESC
                     LIMIT ?1",
                )
                .map_err(|e| QuireError::Storage(e.to_string()))?;

            let rows = stmt
                .query_map(rusqlite::params![limit as i64], |row| {
                    Ok(row_to_summary(row))
                })
                .map_err(|e| QuireError::Storage(e.to_string()))?;

            let mut summaries = Vec::new();
            for row in rows {
                summaries.push(row.map_err(|e| QuireError::Storage(e.to_string()))??);
            }
            Ok(summaries)
        })
    }

    /// Delete `message_id` and every later message. Returns how many were
    /// removed.
    pub fn truncate_from(&self, conversation_id: Uuid, message_id: Uuid) -> Result<usize, QuireError> {
        let removed = self.db.with_conn(|conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| QuireError::Storage(e.to_string()))?;

            let ordinal: Option<i64> = tx
                .query_row(
                    "SELECT ordinal FROM messages WHERE id = ?1 AND conversation_id = ?2",
                    rusqlite::params![message_id.to_string(), conversation_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| QuireError::Storage(e.to_string()))?;
            let Some(ordinal) = ordinal else {
                return Err(QuireError::MessageNotFound(message_id));
            };

            let removed = tx
                .execute(
                    "DELETE FROM messages WHERE conversation_id = ?1 AND ordinal >= ?2",
                    rusqlite::params![conversation_id.to_string(), ordinal],
                )
                .map_err(|e| QuireError::Storage(format!("Failed to truncate: {}", e)))?;
            tx.execute(
                "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
                rusqlite::params![conversation_id.to_string(), Utc::now().timestamp_millis()],
            )
            .map_err(|e| QuireError::Storage(e.to_string()))?;

            tx.commit()
                .map_err(|e| QuireError::Storage(e.to_string()))?;
            Ok(removed)
        })?;

        tracing::debug!(
            conversation_id = %conversation_id,
            message_id = %message_id,
            removed,
            "Conversation truncated"
        );
        Ok(removed)
    }
}

#[async_trait]
impl ConversationStore for ConversationRepository {
    async fn create_conversation(&self, title: Option<String>) -> quire_core::Result<Uuid> {
        self.create(title.as_deref())
    }

    async fn append(&self, conversation_id: Uuid, messages: &[Message]) -> quire_core::Result<()> {
        self.append_messages(conversation_id, messages)
    }

    async fn load_messages(&self, conversation_id: Uuid) -> quire_core::Result<Vec<Message>> {
        self.messages(conversation_id)
    }
}

// ============================================================================
// Row helpers
// ============================================================================

/// `Some(title)` when the conversation exists.
fn find_title(
    conn: &rusqlite::Connection,
    conversation_id: Uuid,
) -> Result<Option<Option<String>>, QuireError> {
    conn.query_row(
        "SELECT title FROM conversations WHERE id = ?1",
        rusqlite::params![conversation_id.to_string()],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| QuireError::Storage(e.to_string()))
}

fn select_messages(
    conn: &rusqlite::Connection,
    conversation_id: Uuid,
) -> Result<Vec<Message>, QuireError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, role, content, reasoning_content, attachments, timestamp
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY ordinal ASC",
        )
        .map_err(|e| QuireError::Storage(e.to_string()))?;

    let rows = stmt
        .query_map(rusqlite::params![conversation_id.to_string()], |row| {
            Ok(row_to_message(row))
        })
        .map_err(|e| QuireError::Storage(e.to_string()))?;

    let mut messages = Vec::new();
    for row in rows {
        messages.push(row.map_err(|e| QuireError::Storage(e.to_string()))??);
    }
    Ok(messages)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<Message, QuireError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| QuireError::Storage(e.to_string()))?;
    let role_str: String = row
        .get(1)
        .map_err(|e| QuireError::Storage(e.to_string()))?;
    let content: String = row
        .get(2)
        .map_err(|e| QuireError::Storage(e.to_string()))?;
    let reasoning_content: Option<String> = row
        .get(3)
        .map_err(|e| QuireError::Storage(e.to_string()))?;
    let attachments_json: String = row
        .get(4)
        .map_err(|e| QuireError::Storage(e.to_string()))?;
    let timestamp_ms: i64 = row
        .get(5)
        .map_err(|e| QuireError::Storage(e.to_string()))?;

    Ok(Message {
        id: parse_uuid(&id_str)?,
        role: role_str.parse::<Role>()?,
        content,
        reasoning_content,
        attachments: serde_json::from_str(&attachments_json)?,
        timestamp: from_millis(timestamp_ms),
    })
}

fn row_to_summary(row: &rusqlite::Row<'_>) -> Result<ConversationSummary, QuireError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| QuireError::Storage(e.to_string()))?;
    let title: Option<String> = row
        .get(1)
        .map_err(|e| QuireError::Storage(e.to_string()))?;
    let updated_ms: i64 = row
        .get(2)
        .map_err(|e| QuireError::Storage(e.to_string()))?;
    let count: i64 = row
        .get(3)
        .map_err(|e| QuireError::Storage(e.to_string()))?;

    Ok(ConversationSummary {
        id: parse_uuid(&id_str)?,
        title,
        message_count: count as usize,
        updated_at: from_millis(updated_ms),
    })
}

fn parse_uuid(value: &str) -> Result<Uuid, QuireError> {
    Uuid::parse_str(value).map_err(|e| QuireError::Storage(format!("Invalid UUID: {}", e)))
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}
