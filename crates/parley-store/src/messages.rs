use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use parley_core::{ChatError, ChatService, ConversationId, SentMessage, UserId};

use crate::database::Database;
use crate::error::StoreError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: String,
    /// Unix seconds.
    pub created_at: i64,
}

/// Message persistence. Also serves as the relay's `ChatService`.
#[derive(Clone)]
pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a message. Empty (or whitespace-only) bodies are rejected.
    #[instrument(skip(self, body), fields(conversation_id = %conversation_id, sender_id = %sender_id))]
    pub fn insert(
        &self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        body: &str,
    ) -> Result<MessageRow, StoreError> {
        if conversation_id.is_empty() {
            return Err(StoreError::Invalid("conversation_id is required".into()));
        }
        if body.trim().is_empty() {
            return Err(StoreError::Invalid("message body is empty".into()));
        }

        let row = MessageRow {
            id: format!("msg_{}", Uuid::now_v7()),
            conversation_id: conversation_id.clone(),
            sender_id: sender_id.clone(),
            body: body.to_string(),
            created_at: Utc::now().timestamp(),
        };

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, body, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    row.id,
                    row.conversation_id.as_str(),
                    row.sender_id.as_str(),
                    row.body,
                    row.created_at,
                ],
            )?;
            Ok(())
        })?;

        Ok(row)
    }

    /// Messages of a conversation, oldest first.
    pub fn list_for_conversation(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
    ) -> Result<Vec<MessageRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, sender_id, body, created_at FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![conversation_id.as_str(), limit], |row| {
                Ok(MessageRow {
                    id: row.get(0)?,
                    conversation_id: ConversationId::from_raw(row.get::<_, String>(1)?),
                    sender_id: UserId::from_raw(row.get::<_, String>(2)?),
                    body: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }
}

#[async_trait]
impl ChatService for MessageRepo {
    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        body: &str,
    ) -> Result<SentMessage, ChatError> {
        let repo = self.clone();
        let conversation_id = conversation_id.clone();
        let sender_id = sender_id.clone();
        let body = body.to_string();

        let row = tokio::task::spawn_blocking(move || repo.insert(&conversation_id, &sender_id, &body))
            .await
            .map_err(|e| ChatError::Storage(format!("store task failed: {e}")))??;

        Ok(SentMessage {
            body: row.body,
            created_at: row.created_at,
        })
    }
}
