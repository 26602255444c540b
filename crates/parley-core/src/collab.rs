//! Seams to the collaborators the relay depends on but does not implement:
//! credential validation and message persistence.

use async_trait::async_trait;

use crate::errors::{AuthError, ChatError};
use crate::ids::{ConversationId, UserId};

/// Resolves a bearer credential to the identity it was issued for.
pub trait TokenValidator: Send + Sync {
    fn validate_token(&self, token: &str) -> Result<UserId, AuthError>;
}

/// Result of persisting a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentMessage {
    pub body: String,
    /// Unix seconds.
    pub created_at: i64,
}

/// Durable side of messaging. The relay calls it before fanning a message
/// out, but delivers whether or not it succeeds.
#[async_trait]
pub trait ChatService: Send + Sync {
    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        body: &str,
    ) -> Result<SentMessage, ChatError>;
}
