//! Conversation store boundary.
//!
//! The engine only writes finished turns and optionally reads prior history
//! for context. Concrete stores live outside the engine (see `quire-storage`).

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::types::Message;

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create an empty conversation and return its id.
    async fn create_conversation(&self, title: Option<String>) -> Result<Uuid>;

    /// Append messages, in order, to the end of a conversation.
    async fn append(&self, conversation_id: Uuid, messages: &[Message]) -> Result<()>;

    /// Load the full ordered history of a conversation.
    async fn load_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>>;
}
