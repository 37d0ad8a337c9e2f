use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QuireError;

// =============================================================================
// Enums
// =============================================================================

/// Author of a conversation message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = QuireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(QuireError::Serialization(format!("unknown role: {}", other))),
        }
    }
}

/// Capability tier requested from the completion service.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    /// Lowest latency; the default for voice calls.
    #[default]
    Fast,
    Balanced,
    Powerful,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Fast => "fast",
            ModelTier::Balanced => "balanced",
            ModelTier::Powerful => "powerful",
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelTier {
    type Err = QuireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(ModelTier::Fast),
            "balanced" => Ok(ModelTier::Balanced),
            "powerful" => Ok(ModelTier::Powerful),
            other => Err(QuireError::Config(format!("unknown model tier: {}", other))),
        }
    }
}

/// Phase of a voice call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// No call in progress.
    #[default]
    Idle,
    /// Primary recognizer session is capturing the user's turn.
    Listening,
    /// A completion request for the user's turn is in flight.
    Processing,
    /// The assistant's reply is being synthesized; a secondary recognizer
    /// watches for barge-in.
    Speaking,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallState::Idle => write!(f, "Idle"),
            CallState::Listening => write!(f, "Listening"),
            CallState::Processing => write!(f, "Processing"),
            CallState::Speaking => write!(f, "Speaking"),
        }
    }
}

// =============================================================================
// Messages and conversations
// =============================================================================

/// Opaque attachment carried alongside a message.
///
/// The engine never inspects `data`; encoding and thumbnailing happen in the
/// host application.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Uuid,
    pub kind: String,
    pub data: serde_json::Value,
}

/// A single conversation message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            reasoning_content: None,
            attachments: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Assistant message; empty reasoning is dropped.
    pub fn assistant(content: impl Into<String>, reasoning: Option<String>) -> Self {
        let mut message = Self::new(Role::Assistant, content);
        message.reasoning_content = reasoning.filter(|r| !r.is_empty());
        message
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// An ordered conversation.
///
/// Messages are only ever appended or truncated from a point onwards; they
/// are never reordered.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub title: Option<String>,
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new(title: Option<String>) -> Self {
        Self::with_id(Uuid::new_v4(), title)
    }

    pub fn with_id(id: Uuid, title: Option<String>) -> Self {
        Self {
            id,
            title,
            messages: Vec::new(),
        }
    }

    /// Rebuild a conversation from stored, already-ordered messages.
    pub fn from_messages(id: Uuid, title: Option<String>, messages: Vec<Message>) -> Self {
        let mut conversation = Self::with_id(id, title);
        for message in messages {
            conversation.append(message);
        }
        conversation
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Append a message, clamping its timestamp so time order is preserved.
    pub fn append(&mut self, mut message: Message) -> &Message {
        if let Some(last) = self.messages.last() {
            if message.timestamp < last.timestamp {
                message.timestamp = last.timestamp;
            }
        }
        let index = self.messages.len();
        self.messages.push(message);
        &self.messages[index]
    }

    /// Remove the message with `id` and every message after it.
    ///
    /// Returns the removed messages in their original order.
    pub fn truncate_from(&mut self, id: Uuid) -> Result<Vec<Message>, QuireError> {
        let index = self
            .messages
            .iter()
            .position(|m| m.id == id)
            .ok_or(QuireError::MessageNotFound(id))?;
        Ok(self.messages.split_off(index))
    }
}

/// One spoken turn of a voice call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceCallMessage {
    pub role: Role,
    pub content: String,
}

impl VoiceCallMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn to_message(&self) -> Message {
        Message::new(self.role, self.content.clone())
    }
}

/// Token accounting reported by the completion service on success.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

// =============================================================================
// Completion request context
// =============================================================================

/// Everything a completion request is built from.
///
/// Constructed fresh for every turn and moved into the request, so it cannot
/// change after submission.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CompletionContext {
    messages: Vec<Message>,
    model_tier: ModelTier,
    thinking: bool,
}

impl CompletionContext {
    pub fn new(messages: Vec<Message>, model_tier: ModelTier, thinking: bool) -> Self {
        Self {
            messages,
            model_tier,
            thinking,
        }
    }

    pub fn from_conversation(
        conversation: &Conversation,
        model_tier: ModelTier,
        thinking: bool,
    ) -> Self {
        Self::new(conversation.messages().to_vec(), model_tier, thinking)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn model_tier(&self) -> ModelTier {
        self.model_tier
    }

    pub fn thinking(&self) -> bool {
        self.thinking
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_role_round_trip_str() {
        assert_eq!("user".parse::<Role>().unwrap(), Role::User);
        assert_eq!(Role::Assistant.to_string(), "assistant");
        assert!("system".parse::<Role>().is_err());
    }

    #[test]
    fn test_model_tier_parse_is_case_insensitive() {
        assert_eq!("Powerful".parse::<ModelTier>().unwrap(), ModelTier::Powerful);
        assert_eq!("fast".parse::<ModelTier>().unwrap(), ModelTier::Fast);
        assert!("turbo".parse::<ModelTier>().is_err());
        assert_eq!(ModelTier::default(), ModelTier::Fast);
    }

    #[test]
    fn test_model_tier_serde_snake_case() {
        let json = serde_json::to_string(&ModelTier::Balanced).unwrap();
        assert_eq!(json, "\"balanced\"");
    }

    #[test]
    fn test_call_state_display_and_default() {
        assert_eq!(CallState::default(), CallState::Idle);
        assert_eq!(CallState::Speaking.to_string(), "Speaking");
    }

    #[test]
    fn test_assistant_message_drops_empty_reasoning() {
        let m = Message::assistant("hi", Some(String::new()));
        assert!(m.reasoning_content.is_none());
        let m = Message::assistant("hi", Some("because".into()));
        assert_eq!(m.reasoning_content.as_deref(), Some("because"));
    }

    #[test]
    fn test_conversation_append_preserves_time_order() {
        let mut conv = Conversation::new(None);
        let first = Message::user("first");
        let mut second = Message::assistant("second", None);
        second.timestamp = first.timestamp - Duration::seconds(10);

        conv.append(first.clone());
        conv.append(second);

        assert_eq!(conv.len(), 2);
        assert!(conv.messages()[1].timestamp >= conv.messages()[0].timestamp);
        assert_eq!(conv.messages()[0].content, "first");
    }

    #[test]
    fn test_conversation_truncate_from_removes_tail() {
        let mut conv = Conversation::new(Some("Journal".into()));
        let a = Message::user("a");
        let b = Message::assistant("b", None);
        let c = Message::user("c");
        let b_id = b.id;
        conv.append(a);
        conv.append(b);
        conv.append(c);

        let removed = conv.truncate_from(b_id).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].content, "b");
        assert_eq!(conv.len(), 1);
        assert_eq!(conv.last().unwrap().content, "a");
    }

    #[test]
    fn test_conversation_truncate_unknown_id() {
        let mut conv = Conversation::new(None);
        conv.append(Message::user("a"));
        let result = conv.truncate_from(Uuid::new_v4());
        assert!(matches!(result, Err(QuireError::MessageNotFound(_))));
        assert_eq!(conv.len(), 1);
    }

    #[test]
    fn test_completion_context_from_conversation() {
        let mut conv = Conversation::new(None);
        conv.append(Message::user("hello"));
        let ctx = CompletionContext::from_conversation(&conv, ModelTier::Balanced, true);
        assert_eq!(ctx.messages().len(), 1);
        assert_eq!(ctx.model_tier(), ModelTier::Balanced);
        assert!(ctx.thinking());
    }

    #[test]
    fn test_voice_call_message_to_message() {
        let vm = VoiceCallMessage::new(Role::User, "wait");
        let m = vm.to_message();
        assert_eq!(m.role, Role::User);
        assert_eq!(m.content, "wait");
        assert!(m.attachments.is_empty());
    }
}
