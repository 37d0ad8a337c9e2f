//! Voice call session data.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use quire_core::types::{CallState, Role, VoiceCallMessage};

/// Everything known about the current (or last) call.
///
/// Owned by the call task; observers receive clones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceCallSession {
    pub id: Uuid,
    pub state: CallState,
    /// Recognizer text for the user's in-progress turn.
    pub recognized_text: String,
    /// The assistant's current answer.
    pub ai_response: String,
    pub messages: Vec<VoiceCallMessage>,
    /// Conversation the call continues, if any.
    pub conversation_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
}

impl Default for VoiceCallSession {
    fn default() -> Self {
        Self {
            id: Uuid::nil(),
            state: CallState::Idle,
            recognized_text: String::new(),
            ai_response: String::new(),
            messages: Vec::new(),
            conversation_id: None,
            started_at: None,
        }
    }
}

impl VoiceCallSession {
    /// A fresh session for a call that is about to start.
    pub fn start(conversation_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            started_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn is_active(&self) -> bool {
        self.state != CallState::Idle
    }

    /// Returns the elapsed duration of the call in seconds.
    pub fn elapsed_secs(&self) -> f32 {
        match self.started_at {
            Some(start) => (Utc::now() - start).num_milliseconds() as f32 / 1000.0,
            None => 0.0,
        }
    }

    pub fn push_turn(&mut self, role: Role, content: impl Into<String>) -> &VoiceCallMessage {
        let index = self.messages.len();
        self.messages.push(VoiceCallMessage::new(role, content));
        &self.messages[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_idle() {
        let session = VoiceCallSession::default();
        assert_eq!(session.state, CallState::Idle);
        assert!(!session.is_active());
        assert_eq!(session.elapsed_secs(), 0.0);
    }

    #[test]
    fn test_start() {
        let linked = Uuid::new_v4();
        let session = VoiceCallSession::start(Some(linked));
        assert!(!session.id.is_nil());
        assert_eq!(session.conversation_id, Some(linked));
        assert!(session.started_at.is_some());
        assert!(session.elapsed_secs() < 1.0);
    }

    #[test]
    fn test_push_turn_keeps_order() {
        let mut session = VoiceCallSession::start(None);
        session.push_turn(Role::User, "hello");
        session.push_turn(Role::Assistant, "Hi there");
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].role, Role::User);
        assert_eq!(session.messages[1].content, "Hi there");
    }
}
