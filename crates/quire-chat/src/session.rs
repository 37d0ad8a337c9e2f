//! Text chat session.
//!
//! Wraps one conversation and one coordinator. The host starts a turn with
//! [`ChatSession::send_user_message`], awaits the returned handle, then
//! hands the outcome back to [`ChatSession::finish_turn`].

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use quire_core::types::{Attachment, CompletionContext, Conversation, Message, ModelTier, Role};

use crate::accumulator::StreamingBuffer;
use crate::coordinator::{
    CompletionCoordinator, CompletionHandle, CompletionObserver, CompletionOutcome,
};
use crate::error::{ChatError, CompletionFailure};
use crate::transport::CompletionTransport;

/// What [`ChatSession::finish_turn`] did with an outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnResult {
    /// The assistant message now at the end of the conversation.
    Appended(Message),
    /// Nothing appended; the host should offer a retry.
    RetryAvailable {
        failure: CompletionFailure,
        partial_content: Option<String>,
    },
    Cancelled,
}

pub struct ChatSession {
    conversation: Conversation,
    coordinator: CompletionCoordinator,
    model_tier: ModelTier,
    thinking: bool,
}

impl ChatSession {
    pub fn new(
        conversation: Conversation,
        transport: Arc<dyn CompletionTransport>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            conversation,
            coordinator: CompletionCoordinator::new(transport, idle_timeout),
            model_tier: ModelTier::default(),
            thinking: false,
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn model_tier(&self) -> ModelTier {
        self.model_tier
    }

    pub fn set_model_tier(&mut self, tier: ModelTier) {
        self.model_tier = tier;
    }

    pub fn thinking(&self) -> bool {
        self.thinking
    }

    pub fn set_thinking(&mut self, thinking: bool) {
        self.thinking = thinking;
    }

    pub fn is_busy(&self) -> bool {
        self.coordinator.is_busy()
    }

    pub fn cancel(&self) -> bool {
        self.coordinator.cancel()
    }

    /// Append a user message and start answering it.
    pub fn send_user_message(
        &mut self,
        text: &str,
        attachments: Vec<Attachment>,
        observer: Arc<dyn CompletionObserver>,
    ) -> Result<CompletionHandle, ChatError> {
        let text = text.trim();
        if text.is_empty() && attachments.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if self.coordinator.is_busy() {
            return Err(ChatError::Busy);
        }

        self.conversation
            .append(Message::user(text).with_attachments(attachments));
        self.start_turn(observer)
    }

    /// Re-send the current history, e.g. after a failed turn.
    pub fn retry(
        &mut self,
        observer: Arc<dyn CompletionObserver>,
    ) -> Result<CompletionHandle, ChatError> {
        match self.conversation.last() {
            Some(message) if message.role == Role::User => self.start_turn(observer),
            _ => Err(ChatError::NothingToRetry),
        }
    }

    /// Discard an assistant message and everything after it, then answer
    /// the preceding user message again.
    pub fn regenerate(
        &mut self,
        message_id: Uuid,
        observer: Arc<dyn CompletionObserver>,
    ) -> Result<CompletionHandle, ChatError> {
        if self.coordinator.is_busy() {
            return Err(ChatError::Busy);
        }

        let messages = self.conversation.messages();
        let index = messages
            .iter()
            .position(|m| m.id == message_id)
            .ok_or(quire_core::QuireError::MessageNotFound(message_id))?;
        if index == 0 || messages[index - 1].role != Role::User {
            return Err(ChatError::NothingToRetry);
        }

        let discarded = self.conversation.truncate_from(message_id)?;
        tracing::debug!(
            conversation_id = %self.conversation.id,
            discarded = discarded.len(),
            "Regenerating reply"
        );
        self.start_turn(observer)
    }

    /// Apply a finished turn to the conversation.
    pub fn finish_turn(&mut self, outcome: CompletionOutcome) -> TurnResult {
        match outcome {
            CompletionOutcome::Success {
                content, reasoning, ..
            } => {
                let message = self.conversation.append(Message::assistant(content, reasoning));
                TurnResult::Appended(message.clone())
            }
            CompletionOutcome::Failure { failure, partial } => TurnResult::RetryAvailable {
                partial_content: salvage(&partial),
                failure,
            },
            CompletionOutcome::Cancelled => TurnResult::Cancelled,
        }
    }

    fn start_turn(
        &self,
        observer: Arc<dyn CompletionObserver>,
    ) -> Result<CompletionHandle, ChatError> {
        let context =
            CompletionContext::from_conversation(&self.conversation, self.model_tier, self.thinking);
        self.coordinator.send(context, observer)
    }
}

fn salvage(partial: &StreamingBuffer) -> Option<String> {
    partial.salvageable_content().map(str::to_string)
}
