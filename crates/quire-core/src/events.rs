use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::types::{CallState, Role};

/// Default capacity of the engine event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by the voice-call engine.
///
/// Observers (UI layers, loggers, tests) subscribe through [`EventBus`]; the
/// engine never depends on who is listening.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum EngineEvent {
    /// The call moved between states.
    CallStateChanged {
        call_id: Uuid,
        from: CallState,
        to: CallState,
        timestamp: DateTime<Utc>,
    },

    /// Recognizer text for the user's in-progress turn.
    RecognizedText {
        call_id: Uuid,
        text: String,
        timestamp: DateTime<Utc>,
    },

    /// Cumulative assistant answer for the in-flight turn.
    AssistantText {
        call_id: Uuid,
        text: String,
        timestamp: DateTime<Utc>,
    },

    /// A turn was appended to the call transcript.
    TurnAppended {
        call_id: Uuid,
        role: Role,
        content: String,
        timestamp: DateTime<Utc>,
    },

    /// A recoverable problem the user should briefly be told about.
    TransientNotice {
        call_id: Uuid,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Microphone permission was denied; the host should prompt the user.
    PermissionRequired { timestamp: DateTime<Utc> },

    /// The call was torn down.
    CallEnded {
        call_id: Uuid,
        turns: usize,
        conversation_id: Option<Uuid>,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// Returns the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            EngineEvent::CallStateChanged { timestamp, .. }
            | EngineEvent::RecognizedText { timestamp, .. }
            | EngineEvent::AssistantText { timestamp, .. }
            | EngineEvent::TurnAppended { timestamp, .. }
            | EngineEvent::TransientNotice { timestamp, .. }
            | EngineEvent::PermissionRequired { timestamp }
            | EngineEvent::CallEnded { timestamp, .. } => *timestamp,
        }
    }

    /// Returns a snake_case name for the event, suitable for log fields.
    pub fn event_name(&self) -> &'static str {
        match self {
            EngineEvent::CallStateChanged { .. } => "call_state_changed",
            EngineEvent::RecognizedText { .. } => "recognized_text",
            EngineEvent::AssistantText { .. } => "assistant_text",
            EngineEvent::TurnAppended { .. } => "turn_appended",
            EngineEvent::TransientNotice { .. } => "transient_notice",
            EngineEvent::PermissionRequired { .. } => "permission_required",
            EngineEvent::CallEnded { .. } => "call_ended",
        }
    }
}

/// Single broadcast channel carrying [`EngineEvent`]s.
///
/// Cloning the bus shares the underlying channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: EngineEvent) {
        tracing::trace!(event = event.event_name(), "Engine event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
