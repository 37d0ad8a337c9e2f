//! Platform boundaries the call loop drives.
//!
//! Speech recognition, speech synthesis, and microphone permission are
//! supplied by the host. Callbacks may fire on any thread; the call loop
//! forwards them into its own task and never touches state from them.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

/// How a recognizer failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecognizerErrorKind {
    /// Microphone or speech permission was revoked.
    Permission,
    /// Worth retrying after a short delay (audio glitch, busy engine).
    Transient,
    /// The recognizer cannot continue.
    Fatal,
}

impl fmt::Display for RecognizerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecognizerErrorKind::Permission => write!(f, "permission"),
            RecognizerErrorKind::Transient => write!(f, "transient"),
            RecognizerErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} recognizer error: {detail}")]
pub struct RecognizerError {
    pub kind: RecognizerErrorKind,
    pub detail: String,
}

impl RecognizerError {
    pub fn new(kind: RecognizerErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == RecognizerErrorKind::Transient
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognizerEvent {
    /// Best guess so far for the current utterance.
    Partial(String),
    /// The utterance is over. Empty text means no speech was heard.
    Final(String),
    Error(RecognizerError),
}

pub type RecognizerCallback = Arc<dyn Fn(RecognizerEvent) + Send + Sync>;

pub trait SpeechRecognizer: Send + Sync {
    /// Begin a recognition session reporting through `on_event`.
    fn start(
        &self,
        on_event: RecognizerCallback,
    ) -> Result<Box<dyn RecognitionSession>, RecognizerError>;
}

pub trait RecognitionSession: Send {
    /// Stop recognizing. Events may still arrive afterwards and are
    /// discarded by the caller.
    fn stop(&mut self);
}

pub trait SpeechSynthesizer: Send + Sync {
    /// Speak `text`, calling `on_complete` once playback finishes.
    ///
    /// `on_complete` is not required to fire if `stop` interrupts playback.
    fn speak(&self, text: &str, on_complete: Box<dyn FnOnce() + Send>);

    /// Stop playback. Safe to call when nothing is playing.
    fn stop(&self);
}

#[async_trait]
pub trait PermissionGate: Send + Sync {
    /// Ask for microphone access, resolving once the user has answered.
    async fn request_microphone(&self) -> bool;
}

/// A gate that always answers the same way.
#[derive(Debug, Clone, Copy)]
pub struct StaticPermission(pub bool);

#[async_trait]
impl PermissionGate for StaticPermission {
    async fn request_microphone(&self) -> bool {
        self.0
    }
}
