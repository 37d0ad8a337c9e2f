//! Error types for the voice call loop.

use quire_core::error::QuireError;
use quire_core::types::CallState;

use crate::boundary::RecognizerError;

#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error("invalid call transition: {from} -> {to}")]
    InvalidTransition { from: CallState, to: CallState },

    #[error("a call is already in progress")]
    AlreadyActive,

    #[error("voice call task is no longer running")]
    ActorGone,

    #[error(transparent)]
    Recognizer(#[from] RecognizerError),

    #[error(transparent)]
    Core(#[from] QuireError),
}

impl From<VoiceError> for QuireError {
    fn from(err: VoiceError) -> Self {
        match err {
            VoiceError::Core(inner) => inner,
            other => QuireError::Voice(other.to_string()),
        }
    }
}
