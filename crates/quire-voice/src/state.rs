//! Call state transition rules.
//!
//! Valid transitions:
//! - Idle -> Listening (call started, microphone granted)
//! - Listening -> Listening (no speech heard, recognition restarted)
//! - Listening -> Processing (user finished a turn)
//! - Processing -> Speaking (answer or salvaged partial answer)
//! - Processing -> Listening (nothing to say, or cancelled)
//! - Speaking -> Listening (synthesis finished)
//! - Speaking -> Processing (user interrupted)
//! - any active state -> Idle (call ended)

use quire_core::types::CallState;

use crate::error::VoiceError;

/// Returns whether moving from `from` to `to` is permitted.
pub fn can_transition(from: CallState, to: CallState) -> bool {
    use CallState::*;

    matches!(
        (from, to),
        (Idle, Listening)
            | (Listening, Listening)
            | (Listening, Processing)
            | (Processing, Speaking)
            | (Processing, Listening)
            | (Speaking, Listening)
            | (Speaking, Processing)
            // End call
            | (Listening, Idle)
            | (Processing, Idle)
            | (Speaking, Idle)
    )
}

pub fn validate_transition(from: CallState, to: CallState) -> Result<(), VoiceError> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(VoiceError::InvalidTransition { from, to })
    }
}
