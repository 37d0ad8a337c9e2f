//! Quire voice calls - the listen, think, speak turn-taking loop.
//!
//! A call moves through Idle -> Listening -> Processing -> Speaking and back
//! to Listening until it is ended. While the assistant speaks, a second
//! recognizer session listens for the user interrupting; an interruption
//! stops playback and goes straight to Processing.

pub mod boundary;
pub mod error;
pub mod machine;
pub mod session;
pub mod state;

pub use boundary::{
    PermissionGate, RecognitionSession, RecognizerCallback, RecognizerError, RecognizerErrorKind,
    RecognizerEvent, SpeechRecognizer, SpeechSynthesizer, StaticPermission,
};
pub use error::VoiceError;
pub use machine::{VoiceCallDeps, VoiceCallStateMachine};
pub use session::VoiceCallSession;
