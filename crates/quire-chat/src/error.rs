//! Error types for streaming completions and text chat.

use quire_core::error::QuireError;

/// A wire frame that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("frame is empty")]
    Empty,
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame has unknown field: {0}")]
    UnknownField(String),
    #[error("frame is missing field: {0}")]
    MissingField(&'static str),
    #[error("frame field has the wrong type: {0}")]
    InvalidField(&'static str),
}

/// Why a completion turn ended without success.
///
/// Local cancellation is not a failure; see
/// [`CompletionOutcome::Cancelled`](crate::coordinator::CompletionOutcome::Cancelled).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompletionFailure {
    #[error("rate limited by the completion service")]
    RateLimited,
    #[error("completion service error (status {0})")]
    ServerError(u16),
    #[error("authorization expired")]
    AuthExpired,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed frame: {0}")]
    Parse(String),
    #[error("unknown completion error: {0}")]
    Unknown(String),
}

impl CompletionFailure {
    /// Classify an HTTP status returned by the transport.
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        match status {
            401 => CompletionFailure::AuthExpired,
            429 => CompletionFailure::RateLimited,
            500..=599 => CompletionFailure::ServerError(status),
            _ => CompletionFailure::Unknown(format!("HTTP {}: {}", status, detail.into())),
        }
    }

    /// Short text suitable for a transient notice or retry banner.
    pub fn user_message(&self) -> &'static str {
        match self {
            CompletionFailure::RateLimited => "Too many requests. Please wait a moment.",
            CompletionFailure::ServerError(_) => "The assistant is unavailable right now.",
            CompletionFailure::AuthExpired => "Your session has expired. Please sign in again.",
            CompletionFailure::Transport(_) => "Connection lost.",
            CompletionFailure::Parse(_) | CompletionFailure::Unknown(_) => {
                "Something went wrong."
            }
        }
    }
}

impl From<ParseError> for CompletionFailure {
    fn from(err: ParseError) -> Self {
        CompletionFailure::Parse(err.to_string())
    }
}

/// Errors from the text chat surface.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("a completion is already in flight")]
    Busy,
    #[error("message cannot be empty")]
    EmptyMessage,
    #[error("there is no user turn to answer")]
    NothingToRetry,
    #[error(transparent)]
    Core(#[from] QuireError),
}
