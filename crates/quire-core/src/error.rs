use thiserror::Error;

/// Top-level error type for the Quire engine.
///
/// Subsystem crates define their own error types and implement
/// `From<SubsystemError> for QuireError` (or the reverse) so that the `?`
/// operator works across crate boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QuireError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(uuid::Uuid),

    #[error("Message not found: {0}")]
    MessageNotFound(uuid::Uuid),

    #[error("Completion error: {0}")]
    Completion(String),

    #[error("Voice error: {0}")]
    Voice(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl From<toml::de::Error> for QuireError {
    fn from(err: toml::de::Error) -> Self {
        QuireError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for QuireError {
    fn from(err: toml::ser::Error) -> Self {
        QuireError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for QuireError {
    fn from(err: serde_json::Error) -> Self {
        QuireError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Quire operations.
pub type Result<T> = std::result::Result<T, QuireError>;
