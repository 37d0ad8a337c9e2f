//! Streaming completions and text chat for Quire.
//!
//! Decodes completion wire frames, accumulates them into growing content
//! and reasoning buffers, judges when streamed markup is safe to render,
//! and runs single-flight completion turns for chat and voice.

pub mod accumulator;
pub mod completeness;
pub mod coordinator;
pub mod error;
pub mod frame;
pub mod session;
pub mod transport;

pub use accumulator::{BufferChange, StreamingAccumulator, StreamingBuffer};
pub use completeness::{CompletenessDetector, MarkupCheck, MarkupDocument, OpenConstruct};
pub use coordinator::{
    CompletionCallbacks, CompletionCoordinator, CompletionHandle, CompletionObserver,
    CompletionOutcome,
};
pub use error::{ChatError, CompletionFailure, ParseError};
pub use frame::{StreamFrame, StreamFrameParser, TerminalOutcome};
pub use session::{ChatSession, TurnResult};
pub use transport::{
    CompletionTransport, FrameStream, HttpCompletionTransport, ScriptStep, ScriptedTransport,
};
