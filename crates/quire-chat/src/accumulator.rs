//! Merging of stream frames into a growing buffer.
//!
//! Content and reasoning only ever grow within one turn, so a renderer can
//! always replace its view with the latest string without diffing.

use crate::frame::{StreamFrame, TerminalOutcome};

/// Text accumulated so far for one completion turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamingBuffer {
    content: String,
    reasoning: String,
    outcome: Option<TerminalOutcome>,
}

impl StreamingBuffer {
    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn is_complete(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn outcome(&self) -> Option<&TerminalOutcome> {
        self.outcome.as_ref()
    }

    /// Content worth presenting as a best-effort answer, if any.
    pub fn salvageable_content(&self) -> Option<&str> {
        let trimmed = self.content.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }
}

/// What a single [`StreamingAccumulator::apply`] call changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferChange {
    pub content: bool,
    pub reasoning: bool,
    pub completed: bool,
}

/// Applies frames of one turn to a [`StreamingBuffer`].
#[derive(Debug, Default)]
pub struct StreamingAccumulator {
    buffer: StreamingBuffer,
}

impl StreamingAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer(&self) -> &StreamingBuffer {
        &self.buffer
    }

    pub fn into_buffer(self) -> StreamingBuffer {
        self.buffer
    }

    /// Merge one frame.
    ///
    /// Cumulative deltas replace the field, others append. A cumulative
    /// snapshot shorter than what is already held is ignored, as is any
    /// frame after the terminal one.
    pub fn apply(&mut self, frame: StreamFrame) -> BufferChange {
        let mut change = BufferChange::default();
        if self.buffer.is_complete() {
            tracing::warn!("Frame received after terminal frame, ignoring");
            return change;
        }

        match frame {
            StreamFrame::ContentDelta { text, cumulative } => {
                change.content = merge(&mut self.buffer.content, text, cumulative);
            }
            StreamFrame::ReasoningDelta { text, cumulative } => {
                change.reasoning = merge(&mut self.buffer.reasoning, text, cumulative);
            }
            StreamFrame::Terminal(outcome) => {
                self.buffer.outcome = Some(outcome);
                change.completed = true;
            }
        }
        change
    }
}

fn merge(field: &mut String, text: String, cumulative: bool) -> bool {
    if cumulative {
        if text.len() < field.len() {
            tracing::debug!(
                held = field.len(),
                received = text.len(),
                "Shorter cumulative snapshot ignored"
            );
            return false;
        }
        if *field == text {
            return false;
        }
        *field = text;
        true
    } else {
        if text.is_empty() {
            return false;
        }
        field.push_str(&text);
        true
    }
}
