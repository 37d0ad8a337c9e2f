//! Terminal output for streamed answers.

use std::io::Write;
use std::sync::Mutex;

use quire_chat::{CompletionObserver, CompletionOutcome, MarkupCheck};

/// Writes only the part of a cumulative snapshot not yet written.
///
/// A snapshot that does not extend the previous one is written in full on
/// a new line.
pub struct SuffixWriter<W> {
    inner: Mutex<(String, W)>,
}

impl<W: Write> SuffixWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Mutex::new((String::new(), writer)),
        }
    }

    pub fn update(&self, snapshot: &str) {
        let Ok(mut guard) = self.inner.lock() else {
            return;
        };
        let (written, writer) = &mut *guard;

        let result = match snapshot.strip_prefix(written.as_str()) {
            Some(suffix) => writer.write_all(suffix.as_bytes()),
            None => writer.write_all(format!("\n{}", snapshot).as_bytes()),
        };
        if let Err(e) = result.and_then(|_| writer.flush()) {
            tracing::debug!(error = %e, "Failed to write streamed text");
        }
        written.clear();
        written.push_str(snapshot);
    }

    #[cfg(test)]
    fn into_writer(self) -> W {
        match self.inner.into_inner() {
            Ok((_, writer)) => writer,
            Err(poisoned) => poisoned.into_inner().1,
        }
    }
}

/// Streams content to stdout and reasoning to stderr.
pub struct StreamPrinter {
    content: SuffixWriter<std::io::Stdout>,
    reasoning: SuffixWriter<std::io::Stderr>,
}

impl Default for StreamPrinter {
    fn default() -> Self {
        Self {
            content: SuffixWriter::new(std::io::stdout()),
            reasoning: SuffixWriter::new(std::io::stderr()),
        }
    }
}

impl CompletionObserver for StreamPrinter {
    fn on_content_update(&self, content: &str) {
        self.content.update(content);
    }

    fn on_reasoning_update(&self, reasoning: &str) {
        self.reasoning.update(reasoning);
    }

    fn on_complete(&self, _outcome: &CompletionOutcome) {
        println!();
    }
}

/// One-line summary of a finished turn.
pub fn describe_outcome(outcome: &CompletionOutcome) -> String {
    match outcome {
        CompletionOutcome::Success { usage, .. } => format!(
            "completed ({} input, {} output, {} total tokens)",
            usage.input_tokens, usage.output_tokens, usage.total_tokens
        ),
        CompletionOutcome::Failure { failure, partial } => match partial.salvageable_content() {
            Some(content) => format!(
                "failed after {} chars: {}",
                content.chars().count(),
                failure
            ),
            None => format!("failed: {}", failure),
        },
        CompletionOutcome::Cancelled => "cancelled".to_string(),
    }
}

pub fn describe_check(check: &MarkupCheck) -> String {
    if check.is_complete {
        "complete".to_string()
    } else {
        let open: Vec<String> = check.open.iter().map(|c| format!("{:?}", c)).collect();
        format!("incomplete, open: {}", open.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_chat::{CompletenessDetector, CompletionFailure, StreamingBuffer};
    use quire_core::types::TokenUsage;

    fn written(snapshots: &[&str]) -> String {
        let writer = SuffixWriter::new(Vec::new());
        for snapshot in snapshots {
            writer.update(snapshot);
        }
        String::from_utf8(writer.into_writer()).unwrap()
    }

    #[test]
    fn test_writes_growing_suffix() {
        assert_eq!(written(&["Hel", "Hello", "Hello, world"]), "Hello, world");
    }

    #[test]
    fn test_rewritten_snapshot_starts_new_line() {
        assert_eq!(written(&["Helo", "Hello"]), "Helo\nHello");
    }

    #[test]
    fn test_repeated_snapshot_writes_nothing() {
        assert_eq!(written(&["Same", "Same"]), "Same");
    }

    #[test]
    fn test_describe_outcome() {
        let success = CompletionOutcome::Success {
            content: "Hi".into(),
            reasoning: None,
            usage: TokenUsage {
                input_tokens: 3,
                output_tokens: 1,
                total_tokens: 4,
            },
        };
        assert_eq!(
            describe_outcome(&success),
            "completed (3 input, 1 output, 4 total tokens)"
        );

        let failure = CompletionOutcome::Failure {
            failure: CompletionFailure::RateLimited,
            partial: StreamingBuffer::default(),
        };
        assert!(describe_outcome(&failure).starts_with("failed: "));
        assert_eq!(describe_outcome(&CompletionOutcome::Cancelled), "cancelled");
    }

    #[test]
    fn test_describe_check() {
        let detector = CompletenessDetector::default();
        assert_eq!(describe_check(&detector.check_blocking("**done**")), "complete");
        assert_eq!(
            describe_check(&detector.check_blocking("**not yet")),
            "incomplete, open: Strong"
        );
    }
}
