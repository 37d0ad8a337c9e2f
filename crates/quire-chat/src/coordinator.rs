//! Single-flight completion coordination.
//!
//! [`CompletionCoordinator`] owns at most one in-flight completion. It
//! drives the transport, decodes and accumulates frames, and reports the
//! cumulative text to an observer. Cancellation is synchronous from the
//! caller's point of view: once [`CompletionCoordinator::cancel`] returns,
//! the cancelled turn delivers nothing more.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use quire_core::config::CompletionConfig;
use quire_core::types::{CompletionContext, Message, TokenUsage};

use crate::accumulator::{BufferChange, StreamingAccumulator, StreamingBuffer};
use crate::error::{ChatError, CompletionFailure};
use crate::frame::{StreamFrameParser, TerminalOutcome};
use crate::transport::CompletionTransport;

/// How a completion turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    Success {
        content: String,
        reasoning: Option<String>,
        usage: TokenUsage,
    },
    Failure {
        failure: CompletionFailure,
        partial: StreamingBuffer,
    },
    /// Cancelled locally. Never reported through `on_complete`.
    Cancelled,
}

impl CompletionOutcome {
    /// Text worth keeping from this turn, if any.
    pub fn salvageable_content(&self) -> Option<&str> {
        match self {
            CompletionOutcome::Success { content, .. } => {
                let trimmed = content.trim();
                (!trimmed.is_empty()).then_some(trimmed)
            }
            CompletionOutcome::Failure { partial, .. } => partial.salvageable_content(),
            CompletionOutcome::Cancelled => None,
        }
    }

    pub fn offers_retry(&self) -> bool {
        matches!(self, CompletionOutcome::Failure { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CompletionOutcome::Cancelled)
    }

    /// The assistant message for a successful turn.
    pub fn to_message(&self) -> Option<Message> {
        match self {
            CompletionOutcome::Success {
                content, reasoning, ..
            } => Some(Message::assistant(content.clone(), reasoning.clone())),
            _ => None,
        }
    }
}

/// Receives progress of one completion turn.
///
/// Updates carry the full accumulated string, never a suffix. Within one
/// frame the reasoning update precedes the content update.
pub trait CompletionObserver: Send + Sync {
    fn on_content_update(&self, content: &str);

    fn on_reasoning_update(&self, _reasoning: &str) {}

    /// Called once per turn, unless the turn is cancelled.
    fn on_complete(&self, outcome: &CompletionOutcome);
}

type TextCallback = Box<dyn Fn(&str) + Send + Sync>;
type OutcomeCallback = Box<dyn Fn(&CompletionOutcome) + Send + Sync>;

/// Closure-backed [`CompletionObserver`].
pub struct CompletionCallbacks {
    content: TextCallback,
    reasoning: TextCallback,
    complete: OutcomeCallback,
}

impl CompletionCallbacks {
    pub fn new(
        on_content: impl Fn(&str) + Send + Sync + 'static,
        on_complete: impl Fn(&CompletionOutcome) + Send + Sync + 'static,
    ) -> Self {
        Self {
            content: Box::new(on_content),
            reasoning: Box::new(|_| {}),
            complete: Box::new(on_complete),
        }
    }

    pub fn with_reasoning(mut self, on_reasoning: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.reasoning = Box::new(on_reasoning);
        self
    }

    pub fn noop() -> Self {
        Self::new(|_| {}, |_| {})
    }
}

impl CompletionObserver for CompletionCallbacks {
    fn on_content_update(&self, content: &str) {
        (self.content)(content)
    }

    fn on_reasoning_update(&self, reasoning: &str) {
        (self.reasoning)(reasoning)
    }

    fn on_complete(&self, outcome: &CompletionOutcome) {
        (self.complete)(outcome)
    }
}

/// Resolves when the turn ends, including by cancellation.
#[derive(Debug)]
pub struct CompletionHandle {
    turn_id: u64,
    rx: oneshot::Receiver<CompletionOutcome>,
}

impl CompletionHandle {
    pub fn turn_id(&self) -> u64 {
        self.turn_id
    }

    pub async fn outcome(self) -> CompletionOutcome {
        self.rx.await.unwrap_or(CompletionOutcome::Cancelled)
    }
}

// =============================================================================
// Delivery gate
// =============================================================================

/// Serializes callback delivery against cancellation.
///
/// Closing waits for a delivery in progress on another thread, so nothing
/// runs after `close` returns. A callback that cancels its own turn closes
/// the gate re-entrantly without waiting on itself.
struct TurnGate {
    live: AtomicBool,
    delivery: Mutex<()>,
    delivering_on: Mutex<Option<ThreadId>>,
}

impl TurnGate {
    fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            delivery: Mutex::new(()),
            delivering_on: Mutex::new(None),
        }
    }

    fn deliver(&self, f: impl FnOnce()) -> bool {
        let _guard = self.delivery.lock().unwrap_or_else(|e| e.into_inner());
        if !self.live.load(Ordering::SeqCst) {
            return false;
        }
        *self.delivering_on.lock().unwrap_or_else(|e| e.into_inner()) = Some(thread::current().id());
        f();
        *self.delivering_on.lock().unwrap_or_else(|e| e.into_inner()) = None;
        true
    }

    /// Returns whether the gate was still open.
    fn close(&self) -> bool {
        let was_live = self.live.swap(false, Ordering::SeqCst);
        let reentrant = *self.delivering_on.lock().unwrap_or_else(|e| e.into_inner())
            == Some(thread::current().id());
        if !reentrant {
            drop(self.delivery.lock().unwrap_or_else(|e| e.into_inner()));
        }
        was_live
    }
}

// =============================================================================
// Coordinator
// =============================================================================

struct ActiveTurn {
    id: u64,
    token: CancellationToken,
    gate: Arc<TurnGate>,
    outcome_tx: Option<oneshot::Sender<CompletionOutcome>>,
}

#[derive(Default)]
struct TurnState {
    active: Option<ActiveTurn>,
    /// Gate of a turn that has left `active` but may still owe `on_complete`.
    finishing: Option<Arc<TurnGate>>,
    next_turn: u64,
}

fn lock_state(state: &Mutex<TurnState>) -> MutexGuard<'_, TurnState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Runs at most one completion at a time.
pub struct CompletionCoordinator {
    transport: Arc<dyn CompletionTransport>,
    idle_timeout: Duration,
    state: Arc<Mutex<TurnState>>,
}

impl CompletionCoordinator {
    pub fn new(transport: Arc<dyn CompletionTransport>, idle_timeout: Duration) -> Self {
        Self {
            transport,
            idle_timeout,
            state: Arc::new(Mutex::new(TurnState::default())),
        }
    }

    pub fn from_config(transport: Arc<dyn CompletionTransport>, config: &CompletionConfig) -> Self {
        Self::new(transport, config.idle_timeout())
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn is_busy(&self) -> bool {
        lock_state(&self.state).active.is_some()
    }

    /// Start a completion turn.
    ///
    /// Fails with [`ChatError::Busy`] while another turn is in flight. The
    /// turn is no longer in flight by the time `on_complete` runs, so the
    /// observer may start the next turn from there. Must be called within a
    /// Tokio runtime.
    pub fn send(
        &self,
        context: CompletionContext,
        observer: Arc<dyn CompletionObserver>,
    ) -> Result<CompletionHandle, ChatError> {
        let mut state = lock_state(&self.state);
        if state.active.is_some() {
            return Err(ChatError::Busy);
        }

        state.next_turn += 1;
        let turn_id = state.next_turn;
        let token = CancellationToken::new();
        let gate = Arc::new(TurnGate::new());
        let (tx, rx) = oneshot::channel();
        state.active = Some(ActiveTurn {
            id: turn_id,
            token: token.clone(),
            gate: gate.clone(),
            outcome_tx: Some(tx),
        });
        drop(state);

        tracing::debug!(
            turn = turn_id,
            messages = context.messages().len(),
            tier = %context.model_tier(),
            "Starting completion"
        );

        let run = TurnRun {
            turn_id,
            transport: self.transport.clone(),
            idle_timeout: self.idle_timeout,
            state: self.state.clone(),
            gate,
            observer,
            token,
        };
        tokio::spawn(run.execute(context));

        Ok(CompletionHandle { turn_id, rx })
    }

    /// Cancel the in-flight turn.
    ///
    /// Returns `false` when there was nothing left to stop. On return the
    /// turn's callbacks have stopped and its handle resolves to
    /// [`CompletionOutcome::Cancelled`]. This holds even for a turn whose
    /// stream already ended but whose `on_complete` has not run yet.
    pub fn cancel(&self) -> bool {
        let (active, finishing) = {
            let mut state = lock_state(&self.state);
            (state.active.take(), state.finishing.take())
        };
        let stopped_finish = finishing.is_some_and(|gate| gate.close());
        let Some(mut turn) = active else {
            return stopped_finish;
        };

        turn.token.cancel();
        turn.gate.close();
        if let Some(tx) = turn.outcome_tx.take() {
            let _ = tx.send(CompletionOutcome::Cancelled);
        }
        tracing::debug!(turn = turn.id, "Completion cancelled");
        true
    }
}

impl Drop for CompletionCoordinator {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// The spawned half of one turn.
struct TurnRun {
    turn_id: u64,
    transport: Arc<dyn CompletionTransport>,
    idle_timeout: Duration,
    state: Arc<Mutex<TurnState>>,
    gate: Arc<TurnGate>,
    observer: Arc<dyn CompletionObserver>,
    token: CancellationToken,
}

impl TurnRun {
    async fn execute(self, context: CompletionContext) {
        let outcome = tokio::select! {
            biased;
            _ = self.token.cancelled() => return,
            outcome = self.stream(&context) => outcome,
        };
        self.finish(outcome);
    }

    async fn stream(&self, context: &CompletionContext) -> CompletionOutcome {
        let mut accumulator = StreamingAccumulator::new();

        let mut frames = match self.transport.open(context).await {
            Ok(frames) => frames,
            Err(failure) => return failed(failure, accumulator),
        };

        loop {
            let next = match tokio::time::timeout(self.idle_timeout, frames.next()).await {
                Ok(next) => next,
                Err(_) => {
                    let failure = CompletionFailure::Transport(format!(
                        "no frame received within {}s",
                        self.idle_timeout.as_secs_f32()
                    ));
                    return failed(failure, accumulator);
                }
            };

            let raw = match next {
                Some(Ok(raw)) => raw,
                Some(Err(failure)) => return failed(failure, accumulator),
                None => {
                    let failure =
                        CompletionFailure::Transport("stream ended before terminal frame".into());
                    return failed(failure, accumulator);
                }
            };

            let parsed = match StreamFrameParser::parse(&raw) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!(turn = self.turn_id, error = %e, "Malformed completion frame");
                    return failed(e.into(), accumulator);
                }
            };

            let mut change = BufferChange::default();
            for frame in parsed {
                let applied = accumulator.apply(frame);
                change.content |= applied.content;
                change.reasoning |= applied.reasoning;
                change.completed |= applied.completed;
            }

            if change.reasoning {
                let reasoning = accumulator.buffer().reasoning();
                if !self.gate.deliver(|| self.observer.on_reasoning_update(reasoning)) {
                    return CompletionOutcome::Cancelled;
                }
            }
            if change.content {
                let content = accumulator.buffer().content();
                if !self.gate.deliver(|| self.observer.on_content_update(content)) {
                    return CompletionOutcome::Cancelled;
                }
            }
            if change.completed {
                return completed(accumulator.into_buffer());
            }
        }
    }

    fn finish(&self, outcome: CompletionOutcome) {
        let tx = {
            let mut state = lock_state(&self.state);
            match state.active.as_ref() {
                Some(turn) if turn.id == self.turn_id => {}
                _ => return,
            }
            state.finishing = Some(self.gate.clone());
            state.active.take().and_then(|mut turn| turn.outcome_tx.take())
        };

        match &outcome {
            CompletionOutcome::Success { usage, .. } => tracing::debug!(
                turn = self.turn_id,
                output_tokens = usage.output_tokens,
                "Completion finished"
            ),
            CompletionOutcome::Failure { failure, .. } => {
                tracing::warn!(turn = self.turn_id, error = %failure, "Completion failed")
            }
            CompletionOutcome::Cancelled => {}
        }

        let delivered = self.gate.deliver(|| self.observer.on_complete(&outcome));
        {
            let mut state = lock_state(&self.state);
            if state
                .finishing
                .as_ref()
                .is_some_and(|gate| Arc::ptr_eq(gate, &self.gate))
            {
                state.finishing = None;
            }
        }

        if !delivered {
            tracing::debug!(turn = self.turn_id, "Completion cancelled before it was reported");
        }
        if let Some(tx) = tx {
            let _ = tx.send(if delivered { outcome } else { CompletionOutcome::Cancelled });
        }
    }
}

fn failed(failure: CompletionFailure, accumulator: StreamingAccumulator) -> CompletionOutcome {
    CompletionOutcome::Failure {
        failure,
        partial: accumulator.into_buffer(),
    }
}

fn completed(buffer: StreamingBuffer) -> CompletionOutcome {
    match buffer.outcome().cloned() {
        Some(TerminalOutcome::Success { usage }) => {
            let reasoning = (!buffer.reasoning().is_empty()).then(|| buffer.reasoning().to_string());
            CompletionOutcome::Success {
                content: buffer.content().to_string(),
                reasoning,
                usage,
            }
        }
        Some(TerminalOutcome::Failure(failure)) => CompletionOutcome::Failure {
            failure,
            partial: buffer,
        },
        None => CompletionOutcome::Failure {
            failure: CompletionFailure::Transport("stream ended before terminal frame".into()),
            partial: buffer,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ScriptStep, ScriptedTransport};
    use quire_core::types::{Message, ModelTier};
    use std::sync::atomic::AtomicUsize;

    fn context() -> CompletionContext {
        CompletionContext::new(vec![Message::user("hi")], ModelTier::Fast, false)
    }

    #[test]
    fn test_gate_blocks_after_close() {
        let gate = TurnGate::new();
        let calls = AtomicUsize::new(0);
        assert!(gate.deliver(|| {
            calls.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(gate.close());
        assert!(!gate.deliver(|| {
            calls.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_gate_close_is_reentrant() {
        let gate = TurnGate::new();
        // Must not deadlock.
        assert!(gate.deliver(|| assert!(gate.close())));
        assert!(!gate.close());
    }

    #[test]
    fn test_outcome_helpers() {
        let success = CompletionOutcome::Success {
            content: "  Hi  ".into(),
            reasoning: None,
            usage: TokenUsage::default(),
        };
        assert_eq!(success.salvageable_content(), Some("Hi"));
        assert!(!success.offers_retry());
        assert_eq!(success.to_message().unwrap().content, "  Hi  ");

        let failure = CompletionOutcome::Failure {
            failure: CompletionFailure::RateLimited,
            partial: StreamingBuffer::default(),
        };
        assert!(failure.offers_retry());
        assert_eq!(failure.salvageable_content(), None);
        assert!(failure.to_message().is_none());

        assert!(CompletionOutcome::Cancelled.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_reaches_turn_that_is_finishing() {
        let coordinator = CompletionCoordinator::new(
            Arc::new(ScriptedTransport::frames(Vec::<String>::new())),
            Duration::from_secs(1),
        );
        // The stream ended and the turn left `active`; `on_complete` is pending.
        let gate = Arc::new(TurnGate::new());
        lock_state(&coordinator.state).finishing = Some(gate.clone());

        assert!(!coordinator.is_busy());
        assert!(coordinator.cancel());
        assert!(!gate.deliver(|| panic!("on_complete delivered after cancel")));
        assert!(!coordinator.cancel());
    }

    #[tokio::test]
    async fn test_cancel_without_turn_returns_false() {
        let coordinator =
            CompletionCoordinator::new(Arc::new(ScriptedTransport::frames(Vec::<String>::new())), Duration::from_secs(1));
        assert!(!coordinator.cancel());
        assert!(!coordinator.is_busy());
    }

    #[tokio::test]
    async fn test_open_failure_reports_empty_partial() {
        let transport = Arc::new(ScriptedTransport::failing(CompletionFailure::ServerError(503)));
        let coordinator = CompletionCoordinator::new(transport, Duration::from_secs(1));
        let handle = coordinator
            .send(context(), Arc::new(CompletionCallbacks::noop()))
            .unwrap();
        match handle.outcome().await {
            CompletionOutcome::Failure { failure, partial } => {
                assert_eq!(failure, CompletionFailure::ServerError(503));
                assert_eq!(partial.content(), "");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(!coordinator.is_busy());
    }

    #[tokio::test]
    async fn test_transport_error_mid_stream_keeps_partial() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            ScriptStep::Frame(r#"{"content":"Half","done":false}"#.into()),
            ScriptStep::Fail(CompletionFailure::Transport("reset".into())),
        ]));
        let coordinator = CompletionCoordinator::new(transport, Duration::from_secs(1));
        let outcome = coordinator
            .send(context(), Arc::new(CompletionCallbacks::noop()))
            .unwrap()
            .outcome()
            .await;
        assert_eq!(outcome.salvageable_content(), Some("Half"));
        assert!(outcome.offers_retry());
    }
}
