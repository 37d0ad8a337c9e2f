//! The voice call loop.
//!
//! One task owns the call. Public methods, recognizer and synthesizer
//! callbacks, permission answers, timers, and completion progress all arrive
//! as [`CallEvent`]s on one unbounded channel and are handled strictly one
//! at a time. Every callback is tagged with the token of the session, turn,
//! or utterance that produced it; events whose token is no longer current
//! are dropped.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use uuid::Uuid;

use quire_chat::{CompletionCoordinator, CompletionObserver, CompletionOutcome, CompletionTransport};
use quire_core::config::{QuireConfig, VoiceConfig};
use quire_core::events::{EngineEvent, EventBus};
use quire_core::store::ConversationStore;
use quire_core::types::{CallState, CompletionContext, Message, Role, VoiceCallMessage};

use crate::boundary::{
    PermissionGate, RecognitionSession, RecognizerCallback, RecognizerError, RecognizerErrorKind,
    RecognizerEvent, SpeechRecognizer, SpeechSynthesizer,
};
use crate::error::VoiceError;
use crate::session::VoiceCallSession;
use crate::state::validate_transition;

/// Collaborators injected into a call.
pub struct VoiceCallDeps {
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub permissions: Arc<dyn PermissionGate>,
    pub store: Arc<dyn ConversationStore>,
    pub transport: Arc<dyn CompletionTransport>,
}

enum CallEvent {
    StartCall {
        conversation_id: Option<Uuid>,
        reply: oneshot::Sender<Result<bool, VoiceError>>,
    },
    PermissionResolved {
        attempt: u64,
        granted: bool,
    },
    EndCall {
        reply: oneshot::Sender<()>,
    },
    Recognizer {
        token: u64,
        event: RecognizerEvent,
    },
    RetryListening {
        token: u64,
    },
    CompletionUpdate {
        token: u64,
        content: String,
    },
    CompletionFinished {
        token: u64,
        outcome: CompletionOutcome,
    },
    SynthesisFinished {
        token: u64,
    },
    Shutdown,
}

type EventSender = mpsc::WeakUnboundedSender<CallEvent>;

fn post(events: &EventSender, event: CallEvent) {
    if let Some(tx) = events.upgrade() {
        let _ = tx.send(event);
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Handle to a running call loop. Cheap to clone.
#[derive(Clone)]
pub struct VoiceCallStateMachine {
    tx: mpsc::UnboundedSender<CallEvent>,
    snapshot: watch::Receiver<VoiceCallSession>,
    bus: EventBus,
}

impl VoiceCallStateMachine {
    /// Spawn the call task. Must be called within a Tokio runtime.
    pub fn spawn(deps: VoiceCallDeps, config: &QuireConfig, bus: EventBus) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(VoiceCallSession::default());

        let actor = CallActor {
            coordinator: CompletionCoordinator::from_config(
                deps.transport.clone(),
                &config.completion,
            ),
            deps,
            settings: config.voice.clone(),
            bus: bus.clone(),
            snapshot_tx,
            events: tx.downgrade(),
            session: VoiceCallSession::default(),
            history: Vec::new(),
            ended: true,
            saved: true,
            next_token: 0,
            retries: 0,
            pending_start: None,
            primary: None,
            barge: None,
            turn: None,
            speech: None,
            retry: None,
        };
        tokio::spawn(actor.run(rx));

        Self { tx, snapshot, bus }
    }

    /// Ask for the microphone and start a call.
    ///
    /// Resolves to `false` when permission is denied, in which case a
    /// [`EngineEvent::PermissionRequired`] is published and the call stays
    /// idle.
    pub async fn start_call(&self, conversation_id: Option<Uuid>) -> Result<bool, VoiceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CallEvent::StartCall {
                conversation_id,
                reply,
            })
            .map_err(|_| VoiceError::ActorGone)?;
        rx.await.map_err(|_| VoiceError::ActorGone)?
    }

    /// End the call and save its turns. Safe to call repeatedly.
    pub async fn end_call(&self) -> Result<(), VoiceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CallEvent::EndCall { reply })
            .map_err(|_| VoiceError::ActorGone)?;
        rx.await.map_err(|_| VoiceError::ActorGone)
    }

    pub fn snapshot(&self) -> VoiceCallSession {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> CallState {
        self.snapshot.borrow().state
    }

    pub fn watch(&self) -> watch::Receiver<VoiceCallSession> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    /// End any call and stop the task.
    pub fn shutdown(&self) {
        let _ = self.tx.send(CallEvent::Shutdown);
    }
}

// =============================================================================
// Call task
// =============================================================================

struct Listener {
    token: u64,
    session: Box<dyn RecognitionSession>,
}

struct PendingStart {
    attempt: u64,
    conversation_id: Option<Uuid>,
    reply: oneshot::Sender<Result<bool, VoiceError>>,
}

/// Forwards completion progress into the call task.
struct TurnObserver {
    token: u64,
    events: EventSender,
}

impl CompletionObserver for TurnObserver {
    fn on_content_update(&self, content: &str) {
        post(
            &self.events,
            CallEvent::CompletionUpdate {
                token: self.token,
                content: content.to_string(),
            },
        );
    }

    // The outcome is taken from the handle so cancellation is seen too.
    fn on_complete(&self, _outcome: &CompletionOutcome) {}
}

struct CallActor {
    deps: VoiceCallDeps,
    settings: VoiceConfig,
    coordinator: CompletionCoordinator,
    bus: EventBus,
    snapshot_tx: watch::Sender<VoiceCallSession>,
    events: EventSender,

    session: VoiceCallSession,
    /// Prior messages of the linked conversation, sent as context.
    history: Vec<Message>,
    /// Teardown already ran for this call.
    ended: bool,
    /// Turns already handed to the store for this call.
    saved: bool,
    next_token: u64,
    retries: u32,

    pending_start: Option<PendingStart>,
    primary: Option<Listener>,
    barge: Option<Listener>,
    turn: Option<u64>,
    speech: Option<u64>,
    retry: Option<u64>,
}

impl CallActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<CallEvent>) {
        tracing::debug!("Voice call task started");
        while let Some(event) = rx.recv().await {
            if matches!(event, CallEvent::Shutdown) {
                break;
            }
            self.handle(event).await;
            self.publish_snapshot();
        }
        self.end_call().await;
        self.publish_snapshot();
        tracing::debug!("Voice call task stopped");
    }

    async fn handle(&mut self, event: CallEvent) {
        match event {
            CallEvent::StartCall {
                conversation_id,
                reply,
            } => self.on_start_call(conversation_id, reply),
            CallEvent::PermissionResolved { attempt, granted } => {
                self.on_permission(attempt, granted).await
            }
            CallEvent::EndCall { reply } => {
                self.end_call().await;
                let _ = reply.send(());
            }
            CallEvent::Recognizer { token, event } => self.on_recognizer(token, event).await,
            CallEvent::RetryListening { token } => self.on_retry(token).await,
            CallEvent::CompletionUpdate { token, content } => {
                self.on_completion_update(token, content)
            }
            CallEvent::CompletionFinished { token, outcome } => {
                self.on_completion_finished(token, outcome).await
            }
            CallEvent::SynthesisFinished { token } => self.on_synthesis_finished(token).await,
            CallEvent::Shutdown => {}
        }
    }

    fn next_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    // -------------------------------------------------------------------------
    // Start
    // -------------------------------------------------------------------------

    fn on_start_call(
        &mut self,
        conversation_id: Option<Uuid>,
        reply: oneshot::Sender<Result<bool, VoiceError>>,
    ) {
        if self.session.is_active() || self.pending_start.is_some() {
            let _ = reply.send(Err(VoiceError::AlreadyActive));
            return;
        }

        let attempt = self.next_token();
        self.pending_start = Some(PendingStart {
            attempt,
            conversation_id,
            reply,
        });

        let permissions = self.deps.permissions.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let granted = permissions.request_microphone().await;
            post(&events, CallEvent::PermissionResolved { attempt, granted });
        });
    }

    async fn on_permission(&mut self, attempt: u64, granted: bool) {
        let pending = match self.pending_start.take() {
            Some(pending) if pending.attempt == attempt => pending,
            other => {
                self.pending_start = other;
                return;
            }
        };

        if !granted {
            tracing::info!("Microphone permission denied, call not started");
            self.bus.publish(EngineEvent::PermissionRequired {
                timestamp: Utc::now(),
            });
            let _ = pending.reply.send(Ok(false));
            return;
        }

        self.session = VoiceCallSession::start(pending.conversation_id);
        self.ended = false;
        self.saved = false;
        self.retries = 0;
        self.history = load_history(
            self.deps.store.as_ref(),
            pending.conversation_id,
            self.settings.history_messages,
        )
        .await;

        tracing::info!(
            call_id = %self.session.id,
            history = self.history.len(),
            "Voice call started"
        );
        self.transition(CallState::Listening);
        self.listen().await;
        let _ = pending.reply.send(Ok(self.session.is_active()));
    }

    // -------------------------------------------------------------------------
    // Listening
    // -------------------------------------------------------------------------

    async fn listen(&mut self) {
        if let Err(e) = self.start_primary() {
            self.on_listen_error(e).await;
        }
    }

    fn start_primary(&mut self) -> Result<(), RecognizerError> {
        self.stop_primary();
        let token = self.next_token();
        let session = self.deps.recognizer.start(self.recognizer_callback(token))?;
        self.primary = Some(Listener { token, session });
        self.session.recognized_text.clear();
        Ok(())
    }

    fn start_barge(&mut self) {
        self.stop_barge();
        let token = self.next_token();
        match self.deps.recognizer.start(self.recognizer_callback(token)) {
            Ok(session) => self.barge = Some(Listener { token, session }),
            Err(e) => {
                tracing::warn!(error = %e, "Barge-in listener unavailable, reply cannot be interrupted")
            }
        }
    }

    fn recognizer_callback(&self, token: u64) -> RecognizerCallback {
        let events = self.events.clone();
        Arc::new(move |event| post(&events, CallEvent::Recognizer { token, event }))
    }

    fn stop_primary(&mut self) {
        if let Some(mut listener) = self.primary.take() {
            listener.session.stop();
        }
    }

    fn stop_barge(&mut self) {
        if let Some(mut listener) = self.barge.take() {
            listener.session.stop();
        }
    }

    async fn on_listen_error(&mut self, error: RecognizerError) {
        if error.is_transient() && self.retries < self.settings.max_recognizer_retries {
            self.retries += 1;
            tracing::warn!(error = %error, attempt = self.retries, "Recognizer error, retrying");

            let token = self.next_token();
            self.retry = Some(token);
            let delay = self.settings.retry_delay();
            let events = self.events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                post(&events, CallEvent::RetryListening { token });
            });
            return;
        }

        tracing::warn!(error = %error, "Recognizer cannot continue, ending call");
        if error.kind == RecognizerErrorKind::Permission {
            self.bus.publish(EngineEvent::PermissionRequired {
                timestamp: Utc::now(),
            });
        } else {
            self.notice("Speech recognition stopped working.");
        }
        self.end_call().await;
    }

    async fn on_retry(&mut self, token: u64) {
        if self.retry != Some(token) {
            return;
        }
        self.retry = None;
        if self.session.state == CallState::Listening {
            self.listen().await;
        }
    }

    async fn on_recognizer(&mut self, token: u64, event: RecognizerEvent) {
        if self.primary.as_ref().is_some_and(|l| l.token == token) {
            self.on_primary_event(event).await;
        } else if self.barge.as_ref().is_some_and(|l| l.token == token) {
            self.on_barge_event(event).await;
        } else {
            tracing::debug!(token, "Discarding event from stale recognizer session");
        }
    }

    async fn on_primary_event(&mut self, event: RecognizerEvent) {
        if self.session.state != CallState::Listening {
            return;
        }

        match event {
            RecognizerEvent::Partial(text) => self.recognized(text),
            RecognizerEvent::Final(text) => {
                let text = text.trim();
                if text.is_empty() {
                    tracing::debug!("No speech heard, restarting recognition");
                    self.transition(CallState::Listening);
                    self.listen().await;
                } else {
                    self.stop_primary();
                    self.retries = 0;
                    self.begin_user_turn(text.to_string()).await;
                }
            }
            RecognizerEvent::Error(error) => {
                self.stop_primary();
                self.on_listen_error(error).await;
            }
        }
    }

    async fn on_barge_event(&mut self, event: RecognizerEvent) {
        if self.session.state != CallState::Speaking {
            tracing::debug!(state = %self.session.state, "Ignoring barge-in listener event");
            return;
        }

        match event {
            RecognizerEvent::Partial(_) => {}
            RecognizerEvent::Final(text) => {
                let text = text.trim();
                if text.is_empty() {
                    self.start_barge();
                    return;
                }
                tracing::info!(call_id = %self.session.id, "User interrupted the assistant");
                self.deps.synthesizer.stop();
                self.speech = None;
                self.stop_barge();
                self.begin_user_turn(text.to_string()).await;
            }
            RecognizerEvent::Error(error) => {
                tracing::debug!(error = %error, "Barge-in listener failed");
                self.stop_barge();
            }
        }
    }

    fn recognized(&mut self, text: String) {
        self.session.recognized_text = text.clone();
        self.bus.publish(EngineEvent::RecognizedText {
            call_id: self.session.id,
            text,
            timestamp: Utc::now(),
        });
    }

    // -------------------------------------------------------------------------
    // Processing
    // -------------------------------------------------------------------------

    async fn begin_user_turn(&mut self, text: String) {
        self.recognized(text.clone());
        self.append_turn(Role::User, text);
        self.session.ai_response.clear();
        self.transition(CallState::Processing);
        self.request_completion().await;
    }

    async fn request_completion(&mut self) {
        self.coordinator.cancel();
        let token = self.next_token();
        self.turn = Some(token);

        let observer = Arc::new(TurnObserver {
            token,
            events: self.events.clone(),
        });
        match self.coordinator.send(self.completion_context(), observer) {
            Ok(handle) => {
                let events = self.events.clone();
                tokio::spawn(async move {
                    let outcome = handle.outcome().await;
                    post(&events, CallEvent::CompletionFinished { token, outcome });
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not start completion");
                self.turn = None;
                self.notice("The assistant is unavailable right now.");
                self.resume_listening().await;
            }
        }
    }

    fn completion_context(&self) -> CompletionContext {
        let mut messages = self.history.clone();
        messages.extend(self.session.messages.iter().map(VoiceCallMessage::to_message));
        CompletionContext::new(messages, self.settings.model_tier, self.settings.thinking)
    }

    fn on_completion_update(&mut self, token: u64, content: String) {
        if self.turn != Some(token) || self.session.state != CallState::Processing {
            return;
        }
        self.session.ai_response = content.clone();
        self.bus.publish(EngineEvent::AssistantText {
            call_id: self.session.id,
            text: content,
            timestamp: Utc::now(),
        });
    }

    async fn on_completion_finished(&mut self, token: u64, outcome: CompletionOutcome) {
        if self.turn != Some(token) {
            tracing::debug!(token, "Discarding stale completion outcome");
            return;
        }
        self.turn = None;
        if self.session.state != CallState::Processing {
            return;
        }

        match outcome {
            CompletionOutcome::Success { content, .. } => {
                if content.trim().is_empty() {
                    self.notice("The assistant had nothing to say.");
                    self.resume_listening().await;
                } else {
                    self.speak(content);
                }
            }
            CompletionOutcome::Failure { failure, partial } => {
                let salvaged = if self.settings.salvage_partial {
                    partial.salvageable_content().map(str::to_string)
                } else {
                    None
                };
                match salvaged {
                    Some(text) => {
                        tracing::warn!(error = %failure, "Completion failed, speaking partial answer");
                        self.speak(text);
                    }
                    None => {
                        tracing::warn!(error = %failure, "Completion failed");
                        self.notice(failure.user_message());
                        self.resume_listening().await;
                    }
                }
            }
            CompletionOutcome::Cancelled => {
                tracing::debug!("Completion cancelled, resuming listening");
                self.resume_listening().await;
            }
        }
    }

    async fn resume_listening(&mut self) {
        self.transition(CallState::Listening);
        self.listen().await;
    }

    // -------------------------------------------------------------------------
    // Speaking
    // -------------------------------------------------------------------------

    fn speak(&mut self, text: String) {
        self.session.ai_response = text.clone();
        self.append_turn(Role::Assistant, text.clone());
        self.transition(CallState::Speaking);

        let token = self.next_token();
        self.speech = Some(token);
        let events = self.events.clone();
        self.deps.synthesizer.speak(
            &text,
            Box::new(move || post(&events, CallEvent::SynthesisFinished { token })),
        );
        self.start_barge();
    }

    async fn on_synthesis_finished(&mut self, token: u64) {
        if self.speech != Some(token) {
            return;
        }
        self.speech = None;
        if self.session.state != CallState::Speaking {
            return;
        }
        self.stop_barge();
        self.resume_listening().await;
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    async fn end_call(&mut self) {
        if let Some(pending) = self.pending_start.take() {
            let _ = pending.reply.send(Ok(false));
        }

        if !self.ended {
            self.ended = true;
            self.stop_primary();
            self.stop_barge();
            self.deps.synthesizer.stop();
            self.coordinator.cancel();
            self.turn = None;
            self.speech = None;
            self.retry = None;
            self.transition(CallState::Idle);
            tracing::info!(
                call_id = %self.session.id,
                turns = self.session.messages.len(),
                elapsed_secs = self.session.elapsed_secs(),
                "Voice call ended"
            );
        }

        if !self.saved {
            self.saved = true;
            self.persist().await;
        }
    }

    async fn persist(&mut self) {
        let call_id = self.session.id;
        let turns = self.session.messages.len();

        if turns > 0 {
            let messages: Vec<Message> = self
                .session
                .messages
                .iter()
                .map(VoiceCallMessage::to_message)
                .collect();
            let saved = save_turns(
                self.deps.store.as_ref(),
                self.session.conversation_id,
                self.session.started_at,
                &messages,
            )
            .await;
            match saved {
                Ok(id) => self.session.conversation_id = Some(id),
                Err(e) => {
                    tracing::error!(call_id = %call_id, error = %e, "Failed to save voice call");
                    self.notice("The call could not be saved.");
                }
            }
        }

        self.bus.publish(EngineEvent::CallEnded {
            call_id,
            turns,
            conversation_id: self.session.conversation_id,
            timestamp: Utc::now(),
        });
    }

    // -------------------------------------------------------------------------
    // Publishing
    // -------------------------------------------------------------------------

    fn transition(&mut self, to: CallState) {
        let from = self.session.state;
        if let Err(e) = validate_transition(from, to) {
            tracing::error!(error = %e, "Rejected call state change");
            return;
        }

        tracing::debug!(call_id = %self.session.id, from = %from, to = %to, "Call state changed");
        self.session.state = to;
        self.bus.publish(EngineEvent::CallStateChanged {
            call_id: self.session.id,
            from,
            to,
            timestamp: Utc::now(),
        });
        self.publish_snapshot();
    }

    fn append_turn(&mut self, role: Role, content: String) {
        self.session.push_turn(role, content.clone());
        self.bus.publish(EngineEvent::TurnAppended {
            call_id: self.session.id,
            role,
            content,
            timestamp: Utc::now(),
        });
    }

    fn notice(&self, message: &str) {
        self.bus.publish(EngineEvent::TransientNotice {
            call_id: self.session.id,
            message: message.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_if_modified(|current| {
            if *current == self.session {
                false
            } else {
                *current = self.session.clone();
                true
            }
        });
    }
}

/// The last `keep` messages of a linked conversation.
async fn load_history(
    store: &dyn ConversationStore,
    conversation_id: Option<Uuid>,
    keep: usize,
) -> Vec<Message> {
    let Some(id) = conversation_id else {
        return Vec::new();
    };
    match store.load_messages(id).await {
        Ok(mut messages) => {
            if messages.len() > keep {
                messages.drain(..messages.len() - keep);
            }
            messages
        }
        Err(e) => {
            tracing::warn!(conversation_id = %id, error = %e, "Failed to load call history");
            Vec::new()
        }
    }
}

/// Append the call's turns, creating a conversation when none is linked.
async fn save_turns(
    store: &dyn ConversationStore,
    conversation_id: Option<Uuid>,
    started_at: Option<DateTime<Utc>>,
    messages: &[Message],
) -> quire_core::Result<Uuid> {
    let id = match conversation_id {
        Some(id) => id,
        None => store.create_conversation(Some(call_title(started_at))).await?,
    };
    store.append(id, messages).await?;
    tracing::debug!(conversation_id = %id, messages = messages.len(), "Voice call saved");
    Ok(id)
}

fn call_title(started_at: Option<DateTime<Utc>>) -> String {
    let started = started_at.unwrap_or_else(Utc::now);
    format!("Voice call {}", started.format("%Y-%m-%d %H:%M"))
}
