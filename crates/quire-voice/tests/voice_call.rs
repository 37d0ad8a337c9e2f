//! Integration tests for the voice call loop.
//!
//! The recognizer, synthesizer, permission gate, and store are in-memory
//! fakes the tests drive directly; completions come from a scripted
//! transport.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use quire_chat::{CompletionFailure, ScriptStep, ScriptedTransport};
use quire_core::config::QuireConfig;
use quire_core::events::{EngineEvent, EventBus};
use quire_core::store::ConversationStore;
use quire_core::types::{CallState, Message, Role, VoiceCallMessage};
use quire_voice::{
    RecognitionSession, RecognizerCallback, RecognizerError, RecognizerErrorKind,
    RecognizerEvent, SpeechRecognizer, SpeechSynthesizer, StaticPermission, VoiceCallDeps,
    VoiceCallSession, VoiceCallStateMachine, VoiceError,
};

// =============================================================================
// Fakes
// =============================================================================

struct FakeSession {
    callback: RecognizerCallback,
    stopped: Arc<AtomicBool>,
}

#[derive(Default)]
struct FakeRecognizer {
    sessions: Mutex<Vec<FakeSession>>,
    start_errors: Mutex<VecDeque<RecognizerError>>,
}

impl FakeRecognizer {
    fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Deliver an event through the callback of session `index`.
    fn emit(&self, index: usize, event: RecognizerEvent) {
        let callback = self.sessions.lock().unwrap()[index].callback.clone();
        callback(event);
    }

    fn is_stopped(&self, index: usize) -> bool {
        self.sessions.lock().unwrap()[index].stopped.load(Ordering::SeqCst)
    }

    fn all_stopped(&self) -> bool {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .all(|s| s.stopped.load(Ordering::SeqCst))
    }

    fn fail_next_start(&self, error: RecognizerError) {
        self.start_errors.lock().unwrap().push_back(error);
    }
}

struct FakeSessionHandle(Arc<AtomicBool>);

impl RecognitionSession for FakeSessionHandle {
    fn stop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl SpeechRecognizer for FakeRecognizer {
    fn start(
        &self,
        on_event: RecognizerCallback,
    ) -> Result<Box<dyn RecognitionSession>, RecognizerError> {
        if let Some(error) = self.start_errors.lock().unwrap().pop_front() {
            return Err(error);
        }
        let stopped = Arc::new(AtomicBool::new(false));
        self.sessions.lock().unwrap().push(FakeSession {
            callback: on_event,
            stopped: stopped.clone(),
        });
        Ok(Box::new(FakeSessionHandle(stopped)))
    }
}

#[derive(Default)]
struct FakeSynthesizer {
    spoken: Mutex<Vec<String>>,
    pending: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    stops: AtomicUsize,
}

impl FakeSynthesizer {
    fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }

    fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Finish the most recent utterance.
    fn finish(&self) {
        let done = self.pending.lock().unwrap().pop();
        if let Some(done) = done {
            done();
        }
    }
}

impl SpeechSynthesizer for FakeSynthesizer {
    fn speak(&self, text: &str, on_complete: Box<dyn FnOnce() + Send>) {
        self.spoken.lock().unwrap().push(text.to_string());
        self.pending.lock().unwrap().push(on_complete);
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().unwrap().clear();
    }
}

#[derive(Default)]
struct MemoryStore {
    created: AtomicUsize,
    appends: Mutex<Vec<(Uuid, Vec<Message>)>>,
    history: Mutex<Vec<Message>>,
}

impl MemoryStore {
    fn appends(&self) -> Vec<(Uuid, Vec<Message>)> {
        self.appends.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn create_conversation(&self, _title: Option<String>) -> quire_core::Result<Uuid> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Uuid::new_v4())
    }

    async fn append(&self, conversation_id: Uuid, messages: &[Message]) -> quire_core::Result<()> {
        self.appends
            .lock()
            .unwrap()
            .push((conversation_id, messages.to_vec()));
        Ok(())
    }

    async fn load_messages(&self, _conversation_id: Uuid) -> quire_core::Result<Vec<Message>> {
        Ok(self.history.lock().unwrap().clone())
    }
}

// =============================================================================
// Harness
// =============================================================================

const WAIT: Duration = Duration::from_secs(5);

const DONE: &str =
    r#"{"done":true,"usage":{"input_tokens":3,"output_tokens":2,"total_tokens":5}}"#;

struct Harness {
    machine: VoiceCallStateMachine,
    recognizer: Arc<FakeRecognizer>,
    synthesizer: Arc<FakeSynthesizer>,
    store: Arc<MemoryStore>,
    transport: Arc<ScriptedTransport>,
    events: broadcast::Receiver<EngineEvent>,
}

impl Harness {
    fn new(transport: ScriptedTransport) -> Self {
        Self::with(transport, true, QuireConfig::default())
    }

    fn with(transport: ScriptedTransport, granted: bool, config: QuireConfig) -> Self {
        let recognizer = Arc::new(FakeRecognizer::default());
        let synthesizer = Arc::new(FakeSynthesizer::default());
        let store = Arc::new(MemoryStore::default());
        let transport = Arc::new(transport);
        let bus = EventBus::default();
        let events = bus.subscribe();

        let deps = VoiceCallDeps {
            recognizer: recognizer.clone(),
            synthesizer: synthesizer.clone(),
            permissions: Arc::new(StaticPermission(granted)),
            store: store.clone(),
            transport: transport.clone(),
        };
        let machine = VoiceCallStateMachine::spawn(deps, &config, bus);

        Self {
            machine,
            recognizer,
            synthesizer,
            store,
            transport,
            events,
        }
    }

    async fn wait_until(&self, mut pred: impl FnMut(&VoiceCallSession) -> bool) -> VoiceCallSession {
        let mut rx = self.machine.watch();
        let guard = tokio::time::timeout(WAIT, rx.wait_for(|s| pred(s)))
            .await
            .expect("timed out waiting for call state")
            .expect("call task stopped");
        let snapshot = guard.clone();
        drop(guard);
        snapshot
    }

    async fn wait_for_state(&self, state: CallState) -> VoiceCallSession {
        self.wait_until(|s| s.state == state).await
    }

    async fn wait_for_sessions(&self, count: usize) {
        tokio::time::timeout(WAIT, async {
            while self.recognizer.session_count() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for recognizer session");
    }

    async fn wait_for_opens(&self, count: usize) {
        tokio::time::timeout(WAIT, async {
            while self.transport.open_count() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for completion request");
    }

    /// Start a call, say `text`, and wait for the assistant to speak.
    async fn reach_speaking(&self, text: &str) -> VoiceCallSession {
        assert!(self.machine.start_call(None).await.unwrap());
        self.wait_for_sessions(1).await;
        self.recognizer
            .emit(0, RecognizerEvent::Final(text.to_string()));
        self.wait_for_state(CallState::Speaking).await
    }

    fn drain_events(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

fn answer(content: &str) -> Vec<ScriptStep> {
    vec![
        ScriptStep::Frame(format!(r#"{{"content":"{}","done":false}}"#, content)),
        ScriptStep::Frame(DONE.to_string()),
    ]
}

fn transitions(events: &[EngineEvent]) -> Vec<(CallState, CallState)> {
    events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::CallStateChanged { from, to, .. } => Some((*from, *to)),
            _ => None,
        })
        .collect()
}

// =============================================================================
// Turn taking
// =============================================================================

#[tokio::test]
async fn test_hello_streams_and_speaks_answer() {
    let mut h = Harness::new(ScriptedTransport::frames([
        r#"{"content":"Hi","done":false}"#,
        r#"{"content":"Hi there","done":false}"#,
        DONE,
    ]));

    let session = h.reach_speaking("hello").await;

    assert_eq!(session.ai_response, "Hi there");
    assert_eq!(
        session.messages,
        vec![
            VoiceCallMessage::new(Role::User, "hello"),
            VoiceCallMessage::new(Role::Assistant, "Hi there"),
        ]
    );
    assert_eq!(h.synthesizer.spoken(), vec!["Hi there".to_string()]);
    // Primary session stopped, barge-in listener running.
    assert_eq!(h.recognizer.session_count(), 2);
    assert!(h.recognizer.is_stopped(0));
    assert!(!h.recognizer.is_stopped(1));

    let events = h.drain_events();
    assert_eq!(
        transitions(&events),
        vec![
            (CallState::Idle, CallState::Listening),
            (CallState::Listening, CallState::Processing),
            (CallState::Processing, CallState::Speaking),
        ]
    );
    let streamed: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::AssistantText { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, vec!["Hi", "Hi there"]);
}

#[tokio::test]
async fn test_synthesis_done_returns_to_listening() {
    let h = Harness::new(ScriptedTransport::new(answer("Sure")));
    h.reach_speaking("remind me").await;

    h.synthesizer.finish();
    h.wait_for_state(CallState::Listening).await;

    // Barge-in listener stopped before the new primary session started.
    assert!(h.recognizer.is_stopped(1));
    assert_eq!(h.recognizer.session_count(), 3);
    assert!(!h.recognizer.is_stopped(2));
}

#[tokio::test]
async fn test_spoken_and_stored_answer_match_streamed_text() {
    let h = Harness::new(ScriptedTransport::new(answer(" Sure thing.\\n")));
    let session = h.reach_speaking("help").await;

    assert_eq!(session.ai_response, " Sure thing.\n");
    assert_eq!(
        session.messages.last(),
        Some(&VoiceCallMessage::new(Role::Assistant, " Sure thing.\n"))
    );
    assert_eq!(h.synthesizer.spoken(), vec![" Sure thing.\n".to_string()]);
}

#[tokio::test]
async fn test_barge_in_interrupts_speech() {
    let h = Harness::new(ScriptedTransport::turns(vec![
        answer("Hi there"),
        vec![ScriptStep::Hang],
    ]));
    h.reach_speaking("hello").await;

    h.recognizer
        .emit(1, RecognizerEvent::Final("wait".into()));
    let session = h.wait_for_state(CallState::Processing).await;

    assert_eq!(h.synthesizer.stops(), 1);
    assert!(h.recognizer.is_stopped(1));
    assert_eq!(
        session.messages.last(),
        Some(&VoiceCallMessage::new(Role::User, "wait"))
    );
    assert_eq!(session.messages.len(), 3);

    h.wait_for_opens(2).await;
    let context = h.transport.last_context().unwrap();
    assert_eq!(context.messages().len(), 3);
    assert_eq!(context.messages()[2].content, "wait");
}

#[tokio::test]
async fn test_barge_partial_does_not_interrupt() {
    let h = Harness::new(ScriptedTransport::new(answer("Long answer")));
    h.reach_speaking("tell me").await;

    h.recognizer
        .emit(1, RecognizerEvent::Partial("uh".into()));
    h.synthesizer.finish();
    h.wait_for_state(CallState::Listening).await;

    assert_eq!(h.synthesizer.stops(), 0);
    assert_eq!(h.transport.open_count(), 1);
}

#[tokio::test]
async fn test_barge_event_while_listening_is_ignored() {
    let h = Harness::new(ScriptedTransport::new(answer("Okay")));
    h.reach_speaking("hi").await;
    h.synthesizer.finish();
    h.wait_for_state(CallState::Listening).await;
    h.wait_for_sessions(3).await;

    // Late final from the stopped barge-in listener.
    h.recognizer
        .emit(1, RecognizerEvent::Final("stop".into()));
    // Events are handled in order, so once this partial shows up the
    // stale final has been processed.
    h.recognizer
        .emit(2, RecognizerEvent::Partial("and".into()));
    let session = h.wait_until(|s| s.recognized_text == "and").await;

    assert_eq!(session.state, CallState::Listening);
    assert_eq!(session.messages.len(), 2);
    assert_eq!(h.transport.open_count(), 1);
    assert_eq!(h.synthesizer.stops(), 0);
}

#[tokio::test]
async fn test_empty_final_restarts_recognition() {
    let h = Harness::new(ScriptedTransport::new(answer("unused")));
    assert!(h.machine.start_call(None).await.unwrap());
    h.wait_for_sessions(1).await;

    h.recognizer.emit(0, RecognizerEvent::Final("   ".into()));
    h.wait_for_sessions(2).await;

    assert!(h.recognizer.is_stopped(0));
    assert_eq!(h.machine.state(), CallState::Listening);
    assert_eq!(h.transport.open_count(), 0);
}

#[tokio::test]
async fn test_stale_primary_events_are_discarded() {
    let h = Harness::new(ScriptedTransport::new(answer("unused")));
    assert!(h.machine.start_call(None).await.unwrap());
    h.wait_for_sessions(1).await;
    h.recognizer.emit(0, RecognizerEvent::Final("".into()));
    h.wait_for_sessions(2).await;

    h.recognizer
        .emit(0, RecognizerEvent::Final("from the old session".into()));
    h.recognizer
        .emit(1, RecognizerEvent::Partial("fresh".into()));
    let session = h.wait_until(|s| s.recognized_text == "fresh").await;

    assert_eq!(session.state, CallState::Listening);
    assert!(session.messages.is_empty());
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_partial_answer_is_salvaged() {
    let h = Harness::new(ScriptedTransport::new(vec![
        ScriptStep::Frame(r#"{"content":"Partial answ","done":false}"#.into()),
        ScriptStep::Fail(CompletionFailure::Transport("connection reset".into())),
    ]));

    let session = h.reach_speaking("explain").await;

    assert_eq!(session.ai_response, "Partial answ");
    assert_eq!(h.synthesizer.spoken(), vec!["Partial answ".to_string()]);
}

#[tokio::test]
async fn test_empty_failure_emits_notice_and_listens() {
    let mut h = Harness::new(ScriptedTransport::failing(CompletionFailure::RateLimited));
    assert!(h.machine.start_call(None).await.unwrap());
    h.wait_for_sessions(1).await;

    h.recognizer.emit(0, RecognizerEvent::Final("hello".into()));
    h.wait_for_sessions(2).await;
    let session = h.wait_for_state(CallState::Listening).await;

    assert_eq!(session.messages.len(), 1);
    assert!(h.synthesizer.spoken().is_empty());
    let events = h.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::TransientNotice { .. })));
    assert!(transitions(&events).contains(&(CallState::Processing, CallState::Listening)));
}

#[tokio::test]
async fn test_salvage_can_be_disabled() {
    let mut config = QuireConfig::default();
    config.voice.salvage_partial = false;
    let h = Harness::with(
        ScriptedTransport::new(vec![
            ScriptStep::Frame(r#"{"content":"Partial","done":false}"#.into()),
            ScriptStep::Fail(CompletionFailure::Transport("reset".into())),
        ]),
        true,
        config,
    );
    assert!(h.machine.start_call(None).await.unwrap());
    h.wait_for_sessions(1).await;
    h.recognizer.emit(0, RecognizerEvent::Final("go".into()));
    h.wait_for_sessions(2).await;

    assert_eq!(h.machine.state(), CallState::Listening);
    assert!(h.synthesizer.spoken().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transient_recognizer_error_retries_after_delay() {
    let h = Harness::new(ScriptedTransport::new(answer("unused")));
    assert!(h.machine.start_call(None).await.unwrap());
    h.wait_for_sessions(1).await;

    h.recognizer.emit(
        0,
        RecognizerEvent::Error(RecognizerError::new(
            RecognizerErrorKind::Transient,
            "audio route changed",
        )),
    );
    h.wait_for_sessions(2).await;

    assert!(h.recognizer.is_stopped(0));
    assert_eq!(h.machine.state(), CallState::Listening);
}

#[tokio::test]
async fn test_fatal_recognizer_error_ends_call() {
    let mut h = Harness::new(ScriptedTransport::new(answer("unused")));
    assert!(h.machine.start_call(None).await.unwrap());
    h.wait_for_sessions(1).await;

    h.recognizer.emit(
        0,
        RecognizerEvent::Error(RecognizerError::new(
            RecognizerErrorKind::Fatal,
            "engine crashed",
        )),
    );
    h.wait_for_state(CallState::Idle).await;
    // Idle is published before the call-ended event.
    h.machine.end_call().await.unwrap();

    assert!(h.recognizer.all_stopped());
    assert!(h.store.appends().is_empty());
    let events = h.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::CallEnded { turns: 0, .. })));
}

#[tokio::test]
async fn test_recognizer_failing_to_start_with_permission_error_ends_call() {
    let mut h = Harness::new(ScriptedTransport::new(answer("unused")));
    h.recognizer.fail_next_start(RecognizerError::new(
        RecognizerErrorKind::Permission,
        "microphone revoked",
    ));

    assert!(!h.machine.start_call(None).await.unwrap());
    assert_eq!(h.machine.state(), CallState::Idle);
    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, EngineEvent::PermissionRequired { .. })));
}

// =============================================================================
// Start and teardown
// =============================================================================

#[tokio::test]
async fn test_permission_denied_stays_idle() {
    let mut h = Harness::with(
        ScriptedTransport::new(answer("unused")),
        false,
        QuireConfig::default(),
    );

    assert!(!h.machine.start_call(None).await.unwrap());
    assert_eq!(h.machine.state(), CallState::Idle);
    assert_eq!(h.recognizer.session_count(), 0);
    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, EngineEvent::PermissionRequired { .. })));
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let h = Harness::new(ScriptedTransport::new(answer("unused")));
    assert!(h.machine.start_call(None).await.unwrap());
    assert!(matches!(
        h.machine.start_call(None).await,
        Err(VoiceError::AlreadyActive)
    ));
}

#[tokio::test]
async fn test_concurrent_end_calls_tear_down_once() {
    let h = Harness::new(ScriptedTransport::new(answer("Hi there")));
    h.reach_speaking("hello").await;

    let (first, second) = tokio::join!(h.machine.end_call(), h.machine.end_call());
    first.unwrap();
    second.unwrap();

    assert_eq!(h.machine.state(), CallState::Idle);
    assert_eq!(h.synthesizer.stops(), 1);
    assert!(h.recognizer.all_stopped());
    assert_eq!(h.store.created.load(Ordering::SeqCst), 1);

    let appends = h.store.appends();
    assert_eq!(appends.len(), 1);
    let contents: Vec<_> = appends[0].1.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["hello", "Hi there"]);

    // A third call after teardown is still a no-op.
    h.machine.end_call().await.unwrap();
    assert_eq!(h.store.appends().len(), 1);
    assert_eq!(h.synthesizer.stops(), 1);
}

#[tokio::test]
async fn test_end_call_on_idle_is_noop() {
    let h = Harness::new(ScriptedTransport::new(answer("unused")));
    h.machine.end_call().await.unwrap();
    assert_eq!(h.synthesizer.stops(), 0);
    assert!(h.store.appends().is_empty());
}

#[tokio::test]
async fn test_end_call_while_processing_cancels_completion() {
    let h = Harness::new(ScriptedTransport::new(vec![ScriptStep::Hang]));
    assert!(h.machine.start_call(None).await.unwrap());
    h.wait_for_sessions(1).await;
    h.recognizer.emit(0, RecognizerEvent::Final("hello".into()));
    h.wait_for_state(CallState::Processing).await;

    h.machine.end_call().await.unwrap();

    assert_eq!(h.machine.state(), CallState::Idle);
    let appends = h.store.appends();
    assert_eq!(appends.len(), 1);
    assert_eq!(appends[0].1.len(), 1);
    assert!(h.synthesizer.spoken().is_empty());
}

#[tokio::test]
async fn test_linked_conversation_history_and_save() {
    let h = Harness::new(ScriptedTransport::new(answer("Welcome back")));
    *h.store.history.lock().unwrap() = vec![
        Message::user("earlier question"),
        Message::assistant("earlier answer", None),
    ];
    let linked = Uuid::new_v4();

    assert!(h.machine.start_call(Some(linked)).await.unwrap());
    h.wait_for_sessions(1).await;
    h.recognizer.emit(0, RecognizerEvent::Final("hi again".into()));
    h.wait_for_state(CallState::Speaking).await;

    let context = h.transport.last_context().unwrap();
    let contents: Vec<_> = context.messages().iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["earlier question", "earlier answer", "hi again"]);

    h.machine.end_call().await.unwrap();
    let appends = h.store.appends();
    assert_eq!(appends.len(), 1);
    assert_eq!(appends[0].0, linked);
    assert_eq!(h.store.created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_new_call_after_end_resets_session() {
    let h = Harness::new(ScriptedTransport::new(answer("One")));
    h.reach_speaking("first").await;
    h.machine.end_call().await.unwrap();

    assert!(h.machine.start_call(None).await.unwrap());
    let session = h.machine.snapshot();
    assert_eq!(session.state, CallState::Listening);
    assert!(session.messages.is_empty());

    h.machine.end_call().await.unwrap();
    // Nothing said in the second call, so nothing new is saved.
    assert_eq!(h.store.appends().len(), 1);
}
