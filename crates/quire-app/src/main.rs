//! Quire application binary - composition root.
//!
//! 1. Parse arguments and load configuration from TOML
//! 2. Install tracing
//! 3. Open the conversation database
//! 4. Run the requested command (chat, replay, markup, voice)

mod cli;
mod console;
mod output;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use quire_chat::{
    ChatSession, CompletenessDetector, CompletionCoordinator, CompletionOutcome,
    CompletionTransport, HttpCompletionTransport, ScriptedTransport, TurnResult,
};
use quire_core::config::QuireConfig;
use quire_core::events::{EngineEvent, EventBus};
use quire_core::types::{CompletionContext, Conversation, Message, ModelTier};
use quire_storage::{ConversationRepository, Database};
use quire_voice::{StaticPermission, VoiceCallDeps, VoiceCallStateMachine};

use crate::cli::{expand_home, CliArgs, Command};
use crate::console::{ConsoleRecognizer, ConsoleSynthesizer};
use crate::output::{describe_check, describe_outcome, StreamPrinter};

type AppResult<T> = Result<T, Box<dyn std::error::Error>>;

const TITLE_CHARS: usize = 60;

#[tokio::main]
async fn main() -> AppResult<()> {
    let args = CliArgs::parse();

    let config_file = args.resolve_config_path();
    let mut config = if config_file.exists() {
        QuireConfig::load(&config_file)?
    } else {
        QuireConfig::default()
    };
    if let Some(dir) = args.resolve_data_dir() {
        config.general.data_dir = dir;
    }

    let log_level = args.resolve_log_level(&config.general.log_level);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(path = %config_file.display(), "Configuration resolved");

    match args.command {
        Command::Chat {
            prompt,
            tier,
            thinking,
            conversation,
        } => {
            let repo = open_repository(&config)?;
            run_chat(&config, repo, &prompt, tier, thinking, conversation).await
        }
        Command::Replay { frames } => run_replay(&config, &frames).await,
        Command::Markup { file, html } => run_markup(&config, &file, html).await,
        Command::Voice {
            conversation,
            frames,
        } => {
            let repo = open_repository(&config)?;
            run_voice(&config, repo, conversation, frames.as_deref()).await
        }
    }
}

fn open_repository(config: &QuireConfig) -> AppResult<ConversationRepository> {
    let db_path = expand_home(&config.general.data_dir).join("quire.db");
    let db = Database::new(&db_path)?;
    tracing::info!(path = %db_path.display(), "SQLite database opened");
    Ok(ConversationRepository::new(Arc::new(db)))
}

fn title_for(prompt: &str) -> String {
    let line = prompt.lines().next().unwrap_or_default().trim();
    line.chars().take(TITLE_CHARS).collect()
}

// =============================================================================
// chat
// =============================================================================

async fn run_chat(
    config: &QuireConfig,
    repo: ConversationRepository,
    prompt: &str,
    tier: Option<ModelTier>,
    thinking: bool,
    conversation_id: Option<Uuid>,
) -> AppResult<()> {
    let conversation = match conversation_id {
        Some(id) => repo.load_conversation(id)?,
        None => {
            let title = title_for(prompt);
            let id = repo.create(Some(&title))?;
            Conversation::with_id(id, Some(title))
        }
    };
    let conversation_id = conversation.id;
    let stored = conversation.len();

    let transport = Arc::new(HttpCompletionTransport::new(&config.completion)?);
    let mut session = ChatSession::new(conversation, transport, config.completion.idle_timeout());
    session.set_model_tier(tier.unwrap_or(config.completion.default_tier));
    session.set_thinking(thinking || config.completion.thinking);

    let handle = session.send_user_message(prompt, Vec::new(), Arc::new(StreamPrinter::default()))?;
    tracing::info!(
        conversation_id = %conversation_id,
        turn_id = handle.turn_id(),
        tier = %session.model_tier(),
        "Chat turn started"
    );

    let outcome = tokio::select! {
        outcome = handle.outcome() => outcome,
        _ = tokio::signal::ctrl_c() => {
            session.cancel();
            CompletionOutcome::Cancelled
        }
    };
    tracing::info!(conversation_id = %conversation_id, "Turn {}", describe_outcome(&outcome));

    match session.finish_turn(outcome) {
        TurnResult::Appended(_) => {}
        TurnResult::RetryAvailable {
            failure,
            partial_content,
        } => {
            eprintln!("{}", failure.user_message());
            if partial_content.is_some() {
                eprintln!("The partial answer above was not saved.");
            }
        }
        TurnResult::Cancelled => eprintln!("Cancelled."),
    }

    let new_messages = &session.conversation().messages()[stored..];
    repo.append_messages(conversation_id, new_messages)?;
    eprintln!("conversation {}", conversation_id);
    Ok(())
}

// =============================================================================
// replay
// =============================================================================

async fn run_replay(config: &QuireConfig, frames: &Path) -> AppResult<()> {
    let recorded = std::fs::read_to_string(frames)?;
    let transport = Arc::new(ScriptedTransport::from_ndjson(&recorded));
    let coordinator = CompletionCoordinator::from_config(transport, &config.completion);

    let context = CompletionContext::new(
        vec![Message::user(format!("replay of {}", frames.display()))],
        config.completion.default_tier,
        config.completion.thinking,
    );
    let outcome = coordinator
        .send(context, Arc::new(StreamPrinter::default()))?
        .outcome()
        .await;
    println!("outcome: {}", describe_outcome(&outcome));

    let detector = CompletenessDetector::from_config(&config.rendering);
    let check = detector
        .check(outcome.salvageable_content().unwrap_or_default())
        .await;
    println!("markup: {}", describe_check(&check));
    Ok(())
}

// =============================================================================
// markup
// =============================================================================

async fn run_markup(config: &QuireConfig, file: &Path, html: bool) -> AppResult<()> {
    let text = std::fs::read_to_string(file)?;
    let detector = CompletenessDetector::from_config(&config.rendering);
    let check = detector.check(&text).await;

    println!("{}", describe_check(&check));
    if html {
        if let Some(document) = &check.document {
            println!("{}", document.html());
        }
    }
    Ok(())
}

// =============================================================================
// voice
// =============================================================================

async fn run_voice(
    config: &QuireConfig,
    repo: ConversationRepository,
    conversation_id: Option<Uuid>,
    frames: Option<&Path>,
) -> AppResult<()> {
    let transport: Arc<dyn CompletionTransport> = match frames {
        Some(path) => Arc::new(ScriptedTransport::from_ndjson(&std::fs::read_to_string(path)?)),
        None => Arc::new(HttpCompletionTransport::new(&config.completion)?),
    };

    let recognizer = Arc::new(ConsoleRecognizer::new());
    let deps = VoiceCallDeps {
        recognizer: recognizer.clone(),
        synthesizer: Arc::new(ConsoleSynthesizer::new(Duration::from_millis(250))),
        permissions: Arc::new(StaticPermission(true)),
        store: Arc::new(repo),
        transport,
    };

    let bus = EventBus::default();
    tokio::spawn(print_call_events(bus.subscribe()));
    let machine = VoiceCallStateMachine::spawn(deps, config, bus);

    if !machine.start_call(conversation_id).await? {
        eprintln!("Microphone access is needed for a voice call.");
        return Ok(());
    }
    eprintln!("Listening. Type what you would say; /quit or Ctrl-C ends the call.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim() == "/quit" => break,
                Some(line) => recognizer.hear(&line),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
        if !machine.snapshot().is_active() {
            break;
        }
    }

    machine.end_call().await?;
    let session = machine.snapshot();
    if let Some(id) = session.conversation_id {
        eprintln!("conversation {}", id);
    }
    machine.shutdown();
    Ok(())
}

async fn print_call_events(mut events: broadcast::Receiver<EngineEvent>) {
    loop {
        match events.recv().await {
            Ok(EngineEvent::CallStateChanged { to, .. }) => eprintln!("[{}]", to),
            Ok(EngineEvent::TransientNotice { message, .. }) => eprintln!("! {}", message),
            Ok(EngineEvent::PermissionRequired { .. }) => {
                eprintln!("! Microphone permission is required")
            }
            Ok(EngineEvent::CallEnded { turns, .. }) => eprintln!("Call ended after {} turns", turns),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Call event printer lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
