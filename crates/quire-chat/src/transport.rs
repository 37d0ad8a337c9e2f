//! Completion transports.
//!
//! A transport opens one completion request and yields the raw wire frames
//! of its response, already delimited. Decoding and accumulation happen in
//! the coordinator, so transports stay thin.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::future::ready;
use futures_util::{Stream, StreamExt};
use reqwest::header::ACCEPT;
use serde_json::{json, Value};

use quire_core::config::CompletionConfig;
use quire_core::error::QuireError;
use quire_core::types::CompletionContext;

use crate::error::CompletionFailure;

/// Raw frames of one completion response.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, CompletionFailure>> + Send>>;

/// Sentinel event some services send after the terminal frame.
const DONE_SENTINEL: &str = "[DONE]";

#[async_trait]
pub trait CompletionTransport: Send + Sync {
    /// Start a completion request for `context`.
    async fn open(&self, context: &CompletionContext) -> Result<FrameStream, CompletionFailure>;
}

// =============================================================================
// HTTP / server-sent events
// =============================================================================

/// Streams completions from an HTTP endpoint speaking server-sent events.
pub struct HttpCompletionTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpCompletionTransport {
    pub fn new(config: &CompletionConfig) -> Result<Self, QuireError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| QuireError::Config(format!("Failed to build HTTP client: {}", e)))?;

        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.is_empty());
        if api_key.is_none() {
            tracing::warn!(
                env = %config.api_key_env,
                "No API key set, sending unauthenticated requests"
            );
        }

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl CompletionTransport for HttpCompletionTransport {
    async fn open(&self, context: &CompletionContext) -> Result<FrameStream, CompletionFailure> {
        tracing::debug!(
            endpoint = %self.endpoint,
            messages = context.messages().len(),
            tier = %context.model_tier(),
            "Opening completion stream"
        );

        let mut request = self
            .client
            .post(&self.endpoint)
            .header(ACCEPT, "text/event-stream")
            .json(&request_body(context));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CompletionFailure::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "Completion request rejected");
            return Err(CompletionFailure::from_status(status.as_u16(), detail));
        }

        let frames = response
            .bytes_stream()
            .eventsource()
            .take_while(|event| {
                ready(!matches!(event, Ok(e) if e.data.trim() == DONE_SENTINEL))
            })
            .filter_map(|event| {
                ready(match event {
                    Ok(e) if e.data.trim().is_empty() => None,
                    Ok(e) => Some(Ok(e.data)),
                    Err(e) => Some(Err(CompletionFailure::Transport(e.to_string()))),
                })
            });

        Ok(Box::pin(frames))
    }
}

/// JSON request body for a completion.
pub fn request_body(context: &CompletionContext) -> Value {
    let messages: Vec<Value> = context
        .messages()
        .iter()
        .map(|m| {
            let mut entry = json!({
                "role": m.role.as_str(),
                "content": m.content,
            });
            if !m.attachments.is_empty() {
                entry["attachments"] = json!(m.attachments);
            }
            entry
        })
        .collect();

    json!({
        "messages": messages,
        "model_tier": context.model_tier().as_str(),
        "thinking": context.thinking(),
        "stream": true,
    })
}

// =============================================================================
// Scripted
// =============================================================================

/// One step of a scripted response.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Yield a raw wire frame.
    Frame(String),
    /// Pause before the next step.
    Delay(Duration),
    /// Yield a transport error.
    Fail(CompletionFailure),
    /// Never yield again.
    Hang,
}

/// Replays canned responses. Used by tests and the `replay` command.
///
/// Each `open` consumes the next script; the last one is reused once the
/// queue is down to a single entry.
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Vec<ScriptStep>>>,
    open_error: Option<CompletionFailure>,
    open_count: AtomicUsize,
    last_context: Mutex<Option<CompletionContext>>,
}

impl ScriptedTransport {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self::turns(vec![steps])
    }

    /// One response per turn, in order.
    pub fn turns(scripts: Vec<Vec<ScriptStep>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            open_error: None,
            open_count: AtomicUsize::new(0),
            last_context: Mutex::new(None),
        }
    }

    pub fn frames<I, S>(frames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(frames.into_iter().map(|f| ScriptStep::Frame(f.into())).collect())
    }

    /// Every `open` fails with `failure`.
    pub fn failing(failure: CompletionFailure) -> Self {
        Self {
            open_error: Some(failure),
            ..Self::turns(Vec::new())
        }
    }

    /// One frame per non-blank line.
    pub fn from_ndjson(text: &str) -> Self {
        Self::frames(text.lines().map(str::trim).filter(|l| !l.is_empty()))
    }

    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }

    /// Context of the most recent `open`.
    pub fn last_context(&self) -> Option<CompletionContext> {
        self.last_context
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn next_script(&self) -> Vec<ScriptStep> {
        let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
        if scripts.len() > 1 {
            scripts.pop_front().unwrap_or_default()
        } else {
            scripts.front().cloned().unwrap_or_default()
        }
    }
}

#[async_trait]
impl CompletionTransport for ScriptedTransport {
    async fn open(&self, context: &CompletionContext) -> Result<FrameStream, CompletionFailure> {
        self.open_count.fetch_add(1, Ordering::SeqCst);
        *self.last_context.lock().unwrap_or_else(|e| e.into_inner()) = Some(context.clone());

        if let Some(failure) = &self.open_error {
            return Err(failure.clone());
        }
        Ok(script_stream(self.next_script()))
    }
}

fn script_stream(steps: Vec<ScriptStep>) -> FrameStream {
    let steps: VecDeque<ScriptStep> = steps.into();
    Box::pin(futures_util::stream::unfold(steps, |mut steps| async move {
        loop {
            match steps.pop_front()? {
                ScriptStep::Frame(raw) => return Some((Ok(raw), steps)),
                ScriptStep::Fail(failure) => return Some((Err(failure), steps)),
                ScriptStep::Delay(duration) => tokio::time::sleep(duration).await,
                ScriptStep::Hang => std::future::pending::<()>().await,
            }
        }
    }))
}
