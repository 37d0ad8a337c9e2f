//! Completion stream frame decoding.
//!
//! Each wire unit is one JSON object. A unit may carry a content snapshot,
//! a reasoning snapshot, a terminal marker, or an error, so decoding yields
//! an ordered list of [`StreamFrame`]s: reasoning first, then content, then
//! the terminal frame.

use serde_json::{Map, Value};

use quire_core::types::TokenUsage;

use crate::error::{CompletionFailure, ParseError};

const KNOWN_FIELDS: &[&str] = &[
    "content",
    "reasoning_content",
    "cumulative",
    "done",
    "usage",
    "error",
    "error_code",
];

/// One typed update of a completion stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    ContentDelta { text: String, cumulative: bool },
    ReasoningDelta { text: String, cumulative: bool },
    Terminal(TerminalOutcome),
}

impl StreamFrame {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamFrame::Terminal(_))
    }
}

/// How a stream ended, as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalOutcome {
    Success { usage: TokenUsage },
    Failure(CompletionFailure),
}

/// Decoder for single completion wire frames.
pub struct StreamFrameParser;

impl StreamFrameParser {
    /// Decode one already-delimited wire frame.
    ///
    /// Unknown fields, missing fields, and fields of the wrong type are all
    /// errors; callers treat any error as a failed turn.
    pub fn parse(raw: &str) -> Result<Vec<StreamFrame>, ParseError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ParseError::Empty);
        }

        let value: Value =
            serde_json::from_str(trimmed).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
        let Value::Object(map) = value else {
            return Err(ParseError::NotAnObject);
        };

        if let Some(unknown) = map.keys().find(|k| !KNOWN_FIELDS.contains(&k.as_str())) {
            return Err(ParseError::UnknownField(unknown.clone()));
        }

        let done = map
            .get("done")
            .ok_or(ParseError::MissingField("done"))?
            .as_bool()
            .ok_or(ParseError::InvalidField("done"))?;

        if let Some(message) = error_message(&map)? {
            let failure = classify_error(map.get("error_code"), message);
            return Ok(vec![StreamFrame::Terminal(TerminalOutcome::Failure(failure))]);
        }

        let cumulative = match map.get("cumulative") {
            None => true,
            Some(v) => v.as_bool().ok_or(ParseError::InvalidField("cumulative"))?,
        };

        let mut frames = Vec::with_capacity(3);
        if let Some(text) = optional_str(&map, "reasoning_content")? {
            frames.push(StreamFrame::ReasoningDelta { text, cumulative });
        }
        if let Some(text) = optional_str(&map, "content")? {
            frames.push(StreamFrame::ContentDelta { text, cumulative });
        }

        if done {
            let usage = parse_usage(map.get("usage").ok_or(ParseError::MissingField("usage"))?)?;
            frames.push(StreamFrame::Terminal(TerminalOutcome::Success { usage }));
        } else if frames.is_empty() {
            return Err(ParseError::MissingField("content"));
        }

        Ok(frames)
    }
}

fn optional_str(map: &Map<String, Value>, key: &'static str) -> Result<Option<String>, ParseError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ParseError::InvalidField(key)),
    }
}

/// The `error` field may be a plain string or an object with a `message`.
fn error_message(map: &Map<String, Value>) -> Result<Option<String>, ParseError> {
    match map.get("error") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Object(obj)) => Ok(Some(
            obj.get("message")
                .and_then(Value::as_str)
                .unwrap_or("unspecified error")
                .to_string(),
        )),
        Some(_) => Err(ParseError::InvalidField("error")),
    }
}

fn parse_usage(value: &Value) -> Result<TokenUsage, ParseError> {
    let obj = value.as_object().ok_or(ParseError::InvalidField("usage"))?;
    let field = |key: &'static str| -> Result<u64, ParseError> {
        obj.get(key)
            .ok_or(ParseError::MissingField(key))?
            .as_u64()
            .ok_or(ParseError::InvalidField(key))
    };
    Ok(TokenUsage {
        input_tokens: field("input_tokens")?,
        output_tokens: field("output_tokens")?,
        total_tokens: field("total_tokens")?,
    })
}

/// Map a service error code (numeric status or symbolic name) to a failure.
fn classify_error(code: Option<&Value>, message: String) -> CompletionFailure {
    match code {
        Some(Value::Number(n)) => match n.as_u64().and_then(|c| u16::try_from(c).ok()) {
            Some(status) => CompletionFailure::from_status(status, message),
            None => CompletionFailure::Unknown(message),
        },
        Some(Value::String(s)) => match s.to_ascii_lowercase().as_str() {
            "rate_limited" | "rate_limit_exceeded" | "too_many_requests" => {
                CompletionFailure::RateLimited
            }
            "auth_expired" | "unauthorized" | "invalid_token" | "token_expired" => {
                CompletionFailure::AuthExpired
            }
            "server_error" | "internal_error" => CompletionFailure::ServerError(500),
            "overloaded" | "service_unavailable" => CompletionFailure::ServerError(503),
            numeric => match numeric.parse::<u16>() {
                Ok(status) => CompletionFailure::from_status(status, message),
                Err(_) => CompletionFailure::Unknown(message),
            },
        },
        _ => CompletionFailure::Unknown(message),
    }
}
