//! CLI argument definitions for the quire binary.
//!
//! Uses `clap` with derive macros for ergonomic argument parsing.
//! Priority resolution: CLI args > env vars > config file > defaults.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use quire_core::types::ModelTier;

/// Quire - journaling conversations by text and voice.
#[derive(Parser, Debug)]
#[command(name = "quire", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Data directory holding the conversation database.
    #[arg(short = 'd', long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Send one message and stream the reply.
    Chat {
        prompt: String,
        /// Model tier (fast, balanced, powerful).
        #[arg(short = 't', long = "tier")]
        tier: Option<ModelTier>,
        /// Ask for reasoning output.
        #[arg(long = "thinking")]
        thinking: bool,
        /// Continue an existing conversation.
        #[arg(long = "conversation")]
        conversation: Option<Uuid>,
    },
    /// Feed a recorded frame file (one JSON frame per line) through the
    /// coordinator.
    Replay { frames: PathBuf },
    /// Check whether a markup file is safe to render.
    Markup {
        file: PathBuf,
        /// Print the rendered HTML when complete.
        #[arg(long = "html")]
        html: bool,
    },
    /// Run a voice call on the terminal. Each stdin line is one utterance.
    Voice {
        /// Continue an existing conversation.
        #[arg(long = "conversation")]
        conversation: Option<Uuid>,
        /// Answer from a recorded frame file instead of the endpoint.
        #[arg(long = "frames")]
        frames: Option<PathBuf>,
    },
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > QUIRE_CONFIG env var > ~/.quire/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("QUIRE_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the data directory, if overridden on the command line.
    pub fn resolve_data_dir(&self) -> Option<String> {
        self.data_dir
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
    }

    /// Priority: --log-level flag > config file value.
    pub fn resolve_log_level(&self, config_level: &str) -> String {
        self.log_level
            .clone()
            .unwrap_or_else(|| config_level.to_string())
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    home_dir()
        .map(|home| home.join(".quire").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

pub fn home_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    let home = std::env::var("USERPROFILE");
    #[cfg(not(target_os = "windows"))]
    let home = std::env::var("HOME");
    home.ok().map(PathBuf::from)
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        Some(rest) => home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}
