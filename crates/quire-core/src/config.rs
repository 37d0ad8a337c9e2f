use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{QuireError, Result};
use crate::types::ModelTier;

/// Top-level configuration for the Quire engine.
///
/// Loaded from `~/.quire/config.toml` by default. Each section corresponds
/// to one component of the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuireConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub rendering: RenderingConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
}

impl QuireConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read, parsed, or fails
    /// validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: QuireConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| QuireError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject values the engine cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.completion.idle_timeout_secs == 0 {
            return Err(QuireError::Config(
                "completion.idle_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.rendering.inline_parse_threshold == 0 {
            return Err(QuireError::Config(
                "rendering.inline_parse_threshold must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory for the conversation database.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.quire/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Completion service connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    /// Streaming completion endpoint.
    pub endpoint: String,
    /// Environment variable holding the bearer token, if any.
    pub api_key_env: String,
    /// Tier used by text chat when none is given.
    pub default_tier: ModelTier,
    /// Whether text chat requests reasoning output.
    pub thinking: bool,
    /// Connection timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Maximum silence between two frames before the turn fails.
    pub idle_timeout_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080/v1/chat/stream".to_string(),
            api_key_env: "QUIRE_API_KEY".to_string(),
            default_tier: ModelTier::Balanced,
            thinking: false,
            connect_timeout_secs: 10,
            idle_timeout_secs: 60,
        }
    }
}

impl CompletionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Markup completeness detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderingConfig {
    /// Texts longer than this many bytes are parsed off the interactive path.
    pub inline_parse_threshold: usize,
}

impl Default for RenderingConfig {
    fn default() -> Self {
        Self {
            inline_parse_threshold: 4_000,
        }
    }
}

/// Voice call loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Tier used for voice turns.
    pub model_tier: ModelTier,
    /// Whether voice turns request reasoning output.
    pub thinking: bool,
    /// Delay before restarting recognition after a transient error.
    pub retry_delay_ms: u64,
    /// Consecutive transient recognizer errors tolerated before ending the call.
    pub max_recognizer_retries: u32,
    /// Prior conversation messages included as context.
    pub history_messages: usize,
    /// Speak partially streamed content when a turn fails.
    pub salvage_partial: bool,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            model_tier: ModelTier::Fast,
            thinking: false,
            retry_delay_ms: 500,
            max_recognizer_retries: 5,
            history_messages: 20,
            salvage_partial: true,
        }
    }
}

impl VoiceConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
