//! TOML Configuration File Support
//!
//! Centralized configuration loading for relay, supporting a TOML file at
//! `~/.config/relay/relay.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [credentials]
//! keys = ["key-one", "key-two"]
//!
//! [generation]
//! default_model = "gemini-2.5-flash"
//! stream = true
//! temperature = 0.7
//! system_instruction = "Answer concisely."
//! thinking_budget = 0
//! show_thoughts = false
//!
//! [transport]
//! base_url = "https://generativelanguage.googleapis.com/v1beta/models"
//! connect_timeout_ms = 10000
//!
//! [app]
//! notify_on_completion = true
//! state_path = "/home/me/.local/share/relay/state.json"
//!
//! [messages]
//! empty_response = "The model returned an empty response."
//! keys_not_configured = "No API key configured."
//! notification_title = "Response ready"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::DEFAULT_BASE_URL;
use crate::credentials::KeyPool;
use crate::session::SessionSettings;

/// Model used when nothing else is configured
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// User-visible Messages
// =============================================================================

/// Localizable strings the engine writes into transcripts and notifications
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Messages {
    /// Shown when a generation completes with no content
    pub empty_response: String,
    /// Shown when a turn is dispatched with an empty key pool
    pub keys_not_configured: String,
    /// Title of the completion notification
    pub notification_title: String,
}

impl Default for Messages {
    fn default() -> Self {
        Self {
            empty_response: "The model returned an empty response.".to_string(),
            keys_not_configured: "No API key configured. Add one to the configuration file or set RELAY_API_KEYS."
                .to_string(),
            notification_title: "Response ready".to_string(),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Credentials section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsToml {
    /// API keys, in rotation order
    pub keys: Option<Vec<String>>,
}

/// Generation section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationToml {
    /// Model for new sessions
    pub default_model: Option<String>,

    /// Stream responses incrementally
    pub stream: Option<bool>,

    /// Sampling temperature for new sessions
    pub temperature: Option<f32>,

    /// System instruction for new sessions
    pub system_instruction: Option<String>,

    /// Reasoning budget for new sessions
    pub thinking_budget: Option<i32>,

    /// Return reasoning text
    pub show_thoughts: Option<bool>,
}

/// Transport section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportToml {
    /// API base URL
    pub base_url: Option<String>,

    /// Connection timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
}

/// Application section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppToml {
    /// Notify when a background generation completes
    pub notify_on_completion: Option<bool>,

    /// Where persistent state (rotation cursor) is kept
    pub state_path: Option<PathBuf>,
}

/// Messages section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagesToml {
    /// Empty response text
    pub empty_response: Option<String>,

    /// Missing keys text
    pub keys_not_configured: Option<String>,

    /// Notification title
    pub notification_title: Option<String>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Credentials configuration section
    pub credentials: CredentialsToml,

    /// Generation configuration section
    pub generation: GenerationToml,

    /// Transport configuration section
    pub transport: TransportToml,

    /// Application configuration section
    pub app: AppToml,

    /// Messages configuration section
    pub messages: MessagesToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Centralized configuration for relay
///
/// Consolidates all configuration from multiple sources and tracks where it
/// came from. Use [`load_config`] to load configuration with proper priority
/// handling.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// API key pool
    pub keys: KeyPool,

    /// Model for new sessions
    pub default_model: String,

    /// Stream responses incrementally
    pub stream: bool,

    /// Sampling temperature for new sessions
    pub temperature: Option<f32>,

    /// System instruction for new sessions
    pub system_instruction: String,

    /// Reasoning budget for new sessions
    pub thinking_budget: i32,

    /// Return reasoning text
    pub show_thoughts: bool,

    /// API base URL
    pub base_url: String,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Notify when a background generation completes
    pub notify_on_completion: bool,

    /// Where persistent state is kept (`None` = platform default)
    pub state_path: Option<PathBuf>,

    /// User-visible strings
    pub messages: Messages,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            keys: KeyPool::default(),
            default_model: DEFAULT_MODEL.to_string(),
            stream: true,
            temperature: None,
            system_instruction: String::new(),
            thinking_budget: 0,
            show_thoughts: false,
            base_url: DEFAULT_BASE_URL.to_string(),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            notify_on_completion: true,
            state_path: None,
            messages: Messages::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RelayConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Settings every new session starts with
    #[must_use]
    pub fn session_defaults(&self) -> SessionSettings {
        SessionSettings {
            model_id: self.default_model.clone(),
            temperature: self.temperature,
            system_instruction: self.system_instruction.clone(),
            thinking_budget: self.thinking_budget,
            show_thoughts: self.show_thoughts,
            ..SessionSettings::default()
        }
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(ConfigError::ValidationError(format!(
                    "temperature must be between 0 and 2, got {t}"
                )));
            }
        }
        if self.default_model.trim().is_empty() {
            return Err(ConfigError::ValidationError("default_model is empty".to_string()));
        }
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::ValidationError("base_url is empty".to_string()));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "connect_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/relay/relay.toml` or
/// `~/.config/relay/relay.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("relay").join("relay.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or a
/// value is out of range. A missing config file is not an error.
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RelayConfig, ConfigError> {
    load_config_with_env(path, |name| std::env::var(name).ok())
}

/// Load configuration reading environment variables through `env`
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_with_env(
    path: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<RelayConfig, ConfigError> {
    let mut config = RelayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: RelayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env);
    config.validate()?;

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut RelayConfig, toml: &RelayToml) {
    if let Some(ref keys) = toml.credentials.keys {
        config.keys = KeyPool::new(keys);
    }

    if let Some(ref model) = toml.generation.default_model {
        config.default_model.clone_from(model);
    }
    if let Some(stream) = toml.generation.stream {
        config.stream = stream;
    }
    if toml.generation.temperature.is_some() {
        config.temperature = toml.generation.temperature;
    }
    if let Some(ref instruction) = toml.generation.system_instruction {
        config.system_instruction.clone_from(instruction);
    }
    if let Some(budget) = toml.generation.thinking_budget {
        config.thinking_budget = budget;
    }
    if let Some(show) = toml.generation.show_thoughts {
        config.show_thoughts = show;
    }

    if let Some(ref url) = toml.transport.base_url {
        config.base_url.clone_from(url);
    }
    if let Some(timeout) = toml.transport.connect_timeout_ms {
        config.connect_timeout = Duration::from_millis(timeout);
    }

    if let Some(notify) = toml.app.notify_on_completion {
        config.notify_on_completion = notify;
    }
    if toml.app.state_path.is_some() {
        config.state_path.clone_from(&toml.app.state_path);
    }

    if let Some(ref text) = toml.messages.empty_response {
        config.messages.empty_response.clone_from(text);
    }
    if let Some(ref text) = toml.messages.keys_not_configured {
        config.messages.keys_not_configured.clone_from(text);
    }
    if let Some(ref text) = toml.messages.notification_title {
        config.messages.notification_title.clone_from(text);
    }
}

fn parse_flag(value: &str) -> bool {
    value != "0" && !value.eq_ignore_ascii_case("false")
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut RelayConfig, env: impl Fn(&str) -> Option<String>) {
    if let Some(keys) = env("RELAY_API_KEYS").or_else(|| env("GEMINI_API_KEY")) {
        config.keys = KeyPool::parse(&keys);
        config.source = ConfigSource::Env;
    }
    if let Some(model) = env("RELAY_MODEL") {
        config.default_model = model;
        config.source = ConfigSource::Env;
    }
    if let Some(stream) = env("RELAY_STREAM") {
        config.stream = parse_flag(&stream);
        config.source = ConfigSource::Env;
    }
    if let Some(url) = env("RELAY_BASE_URL") {
        config.base_url = url;
        config.source = ConfigSource::Env;
    }
    if let Some(timeout) = env("RELAY_CONNECT_TIMEOUT") {
        if let Ok(ms) = timeout.parse::<u64>() {
            config.connect_timeout = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }
    if let Some(notify) = env("RELAY_NOTIFY") {
        config.notify_on_completion = parse_flag(&notify);
        config.source = ConfigSource::Env;
    }
    if let Some(path) = env("RELAY_STATE_PATH") {
        config.state_path = Some(PathBuf::from(path));
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Default model override
    pub default_model: Option<String>,

    /// Streaming override
    pub stream: Option<bool>,

    /// API keys override
    pub keys: Option<String>,

    /// State path override
    pub state_path: Option<PathBuf>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set default model override
    #[must_use]
    pub fn with_default_model(mut self, model: String) -> Self {
        self.default_model = Some(model);
        self
    }

    /// Set streaming override
    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Set API keys override (comma or newline separated)
    #[must_use]
    pub fn with_keys(mut self, keys: String) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Set state path override
    #[must_use]
    pub fn with_state_path(mut self, path: PathBuf) -> Self {
        self.state_path = Some(path);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut RelayConfig) {
        if self.default_model.is_some()
            || self.stream.is_some()
            || self.keys.is_some()
            || self.state_path.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref model) = self.default_model {
            config.default_model.clone_from(model);
        }
        if let Some(stream) = self.stream {
            config.stream = stream;
        }
        if let Some(ref keys) = self.keys {
            config.keys = KeyPool::parse(keys);
        }
        if self.state_path.is_some() {
            config.state_path.clone_from(&self.state_path);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
