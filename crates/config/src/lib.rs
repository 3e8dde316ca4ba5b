//! Configuration loading, validation, and management for the Elowen relay.
//!
//! Loads configuration from `~/.elowen/config.toml` (or the file named by
//! `ELOWEN_CONFIG`) with environment variable overrides. Validates all
//! settings at startup.

use elowen_core::GenerationParameters;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.elowen/config.toml`.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Text-generation backend connection
    #[serde(default)]
    pub backend: BackendConfig,

    /// Default sampling parameters; requests may override individual fields
    #[serde(default)]
    pub generation: GenerationParameters,

    /// History sanitization limits
    #[serde(default)]
    pub history: HistoryConfig,

    /// WebSocket gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Connection authentication
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("backend", &self.backend)
            .field("generation", &self.generation)
            .field("history", &self.history)
            .field("gateway", &self.gateway)
            .field("auth", &self.auth)
            .finish()
    }
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &redact(&self.api_key))
            .field("call_style", &self.call_style)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("require_auth", &self.require_auth)
            .field("jwt_secret", &redact(&self.jwt_secret))
            .field("leeway_secs", &self.leeway_secs)
            .finish()
    }
}

/// Which calling convention the session prefers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStyle {
    /// Role-tagged turn list (chat route). First-turn alternation
    /// rejections fall back once to the flattened prompt.
    #[default]
    Structured,
    /// Always one flattened prompt (completions route).
    Flattened,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// OpenAI-compatible base URL, including the `/v1` suffix
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// vLLM ignores the key unless started with `--api-key`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default)]
    pub call_style: CallStyle,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Deadline for a one-shot call or for opening a stream. Unset = no deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
}

fn default_base_url() -> String {
    "http://vllm:4001/v1".into()
}
fn default_model() -> String {
    "TheDrummer/Big-Tiger-Gemma-27B-v1".into()
}
fn default_connect_timeout() -> u64 {
    10
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key: None,
            call_style: CallStyle::default(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Most recent user/assistant pairs kept after sanitization
    #[serde(default = "default_max_pairs")]
    pub max_pairs: usize,
}

fn default_max_pairs() -> usize {
    10
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_pairs: default_max_pairs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default)]
    pub allow_public_bind: bool,

    /// Interval between keep-alive pings on idle sockets
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Outbound events queued per connection before emitters wait
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

fn default_port() -> u16 {
    8001
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_ping_interval() -> u64 {
    25
}
fn default_outbound_buffer() -> usize {
    256
}
fn default_true() -> bool {
    true
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            allow_public_bind: false,
            ping_interval_secs: default_ping_interval(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// When false every connection is admitted without a token
    #[serde(default = "default_true")]
    pub require_auth: bool,

    /// HS256 secret shared with the token issuer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,

    /// Clock skew tolerated when checking `exp`
    #[serde(default)]
    pub leeway_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            require_auth: true,
            jwt_secret: None,
            leeway_secs: 0,
        }
    }
}

impl AppConfig {
    /// Load configuration from `ELOWEN_CONFIG` or `~/.elowen/config.toml`.
    ///
    /// Environment overrides (highest priority):
    /// - `VLLM_BASE_URL`
    /// - `ELOWEN_MODEL`
    /// - `ELOWEN_PORT`
    /// - `JWT_SECRET`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = std::env::var("ELOWEN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::config_path());
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("VLLM_BASE_URL") {
            self.backend.base_url = url;
        }
        if let Some(model) = lookup("ELOWEN_MODEL") {
            self.backend.model = model;
        }
        if let Some(port) = lookup("ELOWEN_PORT") {
            self.gateway.port = port.parse().map_err(|_| {
                ConfigError::ValidationError(format!("ELOWEN_PORT is not a valid port: '{port}'"))
            })?;
        }
        if let Some(secret) = lookup("JWT_SECRET") {
            self.auth.jwt_secret = Some(secret);
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".elowen")
    }

    /// Default location of the config file.
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let generation = &self.generation;
        if !(0.0..=2.0).contains(&generation.temperature) {
            return Err(ConfigError::ValidationError(
                "generation.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if generation.top_p <= 0.0 || generation.top_p > 1.0 {
            return Err(ConfigError::ValidationError(
                "generation.top_p must be in (0.0, 1.0]".into(),
            ));
        }

        if generation.max_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "generation.max_tokens must be > 0".into(),
            ));
        }

        if self.history.max_pairs == 0 {
            return Err(ConfigError::ValidationError(
                "history.max_pairs must be at least 1".into(),
            ));
        }

        if self.gateway.ping_interval_secs == 0 || self.gateway.outbound_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "gateway.ping_interval_secs and gateway.outbound_buffer must be > 0".into(),
            ));
        }

        if self.backend.base_url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "backend.base_url must not be empty".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for `config init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
