//! Configuration for the chat runtime.
//!
//! Values resolve in three layers: built-in defaults, an optional JSON file,
//! then `EMBER_*` environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Environment variable for a custom Ollama URL (e.g. `http://10.0.0.5:11434`).
pub const OLLAMA_URL_ENV: &str = "EMBER_OLLAMA_URL";
/// Environment variable for the default chat model.
pub const MODEL_ENV: &str = "EMBER_MODEL";
/// Environment variable for the `SQLite` database path.
pub const DB_PATH_ENV: &str = "EMBER_DB_PATH";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value is out of range or otherwise unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// The configured base URL does not parse.
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    /// The config file could not be read.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The config file is not valid JSON for this schema.
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Durable store settings.
    pub storage: StorageConfig,
    /// Inference peer settings.
    pub inference: InferenceConfig,
    /// Sampling and runtime options forwarded to the peer.
    pub performance: PerformanceConfig,
    /// Turn orchestration settings.
    pub chat: ChatConfig,
}

impl AppConfig {
    /// Load defaults, merge an optional JSON file, then apply environment overrides.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file. Missing fields fall back to defaults.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Apply `EMBER_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(OLLAMA_URL_ENV) {
            self.inference.base_url = url;
        }
        if let Ok(model) = std::env::var(MODEL_ENV) {
            self.inference.default_model = model;
        }
        if let Ok(path) = std::env::var(DB_PATH_ENV) {
            self.storage.db_path = PathBuf::from(path);
        }
    }

    /// Validate configuration invariants.
    ///
    /// # Errors
    /// Returns an error if any values are out of range or invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Url::parse(&self.inference.base_url)?;

        if self.inference.retry_attempts == 0 {
            return Err(ConfigError::Invalid(
                "inference.retry_attempts must be > 0".to_string(),
            ));
        }

        if self.inference.backoff_factor < 1.0 {
            return Err(ConfigError::Invalid(
                "inference.backoff_factor must be >= 1.0".to_string(),
            ));
        }

        if self.inference.default_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "inference.default_timeout_secs must be > 0".to_string(),
            ));
        }

        for (fragment, secs) in &self.inference.model_timeouts {
            if fragment.is_empty() || *secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "model timeout entry '{fragment}' must have a name and a timeout > 0"
                )));
            }
        }

        if self.storage.max_backups == 0 {
            return Err(ConfigError::Invalid(
                "storage.max_backups must be > 0".to_string(),
            ));
        }

        if self.storage.busy_retries == 0 {
            return Err(ConfigError::Invalid(
                "storage.busy_retries must be > 0".to_string(),
            ));
        }

        if self.chat.max_memory_entries == 0 {
            return Err(ConfigError::Invalid(
                "chat.max_memory_entries must be > 0".to_string(),
            ));
        }

        if !(0.0..=2.0).contains(&self.performance.temperature) {
            return Err(ConfigError::Invalid(
                "performance.temperature must be within 0.0..=2.0".to_string(),
            ));
        }

        Ok(())
    }

    /// Override the database path.
    #[must_use]
    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage.db_path = path.into();
        self
    }

    /// Override the inference base URL.
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.inference.base_url = url.into();
        self
    }

    /// Override the default model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.inference.default_model = model.into();
        self
    }
}

/// Durable store settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `SQLite` database path.
    pub db_path: PathBuf,
    /// Number of backups kept in `<db dir>/backups`.
    pub max_backups: usize,
    /// Attempts for a write that hits `SQLITE_BUSY`.
    pub busy_retries: u32,
    /// Fixed delay between busy retries, in milliseconds.
    pub busy_retry_delay_ms: u64,
    /// `PRAGMA busy_timeout`, in milliseconds.
    pub busy_timeout_ms: u64,
    /// Maximum wait for the connection guard on read paths, in milliseconds.
    pub lock_timeout_ms: u64,
    /// Maximum time `close()` waits for the write queue to drain, in milliseconds.
    pub close_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/ember.db"),
            max_backups: 5,
            busy_retries: 3,
            busy_retry_delay_ms: 100,
            busy_timeout_ms: 5_000,
            lock_timeout_ms: 5_000,
            close_timeout_ms: 2_000,
        }
    }
}

impl StorageConfig {
    /// Config pointing at `path` with every other value defaulted.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: path.into(),
            ..Self::default()
        }
    }

    /// Delay between busy retries.
    #[must_use]
    pub const fn busy_retry_delay(&self) -> Duration {
        Duration::from_millis(self.busy_retry_delay_ms)
    }

    /// Bounded wait for the connection guard.
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Drain timeout used by `close()`.
    #[must_use]
    pub const fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/// Inference peer settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Base URL of the Ollama server.
    pub base_url: String,
    /// Model used when the caller does not pick one.
    pub default_model: String,
    /// Read timeout per model family, matched by identity fragment.
    pub model_timeouts: Vec<(String, u64)>,
    /// Read timeout for models with no matching fragment, in seconds.
    pub default_timeout_secs: u64,
    /// Connect timeout, in seconds.
    pub connect_timeout_secs: u64,
    /// Timeout for the liveness probe, in seconds.
    pub probe_timeout_secs: u64,
    /// Total attempts for a request (first try included).
    pub retry_attempts: u32,
    /// First backoff delay, in milliseconds.
    pub initial_retry_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_factor: f64,
    /// Interval between health probes, in milliseconds.
    pub health_interval_ms: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_string(),
            default_model: "qwen2.5:14b".to_string(),
            model_timeouts: default_model_timeouts(),
            default_timeout_secs: 120,
            connect_timeout_secs: 10,
            probe_timeout_secs: 2,
            retry_attempts: 3,
            initial_retry_delay_ms: 2_000,
            backoff_factor: 1.5,
            health_interval_ms: 2_000,
        }
    }
}

impl InferenceConfig {
    /// Connect timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Liveness probe timeout.
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// First retry delay.
    #[must_use]
    pub const fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }

    /// Health poll interval.
    #[must_use]
    pub const fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }
}

fn default_model_timeouts() -> Vec<(String, u64)> {
    [
        ("qwen2.5:7b", 90),
        ("qwen2.5:14b", 120),
        ("qwen2.5:32b", 180),
        ("llama2:7b", 90),
        ("llama2:13b", 120),
        ("mistral:7b", 90),
        ("llama3.2", 90),
        ("neural-chat:7b", 90),
        ("phi:7b", 60),
    ]
    .into_iter()
    .map(|(name, secs)| (name.to_string(), secs))
    .collect()
}

/// Sampling and runtime options sent with every chat request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// How long the peer keeps the model resident.
    pub keep_alive: String,
    /// Context window in tokens.
    pub num_ctx: u32,
    /// Prompt batch size.
    pub num_batch: u32,
    /// Token budget; `-1` means unbounded.
    pub num_predict: i32,
    /// Default sampling temperature.
    pub temperature: f64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            keep_alive: "30m".to_string(),
            num_ctx: 4_096,
            num_batch: 512,
            num_predict: -1,
            temperature: 0.7,
        }
    }
}

/// Turn orchestration settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Conversation selected at startup.
    pub default_conversation: String,
    /// Number of stored messages sent as history.
    pub max_history_messages: usize,
    /// Upper bound on stored memory entries; the oldest are trimmed.
    pub max_memory_entries: usize,
    /// Whether assistant output is scanned for facts to remember.
    pub memory_enabled: bool,
    /// System prompt; `{memory}` is replaced with the formatted memory block.
    pub system_prompt: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            default_conversation: "Chat 1".to_string(),
            max_history_messages: 20,
            max_memory_entries: 200,
            memory_enabled: true,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// Default system prompt template.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Ember, a warm and direct personal assistant. \
Speak naturally and skip boilerplate disclaimers.\n\n\
### What you know about the user\n{memory}\n\n\
### Remembering\n\
When the user tells you something worth keeping, write it as [REMEMBER: fact], one fact per tag.";
