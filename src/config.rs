//! Companion runtime configuration.
//!
//! Every timing the scheduler uses lives here; nothing is hard-coded at
//! the call sites. Loaded from `config.toml` in the platform config
//! directory; a missing file yields defaults, a malformed one is an error.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{KindredError, Result};
use crate::paths;
use crate::provider::account::ProviderAccount;
use crate::provider::client::CallRetryPolicy;
use crate::queue::store::{DeadLetterPolicy, RetryPolicy};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    /// Loop timings and scheduled-work triggers.
    pub scheduler: SchedulerConfig,
    /// Retry budget and dead-letter bounds.
    pub queue: QueueConfig,
    /// Provider defaults and named accounts.
    pub llm: LlmConfig,
    /// State sizing and persistence location.
    pub state: StateConfig,
}

/// Scheduler loop timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maintenance tick interval in ms. Dispatch is eager (runs after
    /// every command and completion); the tick only bounds maintenance
    /// latency, not dispatch latency.
    pub tick_interval_ms: u64,
    /// Minimum seconds between debounced checkpoint writes.
    pub checkpoint_debounce_secs: u64,
    /// Check-in delay for newly seeded personas, in seconds of user
    /// inactivity.
    pub default_heartbeat_delay_secs: u64,
    /// Whether the daily ceremony digest runs at all.
    pub ceremony_enabled: bool,
    /// Hour of day (0-23, UTC) after which the ceremony may run.
    pub ceremony_hour: u8,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            checkpoint_debounce_secs: 30,
            default_heartbeat_delay_secs: 1800,
            ceremony_enabled: true,
            ceremony_hour: 8,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn checkpoint_debounce(&self) -> Duration {
        Duration::from_secs(self.checkpoint_debounce_secs)
    }
}

/// Queue retry and dead-letter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Failed attempts tolerated before an item dead-letters.
    pub max_attempts: u32,
    /// Base retry backoff in ms; attempt N waits `base * 2^(N-1)`.
    pub initial_backoff_ms: u64,
    /// Dead letters older than this many hours are rolled off.
    pub dead_letter_max_age_hours: u64,
    /// Dead-letter set size cap; oldest entries roll off first.
    pub dead_letter_max_entries: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1000,
            dead_letter_max_age_hours: 72,
            dead_letter_max_entries: 200,
        }
    }
}

impl QueueConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff_ms: self.initial_backoff_ms,
        }
    }

    pub fn dead_letter_policy(&self) -> DeadLetterPolicy {
        DeadLetterPolicy {
            max_age_hours: self.dead_letter_max_age_hours,
            max_entries: self.dead_letter_max_entries,
        }
    }
}

/// Provider call configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Default model spec: `provider:model`, or a bare model name (bare
    /// names run against the local provider). Items may override per call.
    pub default_model: String,
    /// Sampling temperature sent with every request.
    pub temperature: f64,
    /// Whole-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Additional in-call attempts for rate-limited requests.
    pub max_retries: u32,
    /// Base in-call backoff in ms; retry N sleeps `base * 2^N`.
    pub initial_backoff_ms: u64,
    /// Named provider accounts, matched before builtin providers.
    pub accounts: Vec<ProviderAccount>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            // Ollama-style default; runs with no credentials.
            default_model: "local:llama3.2".to_owned(),
            temperature: 0.7,
            request_timeout_secs: 120,
            connect_timeout_secs: 10,
            max_retries: 3,
            initial_backoff_ms: 1000,
            accounts: Vec::new(),
        }
    }
}

impl LlmConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn call_retry(&self) -> CallRetryPolicy {
        CallRetryPolicy {
            max_retries: self.max_retries,
            initial_backoff_ms: self.initial_backoff_ms,
        }
    }
}

/// State sizing and persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Checkpoint directory. `None` uses the platform data dir;
    /// `KINDRED_DATA_DIR` overrides both.
    pub data_dir: Option<PathBuf>,
    /// Global message-log cap; oldest messages trim first.
    pub max_messages: usize,
    /// Transcript turns prepended to conversational calls.
    pub transcript_turns: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_messages: 2000,
            transcript_turns: 20,
        }
    }
}

impl StateConfig {
    /// Effective data directory: env override, then the configured path,
    /// then the platform default.
    pub fn effective_data_dir(&self) -> PathBuf {
        if std::env::var_os("KINDRED_DATA_DIR").is_some() {
            return paths::data_dir();
        }
        self.data_dir.clone().unwrap_or_else(paths::data_dir)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.effective_data_dir().join("checkpoint.json")
    }
}

impl CompanionConfig {
    /// Load from the default location. A missing file yields defaults.
    ///
    /// # Errors
    /// Returns [`KindredError::Config`] when the file exists but cannot
    /// be read, parsed, or validated.
    pub fn load() -> Result<Self> {
        let path = paths::config_file();
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        Self::from_file(&path)
    }

    /// Load configuration from a TOML file, falling back to defaults for
    /// missing fields.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| KindredError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories as
    /// needed.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written or serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| KindredError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject configurations that cannot work.
    ///
    /// # Errors
    /// Returns [`KindredError::Config`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.tick_interval_ms == 0 {
            return Err(KindredError::Config(
                "scheduler.tick_interval_ms must be positive".into(),
            ));
        }
        if self.scheduler.ceremony_hour > 23 {
            return Err(KindredError::Config(format!(
                "scheduler.ceremony_hour must be 0-23, got {}",
                self.scheduler.ceremony_hour
            )));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(KindredError::Config(format!(
                "llm.temperature must be within 0.0-2.0, got {}",
                self.llm.temperature
            )));
        }
        if self.llm.request_timeout_secs == 0 {
            return Err(KindredError::Config(
                "llm.request_timeout_secs must be positive".into(),
            ));
        }
        if self.llm.connect_timeout_secs == 0 {
            return Err(KindredError::Config(
                "llm.connect_timeout_secs must be positive".into(),
            ));
        }
        if self.llm.default_model.trim().is_empty() {
            return Err(KindredError::Config("llm.default_model is empty".into()));
        }
        if self.state.max_messages == 0 {
            return Err(KindredError::Config(
                "state.max_messages must be positive".into(),
            ));
        }
        Ok(())
    }
}
