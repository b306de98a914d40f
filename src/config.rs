//! Configuration types.
//!
//! Everything is read from the environment at startup. `Default` impls give
//! values suitable for tests and local runs.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default tick interval: 1 minute.
const DEFAULT_TICK_INTERVAL_SECS: u64 = 60;

/// Default maximum random delay added to each tick.
const DEFAULT_TICK_JITTER_SECS: u64 = 5;

/// Default upper bound on a single processor invocation: 5 minutes.
const DEFAULT_INVOCATION_TIMEOUT_SECS: u64 = 300;

const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_SMALL_MODEL: &str = "claude-3-5-haiku-latest";

/// Scheduler cadence and per-invocation limits.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Wall-clock interval between ticks.
    pub tick_interval: Duration,
    /// Upper bound of the random delay added before each tick.
    pub tick_jitter: Duration,
    /// Upper bound on one `process()` call. Expiry is a transient failure.
    pub invocation_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(DEFAULT_TICK_INTERVAL_SECS),
            tick_jitter: Duration::from_secs(DEFAULT_TICK_JITTER_SECS),
            invocation_timeout: Duration::from_secs(DEFAULT_INVOCATION_TIMEOUT_SECS),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            tick_interval: Duration::from_secs(env_u64(
                "NOTEFLOW_TICK_INTERVAL_SECS",
                DEFAULT_TICK_INTERVAL_SECS,
            )?),
            tick_jitter: Duration::from_secs(env_u64(
                "NOTEFLOW_TICK_JITTER_SECS",
                DEFAULT_TICK_JITTER_SECS,
            )?),
            invocation_timeout: Duration::from_secs(env_u64(
                "NOTEFLOW_INVOCATION_TIMEOUT_SECS",
                DEFAULT_INVOCATION_TIMEOUT_SECS,
            )?),
        };
        config.validate()?;
        Ok(config)
    }

    /// The tick interval and invocation timeout must be non-zero. Jitter may be zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "NOTEFLOW_TICK_INTERVAL_SECS".to_string(),
                message: "must be at least 1 second".to_string(),
            });
        }
        if self.invocation_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "NOTEFLOW_INVOCATION_TIMEOUT_SECS".to_string(),
                message: "must be at least 1 second".to_string(),
            });
        }
        Ok(())
    }
}

/// Directory layout of the knowledge base.
#[derive(Debug, Clone)]
pub struct VaultPaths {
    /// Vault root.
    pub vault: PathBuf,
    /// Incoming transcripts (meetings, ideas, todos, ...).
    pub transcripts: PathBuf,
    /// Daily email digests.
    pub email_digests: PathBuf,
    /// Monthly meeting index notes.
    pub meeting_indexes: PathBuf,
    /// Ideas directory note.
    pub ideas_directory: PathBuf,
    /// Todos directory note.
    pub todos_directory: PathBuf,
}

impl VaultPaths {
    /// Derive the standard layout below a vault root.
    pub fn under(vault: impl Into<PathBuf>) -> Self {
        let vault = vault.into();
        let bot = vault.join("KnowledgeBot");
        Self {
            transcripts: bot.join("Transcriptions"),
            email_digests: bot.join("Email Digests"),
            meeting_indexes: bot.join("Meetings"),
            ideas_directory: bot.join("Ideas Directory.md"),
            todos_directory: bot.join("Todo Directory.md"),
            vault,
        }
    }

    /// Path of the Entity Reference note.
    pub fn entity_reference(&self) -> PathBuf {
        self.vault.join("Entity Reference.md")
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let vault = std::env::var("NOTEFLOW_VAULT_PATH")
            .map_err(|_| ConfigError::MissingEnvVar("NOTEFLOW_VAULT_PATH".to_string()))?;
        let mut paths = Self::under(vault);
        if let Ok(dir) = std::env::var("NOTEFLOW_TRANSCRIPTS_DIR") {
            paths.transcripts = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("NOTEFLOW_EMAIL_DIGESTS_DIR") {
            paths.email_digests = PathBuf::from(dir);
        }
        Ok(paths)
    }

    /// Directories the pipeline reads from or writes into.
    pub fn directories(&self) -> Vec<PathBuf> {
        vec![
            self.vault.clone(),
            self.transcripts.clone(),
            self.email_digests.clone(),
            self.meeting_indexes.clone(),
        ]
    }
}

/// AI provider settings.
#[derive(Debug, Clone)]
pub struct AiConfig {
    pub api_key: SecretString,
    /// Model used for extraction, detection and summaries.
    pub model: String,
    /// Cheaper model used for classification.
    pub small_model: String,
}

impl AiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".to_string()))?;
        Ok(Self {
            api_key: SecretString::from(api_key),
            model: std::env::var("NOTEFLOW_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            small_model: std::env::var("NOTEFLOW_SMALL_MODEL")
                .unwrap_or_else(|_| DEFAULT_SMALL_MODEL.to_string()),
        })
    }
}

/// Optional Telegram notification target.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    pub chat_id: String,
}

impl TelegramConfig {
    /// Returns `None` unless both `TELEGRAM_BOT_TOKEN` and `TELEGRAM_CHAT_ID` are set.
    pub fn from_env() -> Option<Self> {
        let bot_token = std::env::var("TELEGRAM_BOT_TOKEN").ok()?;
        let chat_id = std::env::var("TELEGRAM_CHAT_ID").ok()?;
        if bot_token.trim().is_empty() || chat_id.trim().is_empty() {
            return None;
        }
        Some(Self {
            bot_token: SecretString::from(bot_token),
            chat_id,
        })
    }
}

/// Full pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub paths: VaultPaths,
    pub scheduler: SchedulerConfig,
    pub ai: AiConfig,
    pub telegram: Option<TelegramConfig>,
    /// Directory for rolling log files (stderr only when unset).
    pub log_dir: Option<PathBuf>,
    /// Vault owner, assigned to single-speaker transcripts.
    pub owner_name: Option<String>,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            paths: VaultPaths::from_env()?,
            scheduler: SchedulerConfig::from_env()?,
            ai: AiConfig::from_env()?,
            telegram: TelegramConfig::from_env(),
            log_dir: std::env::var("NOTEFLOW_LOG_DIR").ok().map(PathBuf::from),
            owner_name: std::env::var("NOTEFLOW_OWNER_NAME")
                .ok()
                .filter(|name| !name.trim().is_empty()),
        })
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a non-negative integer, got '{raw}': {e}"),
        }),
        Err(_) => Ok(default),
    }
}
