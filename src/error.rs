//! Error types for NoteFlow.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors reading, parsing or persisting a document.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("Malformed frontmatter in {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Cannot render frontmatter for {path}: {reason}")]
    Render { path: PathBuf, reason: String },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DocumentError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Processor registration errors. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Processor key '{key}' is already registered (stage {existing_stage})")]
    Conflict { key: String, existing_stage: String },

    #[error("Invalid processor registration '{key}': {reason}")]
    Invalid { key: String, reason: String },
}

/// Notification delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Failed to send notification via {channel}: {reason}")]
    SendFailed { channel: String, reason: String },
}
