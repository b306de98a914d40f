//! Notifications sent when a document needs human attention.
//!
//! Delivery is best effort: a failed notification is logged and never changes
//! a processor outcome.

use std::fmt;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};

use crate::config::TelegramConfig;
use crate::error::NotifyError;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// A validation form was written and waits for review.
    ReviewRequested,
    /// A submitted form failed validation.
    ValidationFailed,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReviewRequested => write!(f, "review_requested"),
            Self::ValidationFailed => write!(f, "validation_failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    /// Human-readable workflow name, e.g. "Entity Resolution".
    pub workflow: String,
    /// Document file name.
    pub document: String,
    pub details: String,
}

impl Notification {
    pub fn render(&self) -> String {
        let headline = match self.kind {
            NotificationKind::ReviewRequested => format!("{} required", self.workflow),
            NotificationKind::ValidationFailed => format!("{} validation errors", self.workflow),
        };
        format!("{headline}\nFile: {}\n{}", self.document, self.details)
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Send and swallow failures.
pub async fn notify_best_effort(notifier: &dyn Notifier, notification: &Notification) {
    if let Err(e) = notifier.notify(notification).await {
        warn!(
            notifier = notifier.name(),
            doc = %notification.document,
            kind = %notification.kind,
            error = %e,
            "Notification failed"
        );
    }
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            doc = %notification.document,
            kind = %notification.kind,
            workflow = %notification.workflow,
            details = %notification.details,
            "Notification"
        );
        Ok(())
    }
}

/// Sends notifications to one Telegram chat through the Bot API.
pub struct TelegramNotifier {
    bot_token: SecretString,
    chat_id: String,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            bot_token: config.bot_token,
            chat_id: config.chat_id,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "https://api.telegram.org/bot{}/{method}",
            self.bot_token.expose_secret()
        )
    }

    async fn send_chunk(&self, text: &str) -> Result<(), NotifyError> {
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
        });
        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError::SendFailed {
                channel: "telegram".into(),
                reason: e.without_url().to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            return Err(NotifyError::SendFailed {
                channel: "telegram".into(),
                reason: format!("sendMessage returned {status}: {detail}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        for chunk in split_message(&notification.render(), TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.send_chunk(&chunk).await?;
        }
        Ok(())
    }
}

/// Split text into chunks of at most `max_len` bytes, preferring newlines,
/// then spaces, never inside a UTF-8 character.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut limit = max_len;
        while !remaining.is_char_boundary(limit) {
            limit -= 1;
        }
        let chunk = &remaining[..limit];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(limit);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        fn name(&self) -> &str {
            "failing"
        }

        async fn notify(&self, _notification: &Notification) -> Result<(), NotifyError> {
            Err(NotifyError::SendFailed {
                channel: "failing".into(),
                reason: "offline".into(),
            })
        }
    }

    fn notification() -> Notification {
        Notification {
            kind: NotificationKind::ReviewRequested,
            workflow: "Entity Resolution".into(),
            document: "Weekly sync.md".into(),
            details: "Entities detected: 3".into(),
        }
    }

    #[test]
    fn render_includes_file_and_details() {
        let text = notification().render();
        assert!(text.starts_with("Entity Resolution required"));
        assert!(text.contains("File: Weekly sync.md"));
        assert!(text.contains("Entities detected: 3"));
    }

    #[tokio::test]
    async fn best_effort_swallows_failures() {
        notify_best_effort(&FailingNotifier, &notification()).await;
        notify_best_effort(&LogNotifier, &notification()).await;
    }

    #[test]
    fn split_message_short() {
        assert_eq!(split_message("Hello", 4096), vec!["Hello"]);
    }

    #[test]
    fn split_message_on_newline() {
        let msg = format!("{}\n{}", "a".repeat(2000), "b".repeat(3000));
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks, vec!["a".repeat(2000), "b".repeat(3000)]);
    }

    #[test]
    fn split_message_respects_char_boundaries() {
        let msg = "é".repeat(3000);
        let chunks = split_message(&msg, 4095);
        assert!(chunks.iter().all(|c| c.len() <= 4095));
        assert_eq!(chunks.concat(), msg);
    }
}
