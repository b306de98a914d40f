//! Bridge from rig's `CompletionModel` to [`LlmProvider`].

use async_trait::async_trait;
use rig::completion::{AssistantContent, CompletionError, CompletionModel, Message};

use super::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};
use crate::error::LlmError;

const PROVIDER: &str = "anthropic";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Wraps any rig completion model behind the pipeline's provider trait.
pub struct RigAdapter<M: CompletionModel> {
    model: M,
    model_name: String,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: impl Into<String>) -> Self {
        Self {
            model,
            model_name: model_name.into(),
        }
    }
}

/// A request reshaped the way rig wants it: a preamble, prior turns, and the
/// final prompt.
#[derive(Debug, PartialEq)]
struct Conversation {
    preamble: Option<String>,
    history: Vec<ChatMessage>,
    prompt: String,
}

fn split_conversation(messages: &[ChatMessage]) -> Conversation {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    let mut history: Vec<ChatMessage> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .cloned()
        .collect();
    let prompt = history.pop().map(|m| m.content).unwrap_or_default();

    Conversation {
        preamble: (!system.is_empty()).then(|| system.join("\n\n")),
        history,
        prompt,
    }
}

fn to_rig_message(message: &ChatMessage) -> Message {
    match message.role {
        Role::Assistant => Message::assistant(message.content.clone()),
        _ => Message::user(message.content.clone()),
    }
}

fn map_completion_error(provider: &str, err: CompletionError) -> LlmError {
    match err {
        CompletionError::ProviderError(text) => {
            let lower = text.to_lowercase();
            if lower.contains("429") || lower.contains("rate_limit") {
                LlmError::RateLimited {
                    provider: provider.to_string(),
                    retry_after: None,
                }
            } else if lower.contains("401") || lower.contains("authentication") {
                LlmError::AuthFailed {
                    provider: provider.to_string(),
                }
            } else {
                LlmError::RequestFailed {
                    provider: provider.to_string(),
                    reason: text,
                }
            }
        }
        CompletionError::JsonError(e) => LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason: e.to_string(),
        },
        CompletionError::ResponseError(reason) => LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason,
        },
        other => LlmError::RequestFailed {
            provider: provider.to_string(),
            reason: other.to_string(),
        },
    }
}

fn saturate(tokens: u64) -> u32 {
    u32::try_from(tokens).unwrap_or(u32::MAX)
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Send + Sync,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let conversation = split_conversation(&request.messages);
        let max_tokens = request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);

        let mut builder = self
            .model
            .completion_request(Message::user(conversation.prompt))
            .messages(conversation.history.iter().map(to_rig_message).collect())
            .max_tokens(u64::from(max_tokens));
        if let Some(preamble) = conversation.preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_completion_error(PROVIDER, e))?;

        let content = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(t) => Some(t.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");
        let input_tokens = saturate(response.usage.input_tokens);
        let output_tokens = saturate(response.usage.output_tokens);
        // rig does not surface the stop reason generically.
        let finish_reason = if output_tokens >= max_tokens {
            FinishReason::Length
        } else {
            FinishReason::Stop
        };

        tracing::debug!(
            model = %self.model_name,
            input_tokens,
            output_tokens,
            "Completion finished"
        );
        Ok(CompletionResponse {
            content,
            input_tokens,
            output_tokens,
            finish_reason,
            response_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_messages_become_the_preamble() {
        let conversation = split_conversation(&[
            ChatMessage::system("You classify notes."),
            ChatMessage::system("Answer in JSON."),
            ChatMessage::user("Transcript"),
        ]);
        assert_eq!(
            conversation.preamble.as_deref(),
            Some("You classify notes.\n\nAnswer in JSON.")
        );
        assert!(conversation.history.is_empty());
        assert_eq!(conversation.prompt, "Transcript");
    }

    #[test]
    fn last_turn_is_the_prompt() {
        let conversation = split_conversation(&[
            ChatMessage::user("first"),
            ChatMessage::assistant("reply"),
            ChatMessage::user("second"),
        ]);
        assert!(conversation.preamble.is_none());
        assert_eq!(
            conversation.history,
            vec![ChatMessage::user("first"), ChatMessage::assistant("reply")]
        );
        assert_eq!(conversation.prompt, "second");
    }

    #[test]
    fn empty_request_has_empty_prompt() {
        let conversation = split_conversation(&[]);
        assert_eq!(conversation.prompt, "");
        assert!(conversation.history.is_empty());
    }

    #[test]
    fn provider_errors_are_classified() {
        let limited = map_completion_error(
            "anthropic",
            CompletionError::ProviderError("429 rate_limit_error".into()),
        );
        assert!(matches!(limited, LlmError::RateLimited { .. }));

        let auth = map_completion_error(
            "anthropic",
            CompletionError::ProviderError("authentication_error: invalid x-api-key".into()),
        );
        assert!(matches!(auth, LlmError::AuthFailed { .. }));

        let other = map_completion_error(
            "anthropic",
            CompletionError::ProviderError("overloaded".into()),
        );
        assert!(matches!(other, LlmError::RequestFailed { reason, .. } if reason == "overloaded"));
    }

    #[test]
    fn malformed_responses_are_invalid() {
        let err = map_completion_error(
            "anthropic",
            CompletionError::ResponseError("no content".into()),
        );
        assert!(matches!(err, LlmError::InvalidResponse { .. }));
    }

    #[test]
    fn token_counts_saturate() {
        assert_eq!(saturate(12), 12);
        assert_eq!(saturate(u64::MAX), u32::MAX);
    }
}
