//! Provider-independent completion types.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    /// Output was cut off at `max_tokens`.
    Length,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub finish_reason: FinishReason,
    pub response_id: Option<String>,
}

/// A text completion backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;
}

/// Run a completion and deserialize the JSON object in its answer.
pub async fn complete_json<T: DeserializeOwned>(
    llm: &dyn LlmProvider,
    request: CompletionRequest,
) -> Result<T, LlmError> {
    let response = llm.complete(request).await?;
    if response.finish_reason == FinishReason::Length {
        tracing::warn!(
            model = llm.model_name(),
            output_tokens = response.output_tokens,
            "Completion hit the token limit, parsing what was returned"
        );
    }
    let json = extract_json_object(&response.content);
    serde_json::from_str(&json).map_err(|e| {
        tracing::debug!(model = llm.model_name(), raw = %response.content, "Unparseable JSON answer");
        LlmError::from(e)
    })
}

/// Extract a JSON object from a response that may wrap it in markdown fences
/// or surrounding prose.
pub fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedLlm {
        response: String,
        finish_reason: FinishReason,
    }

    #[async_trait]
    impl LlmProvider for FixedLlm {
        fn model_name(&self) -> &str {
            "fixed"
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            Ok(CompletionResponse {
                content: self.response.clone(),
                input_tokens: 10,
                output_tokens: 5,
                finish_reason: self.finish_reason,
                response_id: None,
            })
        }
    }

    #[derive(Debug, Deserialize)]
    struct Answer {
        category: String,
    }

    #[test]
    fn extract_json_plain() {
        assert_eq!(extract_json_object(r#" {"a": 1} "#), r#"{"a": 1}"#);
    }

    #[test]
    fn extract_json_fenced() {
        let text = "Here you go:\n```json\n{\"a\": 1}\n```\nThanks";
        assert_eq!(extract_json_object(text), r#"{"a": 1}"#);
    }

    #[test]
    fn extract_json_bare_fence() {
        assert_eq!(extract_json_object("```\n{\"a\": 1}\n```"), r#"{"a": 1}"#);
    }

    #[test]
    fn extract_json_embedded_in_prose() {
        assert_eq!(
            extract_json_object("The answer is {\"a\": {\"b\": 2}} as requested."),
            r#"{"a": {"b": 2}}"#
        );
    }

    #[test]
    fn extract_json_no_object() {
        assert_eq!(extract_json_object("  nothing here "), "nothing here");
    }

    #[test]
    fn request_builder() {
        let request = CompletionRequest::new(vec![ChatMessage::system("s"), ChatMessage::user("u")])
            .with_max_tokens(256)
            .with_temperature(0.1);
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[0].role, Role::System);
        assert_eq!(request.max_tokens, Some(256));
    }

    #[tokio::test]
    async fn complete_json_parses_fenced_answer() {
        let llm = FixedLlm {
            response: "```json\n{\"category\": \"idea\"}\n```".into(),
            finish_reason: FinishReason::Stop,
        };
        let answer: Answer = complete_json(&llm, CompletionRequest::new(vec![]))
            .await
            .unwrap();
        assert_eq!(answer.category, "idea");
    }

    #[tokio::test]
    async fn complete_json_reports_bad_json() {
        let llm = FixedLlm {
            response: "{\"category\": ".into(),
            finish_reason: FinishReason::Length,
        };
        let result: Result<Answer, _> = complete_json(&llm, CompletionRequest::new(vec![])).await;
        assert!(matches!(result, Err(LlmError::Json(_))));
    }
}
