//! AI capability boundary.
//!
//! Processors talk to an [`LlmProvider`]. Anthropic models are reached through
//! rig-core, with [`RigAdapter`] bridging rig's `CompletionModel` to our trait.

pub mod provider;
mod rig_adapter;

pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::sync::Arc;

use rig::client::CompletionClient;
use secrecy::ExposeSecret;

use crate::config::AiConfig;
use crate::error::LlmError;

/// Providers for the two model tiers used by the pipeline.
#[derive(Clone)]
pub struct LlmModels {
    /// Extraction, entity detection and summaries.
    pub main: Arc<dyn LlmProvider>,
    /// Classification.
    pub small: Arc<dyn LlmProvider>,
}

/// Create both providers from configuration.
pub fn create_models(config: &AiConfig) -> Result<LlmModels, LlmError> {
    let main = create_anthropic_provider(config, &config.model)?;
    let small = create_anthropic_provider(config, &config.small_model)?;
    tracing::info!(
        model = %config.model,
        small_model = %config.small_model,
        "Using Anthropic"
    );
    Ok(LlmModels { main, small })
}

fn create_anthropic_provider(
    config: &AiConfig,
    model: &str,
) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {}", e),
            }
        })?;

    let completion_model = client.completion_model(model);
    Ok(Arc::new(RigAdapter::new(completion_model, model)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_models_uses_configured_names() {
        // The key is only checked when a request is sent.
        let config = AiConfig {
            api_key: secrecy::SecretString::from("test-key"),
            model: "claude-main".to_string(),
            small_model: "claude-small".to_string(),
        };
        let models = create_models(&config).unwrap();
        assert_eq!(models.main.model_name(), "claude-main");
        assert_eq!(models.small.model_name(), "claude-small");
    }
}
