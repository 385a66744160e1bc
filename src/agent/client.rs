//! Backend selection.

use crate::agent::config::AgentConfig;
use crate::agent::provider::LlmProvider;
use crate::error::AgentError;

/// Builds the planning-engine backend named by [`AgentConfig::provider`].
///
/// Only `"openai"` is known, and only with the `openai` feature enabled. It
/// covers any endpoint speaking the `OpenAI` chat-completions protocol.
///
/// # Errors
///
/// Returns [`AgentError::UnsupportedProvider`] for unknown or compiled-out
/// provider names.
pub fn create_provider(config: &AgentConfig) -> Result<Box<dyn LlmProvider>, AgentError> {
    match config.provider.as_str() {
        #[cfg(feature = "openai")]
        "openai" => Ok(Box::new(crate::agent::providers::OpenAiProvider::new(config))),
        other => Err(AgentError::UnsupportedProvider {
            name: other.to_string(),
        }),
    }
}
