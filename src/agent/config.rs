//! Agent configuration with builder pattern and environment variable support.
//!
//! Configuration is resolved in order: explicit values → environment variables → defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::AgentError;

/// Default planning model.
const DEFAULT_MODEL: &str = "gpt-4o-mini";
/// Default sampling temperature.
const DEFAULT_TEMPERATURE: f32 = 0.1;
/// Default max output tokens.
const DEFAULT_MAX_TOKENS: u32 = 2048;
/// Default planner request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 60;
/// Default tool-call turn budget.
const DEFAULT_MAX_TOOL_TURNS: usize = 5;

/// Configuration for the planning engine and orchestrator.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// LLM provider name (e.g., "openai").
    pub provider: String,
    /// API key for the provider.
    pub api_key: String,
    /// Optional base URL override (for proxies or compatible APIs).
    pub base_url: Option<String>,
    /// Planning model.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Maximum tokens per planner response.
    pub max_tokens: u32,
    /// Timeout for one planner call.
    pub timeout: Duration,
    /// Planner calls allowed per question.
    pub max_tool_turns: usize,
    /// System prompt override file.
    pub prompt_file: Option<PathBuf>,
}

impl AgentConfig {
    /// Creates a new builder for `AgentConfig`.
    #[must_use]
    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder::default()
    }

    /// Creates configuration from environment variables with defaults.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::ApiKeyMissing`] if no API key is found.
    pub fn from_env() -> Result<Self, AgentError> {
        Self::builder().from_env().build()
    }
}

/// Builder for [`AgentConfig`].
#[derive(Debug, Clone, Default)]
pub struct AgentConfigBuilder {
    provider: Option<String>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    timeout: Option<Duration>,
    max_tool_turns: Option<usize>,
    prompt_file: Option<PathBuf>,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl AgentConfigBuilder {
    /// Populates unset fields from environment variables.
    #[must_use]
    pub fn from_env(mut self) -> Self {
        if self.provider.is_none() {
            self.provider = std::env::var("PQA_PROVIDER").ok();
        }
        if self.api_key.is_none() {
            self.api_key = std::env::var("OPENAI_API_KEY")
                .or_else(|_| std::env::var("PQA_API_KEY"))
                .ok();
        }
        if self.base_url.is_none() {
            self.base_url = std::env::var("OPENAI_BASE_URL")
                .or_else(|_| std::env::var("PQA_BASE_URL"))
                .ok();
        }
        if self.model.is_none() {
            self.model = std::env::var("PQA_MODEL").ok();
        }
        if self.temperature.is_none() {
            self.temperature = env_parse("PQA_TEMPERATURE");
        }
        if self.max_tokens.is_none() {
            self.max_tokens = env_parse("PQA_MAX_TOKENS");
        }
        if self.timeout.is_none() {
            self.timeout = env_parse("PQA_TIMEOUT_SECS").map(Duration::from_secs);
        }
        if self.max_tool_turns.is_none() {
            self.max_tool_turns = env_parse("PQA_MAX_TOOL_TURNS");
        }
        if self.prompt_file.is_none() {
            self.prompt_file = std::env::var("PQA_PROMPT_FILE").ok().map(PathBuf::from);
        }
        self
    }

    /// Sets the LLM provider name.
    #[must_use]
    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Sets the API key.
    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the base URL override.
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Sets the planning model.
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the sampling temperature.
    #[must_use]
    pub const fn temperature(mut self, t: f32) -> Self {
        self.temperature = Some(t);
        self
    }

    /// Sets the max output tokens.
    #[must_use]
    pub const fn max_tokens(mut self, n: u32) -> Self {
        self.max_tokens = Some(n);
        self
    }

    /// Sets the planner request timeout.
    #[must_use]
    pub const fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Sets the tool-call turn budget.
    #[must_use]
    pub const fn max_tool_turns(mut self, n: usize) -> Self {
        self.max_tool_turns = Some(n);
        self
    }

    /// Sets the system prompt override file.
    #[must_use]
    pub fn prompt_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.prompt_file = Some(path.into());
        self
    }

    /// Builds the [`AgentConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::ApiKeyMissing`] if no API key was set.
    pub fn build(self) -> Result<AgentConfig, AgentError> {
        let api_key = self
            .api_key
            .filter(|k| !k.trim().is_empty())
            .ok_or(AgentError::ApiKeyMissing)?;

        Ok(AgentConfig {
            provider: self.provider.unwrap_or_else(|| "openai".to_string()),
            api_key,
            base_url: self.base_url,
            model: self.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            temperature: self.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            max_tokens: self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            timeout: self
                .timeout
                .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            max_tool_turns: self
                .max_tool_turns
                .unwrap_or(DEFAULT_MAX_TOOL_TURNS)
                .max(1),
            prompt_file: self.prompt_file,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = AgentConfig::builder()
            .api_key("test-key")
            .build()
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(config.provider, "openai");
        assert_eq!(config.api_key, "test-key");
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.max_tool_turns, 5);
        assert_eq!(config.max_tokens, 2048);
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert!((config.temperature - 0.1).abs() < f32::EPSILON);
    }

    #[test]
    fn test_builder_missing_api_key() {
        assert!(matches!(
            AgentConfig::builder().build(),
            Err(AgentError::ApiKeyMissing)
        ));
        assert!(AgentConfig::builder().api_key("  ").build().is_err());
    }

    #[test]
    fn test_builder_custom_values() {
        let config = AgentConfig::builder()
            .api_key("key")
            .provider("custom")
            .model("gpt-4.1")
            .max_tool_turns(0)
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(config.provider, "custom");
        assert_eq!(config.model, "gpt-4.1");
        assert_eq!(config.max_tool_turns, 1);
        assert_eq!(config.timeout, Duration::from_secs(30));
    }
}
