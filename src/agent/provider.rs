//! Planning-engine backend seam.
//!
//! The orchestrator only ever talks to [`LlmProvider`]; vendor SDK types stay
//! inside `providers/`.

use async_trait::async_trait;

use super::message::{ChatRequest, ChatResponse};
use crate::error::AgentError;

/// A chat-completion backend that can return tool calls.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Short backend name used in logs and config (`"openai"`).
    fn name(&self) -> &'static str;

    /// Sends one planning request.
    ///
    /// Tool calls in the response must keep the order the backend returned
    /// them in.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::ApiRequest`] when the backend rejects the
    /// request or cannot be reached.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, AgentError>;
}
