//! Tool-call orchestrator.
//!
//! Answers one user question: seeds the conversation with the system prompt,
//! the caller's prior turns and the new question, then runs the bounded
//! [`agentic_loop`] against the guarded query tool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use super::agentic_loop::agentic_loop;
use super::config::AgentConfig;
use super::executor::{IssuedQuery, ToolExecutor};
use super::message::{ChatMessage, ChatRequest, HistoryTurn, TokenUsage};
use super::prompt::load_system_prompt;
use super::provider::LlmProvider;
use super::tool::ToolSet;
use crate::error::AgentError;
use crate::policy::QueryPolicy;
use crate::query::{QueryExecutor, Validator};
use crate::storage::DataStore;

/// Maximum accepted question length in bytes.
pub const MAX_QUERY_LEN: usize = 10_000;

/// Answer returned when the turn budget runs out.
pub const MAX_TURNS_MESSAGE: &str =
    "I apologize, but I couldn't complete the task within the maximum number of attempts.";

/// Answer returned when the planning engine fails.
pub const PLANNER_FAILURE_MESSAGE: &str = "I apologize, but I couldn't reach the language model to answer your question. Please try again later.";

/// How a question ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStatus {
    /// The planning engine produced a final answer.
    Answered,
    /// Every allowed turn requested tools.
    MaxTurnsExceeded,
    /// The planning engine errored, timed out or was unreachable.
    PlannerUnavailable,
}

/// Result of one question.
#[derive(Debug, Clone, Serialize)]
pub struct FinalAnswer {
    /// Answer text (a fixed message on failure).
    pub answer: String,
    /// Terminal state.
    pub status: AnswerStatus,
    /// Queries issued, in order.
    pub queries: Vec<IssuedQuery>,
    /// Token usage across all planner calls.
    pub usage: TokenUsage,
    /// Planner calls made.
    pub turns: usize,
    /// Underlying failure, when not answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock time.
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
}

impl FinalAnswer {
    /// Returns `true` when the planning engine answered.
    #[must_use]
    pub fn is_answered(&self) -> bool {
        self.status == AnswerStatus::Answered
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn serialize_duration<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    s.serialize_f64(d.as_secs_f64())
}

/// Answers questions by letting the planning engine call the query tool.
pub struct Orchestrator {
    provider: Arc<dyn LlmProvider>,
    tools: ToolExecutor,
    tool_set: ToolSet,
    system_prompt: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    max_turns: usize,
    timeout: Duration,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("max_turns", &self.max_turns)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator over a read-only store.
    ///
    /// Loads the system prompt from [`AgentConfig::prompt_file`], falling back
    /// to the compiled-in prompt.
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        config: &AgentConfig,
        store: Arc<dyn DataStore>,
        policy: Arc<QueryPolicy>,
    ) -> Self {
        let tool_set = ToolSet::query_tools(&policy);
        let tools = ToolExecutor::new(
            Validator::new(Arc::clone(&policy)),
            QueryExecutor::new(store, policy),
        );
        Self {
            provider,
            tools,
            tool_set,
            system_prompt: load_system_prompt(config.prompt_file.as_deref()),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_turns: config.max_tool_turns,
            timeout: config.timeout,
        }
    }

    /// Replaces the system prompt.
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Answers one question.
    ///
    /// Prior turns are role-normalized; turns with unknown roles are skipped.
    /// Turn-budget exhaustion and planner failures are reported through
    /// [`FinalAnswer::status`] with a fixed message, never as partial answers.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Orchestration`] for empty or over-long questions,
    /// before any planner call.
    pub async fn process(
        &self,
        user_query: &str,
        prior_turns: &[HistoryTurn],
    ) -> Result<FinalAnswer, AgentError> {
        if user_query.trim().is_empty() {
            return Err(AgentError::Orchestration {
                message: "Query cannot be empty".to_string(),
            });
        }
        if user_query.len() > MAX_QUERY_LEN {
            return Err(AgentError::Orchestration {
                message: format!(
                    "Query exceeds maximum length ({} bytes, max {MAX_QUERY_LEN})",
                    user_query.len()
                ),
            });
        }

        let start = Instant::now();
        let mut request = self.seed_request(user_query, prior_turns);
        let outcome = agentic_loop(
            self.provider.as_ref(),
            &mut request,
            &self.tools,
            self.max_turns,
            self.timeout,
        )
        .await;

        let (answer, status, error) = match outcome.result {
            Ok(response) => (response.content, AnswerStatus::Answered, None),
            Err(e @ AgentError::MaxTurnsExceeded { .. }) => {
                warn!(turns = outcome.turns, "turn budget exhausted");
                (
                    MAX_TURNS_MESSAGE.to_string(),
                    AnswerStatus::MaxTurnsExceeded,
                    Some(e.to_string()),
                )
            }
            Err(e) => {
                warn!(provider = self.provider.name(), error = %e, "planning engine failed");
                let unavailable = AgentError::PlannerUnavailable {
                    message: e.to_string(),
                };
                (
                    PLANNER_FAILURE_MESSAGE.to_string(),
                    AnswerStatus::PlannerUnavailable,
                    Some(unavailable.to_string()),
                )
            }
        };

        info!(
            status = ?status,
            turns = outcome.turns,
            queries = outcome.issued.len(),
            tokens = outcome.usage.total_tokens,
            "question processed"
        );

        Ok(FinalAnswer {
            answer,
            status,
            queries: outcome.issued,
            usage: outcome.usage,
            turns: outcome.turns,
            error,
            elapsed: start.elapsed(),
        })
    }

    fn seed_request(&self, user_query: &str, prior_turns: &[HistoryTurn]) -> ChatRequest {
        let mut messages = Vec::with_capacity(prior_turns.len() + 2);
        messages.push(ChatMessage::system(self.system_prompt.as_str()));
        messages.extend(prior_turns.iter().filter_map(HistoryTurn::to_message));
        messages.push(ChatMessage::user(user_query));

        ChatRequest {
            model: self.model.clone(),
            messages,
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            tools: self.tool_set.definitions().to_vec(),
        }
    }
}
