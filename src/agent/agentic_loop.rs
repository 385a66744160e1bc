//! Agentic tool-calling loop.
//!
//! Drives the LLM ↔ tool execution round-trip: sends a request to the model,
//! executes any tool calls in the response, appends results, and repeats
//! until the model produces a final text response or the turn budget runs
//! out.

use std::time::Duration;

use futures_util::future::join_all;
use tracing::debug;

use super::executor::{IssuedQuery, ToolExecutor};
use super::message::{ChatMessage, ChatRequest, ChatResponse, TokenUsage};
use super::provider::LlmProvider;
use crate::error::AgentError;

/// How a loop run ended, plus everything it accumulated on the way.
#[derive(Debug)]
pub struct LoopOutcome {
    /// Final text response, or the terminal failure.
    pub result: Result<ChatResponse, AgentError>,
    /// Usage summed over every planner call.
    pub usage: TokenUsage,
    /// Planner calls made.
    pub turns: usize,
    /// Queries issued, in issue order.
    pub issued: Vec<IssuedQuery>,
}

/// Runs an agentic loop: model → tool calls → tool results → model → …
///
/// Makes at most `max_turns` planner calls, each bounded by
/// `planner_timeout`. Tool calls requested in one turn run concurrently and
/// their results are appended in request order. A failing tool call only
/// produces an error result for that call.
///
/// Terminal failures are [`AgentError::MaxTurnsExceeded`] after exactly
/// `max_turns` calls that all requested tools, [`AgentError::PlannerTimeout`],
/// or the provider's own error.
pub async fn agentic_loop(
    provider: &dyn LlmProvider,
    request: &mut ChatRequest,
    executor: &ToolExecutor,
    max_turns: usize,
    planner_timeout: Duration,
) -> LoopOutcome {
    let mut outcome = LoopOutcome {
        result: Err(AgentError::MaxTurnsExceeded { max_turns }),
        usage: TokenUsage::default(),
        turns: 0,
        issued: Vec::new(),
    };

    for turn in 0..max_turns {
        outcome.turns = turn + 1;
        let response = match tokio::time::timeout(planner_timeout, provider.chat(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                outcome.result = Err(e);
                return outcome;
            }
            Err(_) => {
                outcome.result = Err(AgentError::PlannerTimeout {
                    timeout_secs: planner_timeout.as_secs(),
                });
                return outcome;
            }
        };
        outcome.usage.add(&response.usage);

        // No tool calls means a final answer
        if response.tool_calls.is_empty() {
            debug!(turn, "agentic loop completed with final text response");
            outcome.result = Ok(response);
            return outcome;
        }

        debug!(
            turn,
            tool_count = response.tool_calls.len(),
            "executing tool calls"
        );

        request.messages.push(ChatMessage::assistant_tool_calls(
            response.content.clone(),
            response.tool_calls.clone(),
        ));

        let results = join_all(response.tool_calls.iter().map(|call| executor.execute(call))).await;
        for (call, tool) in response.tool_calls.iter().zip(results) {
            debug!(
                tool = call.name,
                call_id = call.id,
                is_error = tool.result.is_error,
                "tool execution complete"
            );
            request
                .messages
                .push(ChatMessage::tool(tool.result.tool_call_id, tool.result.content));
            outcome.issued.extend(tool.issued);
        }
    }

    debug!(max_turns, "agentic loop exhausted its turn budget");
    outcome
}
