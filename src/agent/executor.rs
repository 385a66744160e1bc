//! Tool executor that dispatches tool calls from the planning engine.
//!
//! Dispatch is a closed table ([`ToolKind`]); unknown names produce an
//! `UnknownTool` result payload and never touch the data store. Every query
//! passes through the [`Validator`] before the [`QueryExecutor`] sees it.

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::tool::{QUERY_TOOL_NAME, ToolCall, ToolResult};
use crate::error::AgentError;
use crate::query::{ExecutionResult, QueryExecutor, QueryOptions, ToolInvocation, Validator};

/// Known tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    /// Read-only query against the portfolio collections.
    Query,
}

impl ToolKind {
    /// Looks up a tool by the name the model used.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            QUERY_TOOL_NAME => Some(Self::Query),
            _ => None,
        }
    }
}

/// A query the planning engine issued, kept for traceability.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IssuedQuery {
    /// Provider-assigned call id.
    pub tool_call_id: String,
    /// Target collection.
    pub collection: String,
    /// Requested operation.
    pub operation: String,
    /// Filter or pipeline as sent.
    pub query: Value,
    /// Find options as decoded.
    pub options: QueryOptions,
    /// Field for `distinct`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Whether the query ran.
    pub success: bool,
    /// Reason code on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Reported row count.
    pub count: usize,
}

impl IssuedQuery {
    fn new(call: &ToolCall, invocation: ToolInvocation, result: &ExecutionResult) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            collection: invocation.collection,
            operation: invocation.operation,
            query: invocation.query,
            options: invocation.options,
            field: invocation.field,
            success: result.success,
            code: result.error.as_ref().map(|e| e.code().to_string()),
            count: result.row_count,
        }
    }
}

/// Result of dispatching one tool call.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    /// Tool-result turn content.
    pub result: ToolResult,
    /// The query, when the call decoded into one.
    pub issued: Option<IssuedQuery>,
}

/// Executes tool calls against the guarded query pipeline.
#[derive(Debug, Clone)]
pub struct ToolExecutor {
    validator: Validator,
    executor: QueryExecutor,
}

impl ToolExecutor {
    /// Creates an executor.
    #[must_use]
    pub const fn new(validator: Validator, executor: QueryExecutor) -> Self {
        Self {
            validator,
            executor,
        }
    }

    /// Dispatches one tool call. Failures become error payloads for the
    /// model; this never aborts the conversation.
    pub async fn execute(&self, call: &ToolCall) -> ToolOutcome {
        let Some(kind) = ToolKind::from_name(&call.name) else {
            let err = AgentError::UnknownTool {
                name: call.name.clone(),
            };
            warn!(tool = call.name, "model requested unknown tool");
            return ToolOutcome {
                result: error_result(call, &json!({
                    "success": false,
                    "error": err.to_string(),
                    "code": "UnknownTool",
                })),
                issued: None,
            };
        };

        match kind {
            ToolKind::Query => self.run_query(call).await,
        }
    }

    async fn run_query(&self, call: &ToolCall) -> ToolOutcome {
        let invocation = match ToolInvocation::from_arguments(&call.arguments) {
            Ok(inv) => inv,
            Err(e) => {
                warn!(tool = call.name, error = %e, "undecodable tool arguments");
                return ToolOutcome {
                    result: error_result(call, &json!({
                        "success": false,
                        "error": e.to_string(),
                        "code": "ToolArguments",
                        "data": [],
                        "count": 0,
                    })),
                    issued: None,
                };
            }
        };
        debug!(
            id = call.id,
            collection = invocation.collection,
            operation = invocation.operation,
            "dispatching query"
        );

        let result = match self.validator.validate(&invocation) {
            Ok(validated) => self.executor.execute(&validated).await,
            Err(e) => ExecutionResult::failure(None, e),
        };
        let payload = result.to_payload();
        let tool_result = ToolResult {
            tool_call_id: call.id.clone(),
            content: payload.to_string(),
            is_error: !result.success,
        };
        ToolOutcome {
            result: tool_result,
            issued: Some(IssuedQuery::new(call, invocation, &result)),
        }
    }
}

fn error_result(call: &ToolCall, payload: &Value) -> ToolResult {
    ToolResult {
        tool_call_id: call.id.clone(),
        content: payload.to_string(),
        is_error: true,
    }
}
