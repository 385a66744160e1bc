//! Tool type definitions for function-calling.
//!
//! The planning engine sees exactly one tool, [`QUERY_TOOL_NAME`], whose
//! arguments decode into a [`ToolInvocation`](crate::query::ToolInvocation).

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::policy::QueryPolicy;

/// Name of the read-only query tool.
pub const QUERY_TOOL_NAME: &str = "execute_query";

/// A tool definition that can be sent to an LLM for function-calling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name (must match the dispatch table in the executor).
    pub name: String,
    /// Human-readable description of what the tool does.
    pub description: String,
    /// JSON Schema object describing the tool's parameters.
    pub parameters: serde_json::Value,
}

/// A tool call requested by the LLM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this call (assigned by the provider).
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// JSON-encoded arguments for the tool.
    pub arguments: String,
}

/// The result of executing a tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    /// ID of the tool call this result corresponds to.
    pub tool_call_id: String,
    /// Serialized result payload.
    pub content: String,
    /// Whether this result represents an error.
    pub is_error: bool,
}

/// Tools offered to the planning engine.
#[derive(Debug, Clone, Default)]
pub struct ToolSet {
    definitions: Vec<ToolDefinition>,
}

impl ToolSet {
    /// Returns the tool definitions in this set.
    #[must_use]
    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.definitions
    }

    /// Returns `true` if this set contains no tools.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Returns the number of tools in this set.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.definitions.len()
    }

    /// The query tool, with its enums drawn from the policy allow-lists.
    #[must_use]
    pub fn query_tools(policy: &QueryPolicy) -> Self {
        Self {
            definitions: vec![def_execute_query(policy)],
        }
    }
}

fn def_execute_query(policy: &QueryPolicy) -> ToolDefinition {
    let collections = policy.allowed_collections().join("' or '");
    ToolDefinition {
        name: QUERY_TOOL_NAME.to_string(),
        description: "Execute a read-only query (find, aggregate, countDocuments, distinct) \
                      against the portfolio holdings and trades collections. Returns \
                      {success, data, count, query_info} or {success: false, error, code}."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "collection": {
                    "type": "string",
                    "enum": policy.allowed_collections(),
                    "description": format!("Collection name: '{collections}'")
                },
                "operation": {
                    "type": "string",
                    "enum": policy.allowed_operations(),
                    "description": "Query operation type"
                },
                "query": {
                    "type": "array",
                    "items": { "type": "object" },
                    "description": "For find/countDocuments/distinct: the filter object inside \
                                    an array. For aggregate: the pipeline stages."
                },
                "options": {
                    "type": "object",
                    "description": "Find options: sort, limit, skip, projection. The limit is \
                                    capped by the server."
                },
                "field": {
                    "type": "string",
                    "description": "Field name for the distinct operation"
                }
            },
            "required": ["collection", "operation", "query"]
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_toolset() {
        let ts = ToolSet::query_tools(&QueryPolicy::default());
        assert_eq!(ts.len(), 1);
        assert!(!ts.is_empty());
        let def = &ts.definitions()[0];
        assert_eq!(def.name, QUERY_TOOL_NAME);
        assert_eq!(def.parameters["type"], "object");
        assert_eq!(
            def.parameters["properties"]["collection"]["enum"],
            json!(["holdings", "trades"])
        );
        assert_eq!(
            def.parameters["properties"]["operation"]["enum"],
            json!(["find", "aggregate", "countDocuments", "distinct"])
        );
    }

    #[test]
    fn test_tool_call_serialization() {
        let call = ToolCall {
            id: "call_123".to_string(),
            name: QUERY_TOOL_NAME.to_string(),
            arguments: r#"{"collection":"trades"}"#.to_string(),
        };
        let json = serde_json::to_string(&call).unwrap_or_default();
        assert!(json.contains("call_123"));
        assert!(json.contains("execute_query"));
    }
}
