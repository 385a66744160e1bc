//! Canonical tool invocation and its boundary adapter.
//!
//! Provider SDKs hand tool arguments over as a JSON string whose shape drifts
//! between models (`query` as an object or an array, `options` as `null`,
//! numbers as floats). [`ToolInvocation::from_arguments`] is the single place
//! that normalizes them; everything downstream sees the canonical type.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agent::tool::QUERY_TOOL_NAME;
use crate::error::{AgentError, QueryError};

/// Maximum raw byte length of tool argument JSON from the LLM.
pub const MAX_TOOL_ARGS_LEN: usize = 100_000;

/// The four read-only operations the executor dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Filtered scan with sort/skip/limit/projection.
    #[serde(rename = "find")]
    Find,
    /// Ordered stage pipeline.
    #[serde(rename = "aggregate")]
    Aggregate,
    /// Number of matching documents.
    #[serde(rename = "countDocuments")]
    CountDocuments,
    /// Distinct values of one field.
    #[serde(rename = "distinct")]
    Distinct,
}

impl Operation {
    /// Parses the wire name of an operation.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "find" => Some(Self::Find),
            "aggregate" => Some(Self::Aggregate),
            "countDocuments" => Some(Self::CountDocuments),
            "distinct" => Some(Self::Distinct),
            _ => None,
        }
    }

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Find => "find",
            Self::Aggregate => "aggregate",
            Self::CountDocuments => "countDocuments",
            Self::Distinct => "distinct",
        }
    }

    /// Returns `true` for pipeline-style operations.
    #[must_use]
    pub const fn is_pipeline(self) -> bool {
        matches!(self, Self::Aggregate)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    /// Dotted field path.
    pub field: String,
    /// Descending when `true`.
    pub descending: bool,
}

/// Find options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Sort keys in priority order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<SortKey>,
    /// Requested row limit (0 means none).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// Rows to skip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,
    /// Field projection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection: Option<Map<String, Value>>,
}

impl QueryOptions {
    /// Parses an options object leniently: `null` or non-objects are empty
    /// options, float counts are truncated, negative counts use their
    /// magnitude, unknown keys are ignored.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::default();
        };
        Self {
            sort: obj.get("sort").map(parse_sort).unwrap_or_default(),
            limit: obj.get("limit").and_then(count),
            skip: obj.get("skip").and_then(count),
            projection: obj
                .get("projection")
                .and_then(Value::as_object)
                .filter(|m| !m.is_empty())
                .cloned(),
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(i64::unsigned_abs)
            .or_else(|| n.as_f64().map(|f| f.abs().trunc() as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn direction(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.as_f64().is_some_and(|f| f < 0.0),
        Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "desc" | "descending" | "-1"),
        _ => false,
    }
}

pub(crate) fn parse_sort(value: &Value) -> Vec<SortKey> {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(field, dir)| SortKey {
                field: field.clone(),
                descending: direction(dir),
            })
            .collect(),
        // [["field", -1], ...]
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                let pair = item.as_array()?;
                Some(SortKey {
                    field: pair.first()?.as_str()?.to_string(),
                    descending: pair.get(1).is_some_and(direction),
                })
            })
            .collect(),
        Value::String(field) => vec![SortKey {
            field: field.clone(),
            descending: false,
        }],
        _ => Vec::new(),
    }
}

/// A structured request from the planning engine to run one data operation.
///
/// `operation` is kept as the raw string the model sent so that verbs outside
/// the allow-list (including mutating ones) reach the validator and are
/// reported with the right reason code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Target collection.
    pub collection: String,
    /// Requested operation name.
    pub operation: String,
    /// Filter object or pipeline stages.
    #[serde(default)]
    pub query: Value,
    /// Find options.
    #[serde(default)]
    pub options: QueryOptions,
    /// Field for `distinct`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl ToolInvocation {
    /// Creates an invocation with empty options.
    #[must_use]
    pub fn new(collection: impl Into<String>, operation: impl Into<String>, query: Value) -> Self {
        Self {
            collection: collection.into(),
            operation: operation.into(),
            query,
            options: QueryOptions::default(),
            field: None,
        }
    }

    /// Sets the options.
    #[must_use]
    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the distinct field.
    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Decodes raw tool-call arguments into the canonical invocation.
    ///
    /// Accepts a JSON object, or a JSON string containing one (some models
    /// double-encode). `collection` and `operation` are required strings.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::ToolArguments`] for oversized payloads, invalid
    /// JSON, non-object arguments, or missing required keys.
    pub fn from_arguments(raw: &str) -> Result<Self, AgentError> {
        if raw.len() > MAX_TOOL_ARGS_LEN {
            return Err(arguments_error(format!(
                "tool arguments too large ({} bytes, max {MAX_TOOL_ARGS_LEN})",
                raw.len()
            )));
        }
        let mut value: Value = serde_json::from_str(raw)
            .map_err(|e| arguments_error(format!("invalid JSON: {e}")))?;
        if let Value::String(inner) = &value {
            value = serde_json::from_str(inner)
                .map_err(|e| arguments_error(format!("invalid JSON: {e}")))?;
        }
        Self::from_value(&value)
    }

    /// Decodes an already-parsed argument object.
    ///
    /// # Errors
    ///
    /// See [`ToolInvocation::from_arguments`].
    pub fn from_value(value: &Value) -> Result<Self, AgentError> {
        let obj = value
            .as_object()
            .ok_or_else(|| arguments_error("arguments must be a JSON object"))?;
        let collection = required_str(obj, "collection")?;
        let operation = required_str(obj, "operation")?;
        let query = match obj.get("query") {
            Some(Value::String(s)) => serde_json::from_str(s).unwrap_or(Value::String(s.clone())),
            Some(v) => v.clone(),
            None => Value::Null,
        };
        Ok(Self {
            collection,
            operation,
            query,
            options: obj
                .get("options")
                .map(QueryOptions::from_value)
                .unwrap_or_default(),
            field: obj
                .get("field")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from),
        })
    }
}

fn required_str(obj: &Map<String, Value>, key: &str) -> Result<String, AgentError> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or_else(|| arguments_error(format!("missing required string `{key}`")))
}

fn arguments_error(message: impl Into<String>) -> AgentError {
    AgentError::ToolArguments {
        name: QUERY_TOOL_NAME.to_string(),
        message: message.into(),
    }
}

/// The query value reshaped for its operation.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryBody {
    /// A filter object for `find`, `countDocuments`, `distinct`.
    Filter(Map<String, Value>),
    /// Raw pipeline stages for `aggregate` (parsed by the executor).
    Pipeline(Vec<Value>),
}

impl QueryBody {
    /// Checks that `query` structurally fits `operation`.
    ///
    /// For filter operations, `null` and `[]` mean "match all" and a
    /// non-empty array contributes its first element. For `aggregate`, a lone
    /// object becomes a one-stage pipeline and `null` an empty pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::MalformedQuery`] when the shape does not fit.
    pub fn from_query(operation: Operation, query: &Value) -> Result<Self, QueryError> {
        if operation.is_pipeline() {
            return match query {
                Value::Array(stages) => Ok(Self::Pipeline(stages.clone())),
                Value::Object(_) => Ok(Self::Pipeline(vec![query.clone()])),
                Value::Null => Ok(Self::Pipeline(Vec::new())),
                other => Err(malformed(format!(
                    "aggregate requires an array of stages, got {}",
                    type_name(other)
                ))),
            };
        }
        match query {
            Value::Null => Ok(Self::Filter(Map::new())),
            Value::Object(map) => Ok(Self::Filter(map.clone())),
            Value::Array(items) => match items.first() {
                None | Some(Value::Null) => Ok(Self::Filter(Map::new())),
                Some(Value::Object(map)) => Ok(Self::Filter(map.clone())),
                Some(other) => Err(malformed(format!(
                    "{operation} filter must be an object, got {}",
                    type_name(other)
                ))),
            },
            other => Err(malformed(format!(
                "{operation} filter must be an object, got {}",
                type_name(other)
            ))),
        }
    }

    /// Number of pipeline stages, or `None` for a filter.
    #[must_use]
    pub fn stage_count(&self) -> Option<usize> {
        match self {
            Self::Filter(_) => None,
            Self::Pipeline(stages) => Some(stages.len()),
        }
    }
}

fn malformed(message: String) -> QueryError {
    QueryError::MalformedQuery { message }
}

const fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use serde_json::json;

    use super::*;

    fn decode(raw: &str) -> ToolInvocation {
        ToolInvocation::from_arguments(raw).unwrap_or_else(|e| panic!("decode failed: {e}"))
    }

    #[test]
    fn test_from_arguments_basic() {
        let inv = decode(
            r#"{"collection":"trades","operation":"find","query":[{"TradeTypeName":"Buy"}]}"#,
        );
        assert_eq!(inv.collection, "trades");
        assert_eq!(inv.operation, "find");
        assert_eq!(inv.query, json!([{"TradeTypeName": "Buy"}]));
        assert_eq!(inv.options, QueryOptions::default());
        assert!(inv.field.is_none());
    }

    #[test]
    fn test_from_arguments_double_encoded() {
        let inner = r#"{"collection":"holdings","operation":"distinct","field":"PortfolioName"}"#;
        let raw = serde_json::to_string(inner).unwrap_or_default();
        let inv = decode(&raw);
        assert_eq!(inv.field.as_deref(), Some("PortfolioName"));
        assert_eq!(inv.query, Value::Null);
    }

    #[test]
    fn test_from_arguments_rejects_missing_collection() {
        let err = ToolInvocation::from_arguments(r#"{"operation":"find"}"#);
        assert!(matches!(err, Err(AgentError::ToolArguments { .. })));
    }

    #[test]
    fn test_from_arguments_rejects_oversized() {
        let raw = format!(r#"{{"collection":"{}"}}"#, "x".repeat(MAX_TOOL_ARGS_LEN));
        let err = ToolInvocation::from_arguments(&raw);
        assert!(matches!(err, Err(AgentError::ToolArguments { .. })));
    }

    #[test]
    fn test_options_lenient() {
        let opts = QueryOptions::from_value(&json!({
            "limit": 10.7,
            "skip": -5,
            "sort": {"TradeDate": -1, "Qty": 1},
            "projection": {}
        }));
        assert_eq!(opts.limit, Some(10));
        assert_eq!(opts.skip, Some(5));
        assert_eq!(opts.sort.len(), 2);
        assert!(opts.sort[0].descending);
        assert!(!opts.sort[1].descending);
        assert!(opts.projection.is_none());

        assert_eq!(QueryOptions::from_value(&Value::Null), QueryOptions::default());
    }

    #[test]
    fn test_sort_as_pairs() {
        let opts = QueryOptions::from_value(&json!({"sort": [["TradeDate", "desc"]]}));
        assert_eq!(
            opts.sort,
            vec![SortKey {
                field: "TradeDate".to_string(),
                descending: true
            }]
        );
    }

    #[test]
    fn test_query_body_shapes() {
        let body = QueryBody::from_query(Operation::Find, &json!([]));
        assert_eq!(body, Ok(QueryBody::Filter(Map::new())));

        let body = QueryBody::from_query(Operation::Aggregate, &json!({"$match": {}}));
        assert_eq!(body.map(|b| b.stage_count()), Ok(Some(1)));

        let err = QueryBody::from_query(Operation::CountDocuments, &json!(42));
        assert!(matches!(err, Err(QueryError::MalformedQuery { .. })));

        let err = QueryBody::from_query(Operation::Aggregate, &json!("stages"));
        assert!(matches!(err, Err(QueryError::MalformedQuery { .. })));
    }

    #[test]
    fn test_operation_round_trip_names() {
        for name in ["find", "aggregate", "countDocuments", "distinct"] {
            assert_eq!(Operation::parse(name).map(Operation::as_str), Some(name));
        }
        assert_eq!(Operation::parse("drop"), None);
    }
}
