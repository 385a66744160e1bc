//! Compiled document filters.
//!
//! A filter object is compiled once into a [`Filter`] tree (regexes are built
//! up front) and then evaluated against every scanned document.

use std::cmp::Ordering;

use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};

use super::value::{compare, get_path, is_wrapper, values_equal};
use crate::error::QueryError;

/// Maximum regex pattern length accepted in `$regex`.
const MAX_REGEX_LEN: usize = 500;
/// Maximum compiled regex DFA size (bytes).
const MAX_REGEX_DFA_SIZE: usize = 1_000_000;

/// A compiled filter expression.
#[derive(Debug, Clone)]
pub enum Filter {
    /// All sub-filters must match. An empty list matches everything.
    And(Vec<Self>),
    /// At least one sub-filter must match.
    Or(Vec<Self>),
    /// No sub-filter may match.
    Nor(Vec<Self>),
    /// A predicate over the value at a dotted path.
    Field {
        /// Dotted field path.
        path: String,
        /// Condition on the field.
        predicate: Predicate,
    },
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// `$gt`
    Gt,
    /// `$gte`
    Gte,
    /// `$lt`
    Lt,
    /// `$lte`
    Lte,
}

impl CmpOp {
    const fn accepts(self, ord: Ordering) -> bool {
        match self {
            Self::Gt => ord.is_gt(),
            Self::Gte => ord.is_ge(),
            Self::Lt => ord.is_lt(),
            Self::Lte => ord.is_le(),
        }
    }
}

/// A condition on a single field value.
#[derive(Debug, Clone)]
pub enum Predicate {
    /// Equality (`null` also matches a missing field).
    Eq(Value),
    /// Negated equality.
    Ne(Value),
    /// Ordered comparison.
    Cmp(CmpOp, Value),
    /// Membership.
    In(Vec<Value>),
    /// Negated membership.
    Nin(Vec<Value>),
    /// Field presence.
    Exists(bool),
    /// Regex match on string values.
    Regex(Regex),
    /// Negation.
    Not(Box<Self>),
    /// Conjunction of operator predicates on the same field.
    All(Vec<Self>),
}

impl Filter {
    /// Compiles a filter object.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::ExecutionFailure`] for unsupported operators or
    /// malformed operands.
    pub fn compile(filter: &Map<String, Value>) -> Result<Self, QueryError> {
        let mut clauses = Vec::with_capacity(filter.len());
        for (key, cond) in filter {
            let clause = match key.as_str() {
                "$and" => Self::And(compile_list(key, cond)?),
                "$or" => Self::Or(compile_list(key, cond)?),
                "$nor" => Self::Nor(compile_list(key, cond)?),
                "$comment" => continue,
                op if op.starts_with('$') => {
                    return Err(QueryError::execution(format!(
                        "unsupported top-level operator {op}"
                    )));
                }
                path => Self::Field {
                    path: path.to_string(),
                    predicate: compile_condition(cond)?,
                },
            };
            clauses.push(clause);
        }
        if clauses.len() == 1 {
            return Ok(clauses.remove(0));
        }
        Ok(Self::And(clauses))
    }

    /// Evaluates the filter against a document.
    #[must_use]
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Self::And(items) => items.iter().all(|f| f.matches(doc)),
            Self::Or(items) => items.iter().any(|f| f.matches(doc)),
            Self::Nor(items) => !items.iter().any(|f| f.matches(doc)),
            Self::Field { path, predicate } => predicate.test(get_path(doc, path)),
        }
    }
}

fn compile_list(op: &str, value: &Value) -> Result<Vec<Filter>, QueryError> {
    let items = value
        .as_array()
        .ok_or_else(|| QueryError::execution(format!("{op} requires an array")))?;
    items
        .iter()
        .map(|item| match item {
            Value::Object(map) => Filter::compile(map),
            other => Err(QueryError::execution(format!(
                "{op} entries must be objects, got {other}"
            ))),
        })
        .collect()
}

/// Returns `true` if a condition object is made of operators, as opposed to
/// a literal sub-document or Extended-JSON value to compare against.
fn is_operator_object(map: &Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|k| k.starts_with('$'))
}

fn compile_condition(cond: &Value) -> Result<Predicate, QueryError> {
    match cond {
        Value::Object(map) if is_operator_object(map) && !is_wrapper(cond) => {
            let mut preds = Vec::with_capacity(map.len());
            for (op, operand) in map {
                if op == "$options" {
                    continue;
                }
                preds.push(compile_operator(op, operand, map.get("$options"))?);
            }
            if preds.len() == 1 {
                return Ok(preds.remove(0));
            }
            Ok(Predicate::All(preds))
        }
        literal => Ok(Predicate::Eq(literal.clone())),
    }
}

fn compile_operator(
    op: &str,
    operand: &Value,
    options: Option<&Value>,
) -> Result<Predicate, QueryError> {
    let pred = match op {
        "$eq" => Predicate::Eq(operand.clone()),
        "$ne" => Predicate::Ne(operand.clone()),
        "$gt" => Predicate::Cmp(CmpOp::Gt, operand.clone()),
        "$gte" => Predicate::Cmp(CmpOp::Gte, operand.clone()),
        "$lt" => Predicate::Cmp(CmpOp::Lt, operand.clone()),
        "$lte" => Predicate::Cmp(CmpOp::Lte, operand.clone()),
        "$in" => Predicate::In(array_operand(op, operand)?),
        "$nin" => Predicate::Nin(array_operand(op, operand)?),
        "$exists" => Predicate::Exists(truthy(operand)),
        "$regex" => Predicate::Regex(compile_regex(operand, options)?),
        "$not" => Predicate::Not(Box::new(compile_condition(operand)?)),
        other => {
            return Err(QueryError::execution(format!(
                "unsupported query operator {other}"
            )));
        }
    };
    Ok(pred)
}

fn array_operand(op: &str, operand: &Value) -> Result<Vec<Value>, QueryError> {
    operand
        .as_array()
        .cloned()
        .ok_or_else(|| QueryError::execution(format!("{op} requires an array")))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::Null => false,
        _ => true,
    }
}

fn compile_regex(pattern: &Value, options: Option<&Value>) -> Result<Regex, QueryError> {
    let pattern = pattern
        .as_str()
        .ok_or_else(|| QueryError::execution("$regex requires a string pattern"))?;
    if pattern.len() > MAX_REGEX_LEN {
        return Err(QueryError::execution(format!(
            "regex pattern too long ({} bytes, max {MAX_REGEX_LEN})",
            pattern.len()
        )));
    }
    let flags = options.and_then(Value::as_str).unwrap_or_default();
    RegexBuilder::new(pattern)
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'))
        .ignore_whitespace(flags.contains('x'))
        .size_limit(MAX_REGEX_DFA_SIZE)
        .build()
        .map_err(|e| QueryError::execution(format!("invalid regex: {e}")))
}

impl Predicate {
    /// Tests the value found at the field path (`None` when missing).
    #[must_use]
    pub fn test(&self, field: Option<&Value>) -> bool {
        match self {
            Self::Eq(expected) => eq_matches(field, expected),
            Self::Ne(expected) => !eq_matches(field, expected),
            Self::Cmp(op, bound) => any_element(field, |v| {
                compare(v, bound).is_some_and(|ord| op.accepts(ord))
            }),
            Self::In(options) => options.iter().any(|o| eq_matches(field, o)),
            Self::Nin(options) => !options.iter().any(|o| eq_matches(field, o)),
            Self::Exists(want) => field.is_some() == *want,
            Self::Regex(re) => any_element(field, |v| v.as_str().is_some_and(|s| re.is_match(s))),
            Self::Not(inner) => !inner.test(field),
            Self::All(preds) => preds.iter().all(|p| p.test(field)),
        }
    }
}

/// Applies `test` to a scalar field, or to each element of an array field.
fn any_element(field: Option<&Value>, test: impl Fn(&Value) -> bool) -> bool {
    match field {
        None => false,
        Some(Value::Array(items)) => items.iter().any(&test),
        Some(v) => test(v),
    }
}

fn eq_matches(field: Option<&Value>, expected: &Value) -> bool {
    if expected.is_null() {
        return match field {
            None | Some(Value::Null) => true,
            Some(Value::Array(items)) => items.iter().any(Value::is_null),
            Some(_) => false,
        };
    }
    match field {
        None => false,
        Some(Value::Array(items)) if !expected.is_array() => {
            items.iter().any(|v| values_equal(v, expected))
        }
        Some(v) => values_equal(v, expected),
    }
}
