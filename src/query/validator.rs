//! Guardrail validator.
//!
//! Checks run in a fixed order and stop at the first violation:
//!
//! 1. collection allow-list
//! 2. operation block-list, then allow-list
//! 3. dangerous-pattern scan over the serialized query
//! 4. shape and complexity
//!
//! Passing all four yields a [`ValidatedQuery`], the only input the executor
//! accepts. No check touches the data store.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use super::invocation::{Operation, QueryBody, QueryOptions, ToolInvocation};
use crate::error::QueryError;
use crate::policy::QueryPolicy;

/// Complexity charged for single-filter operations, regardless of nesting.
const FILTER_COMPLEXITY: usize = 1;

/// An invocation that passed every guardrail check.
///
/// Can only be constructed by [`Validator::validate`].
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedQuery {
    collection: String,
    operation: Operation,
    body: QueryBody,
    options: QueryOptions,
    field: Option<String>,
    complexity: usize,
}

impl ValidatedQuery {
    /// Target collection.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Operation to run.
    #[must_use]
    pub const fn operation(&self) -> Operation {
        self.operation
    }

    /// Filter or pipeline.
    #[must_use]
    pub const fn body(&self) -> &QueryBody {
        &self.body
    }

    /// Find options as requested (limits are applied by the executor).
    #[must_use]
    pub const fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// Distinct field, if any.
    #[must_use]
    pub fn field(&self) -> Option<&str> {
        self.field.as_deref()
    }

    /// Estimated complexity.
    #[must_use]
    pub const fn complexity(&self) -> usize {
        self.complexity
    }
}

/// Pure policy checker.
#[derive(Debug, Clone)]
pub struct Validator {
    policy: Arc<QueryPolicy>,
}

impl Validator {
    /// Creates a validator bound to a policy.
    #[must_use]
    pub const fn new(policy: Arc<QueryPolicy>) -> Self {
        Self { policy }
    }

    /// Policy this validator enforces.
    #[must_use]
    pub fn policy(&self) -> &QueryPolicy {
        &self.policy
    }

    /// Validates an invocation.
    ///
    /// # Errors
    ///
    /// Returns the first [`QueryError`] violation found.
    pub fn validate(&self, invocation: &ToolInvocation) -> Result<ValidatedQuery, QueryError> {
        let result = self.check(invocation);
        match &result {
            Ok(v) => debug!(
                collection = v.collection,
                operation = %v.operation,
                complexity = v.complexity,
                "query passed guardrails"
            ),
            Err(e) => warn!(
                collection = invocation.collection,
                operation = invocation.operation,
                code = e.code(),
                error = %e,
                "query rejected by guardrails"
            ),
        }
        result
    }

    fn check(&self, invocation: &ToolInvocation) -> Result<ValidatedQuery, QueryError> {
        self.check_collection(&invocation.collection)?;
        let operation = self.check_operation(&invocation.operation)?;
        self.check_patterns(&invocation.query)?;

        let body = QueryBody::from_query(operation, &invocation.query)?;
        let complexity = estimate_complexity(&body);
        let max = self.policy.max_pipeline_stages();
        if complexity > max {
            return Err(QueryError::TooComplex { complexity, max });
        }

        Ok(ValidatedQuery {
            collection: invocation.collection.clone(),
            operation,
            body,
            options: invocation.options.clone(),
            field: invocation.field.clone(),
            complexity,
        })
    }

    fn check_collection(&self, collection: &str) -> Result<(), QueryError> {
        if self.policy.allows_collection(collection) {
            return Ok(());
        }
        Err(QueryError::InvalidCollection {
            collection: collection.to_string(),
            allowed: self.policy.allowed_collections().to_vec(),
        })
    }

    fn check_operation(&self, name: &str) -> Result<Operation, QueryError> {
        // Block-list wins over the allow-list.
        if self.policy.blocks_operation(name) {
            return Err(QueryError::BlockedOperation {
                operation: name.to_string(),
            });
        }
        let invalid = || QueryError::InvalidOperation {
            operation: name.to_string(),
            allowed: self.policy.allowed_operations().to_vec(),
        };
        if !self.policy.allows_operation(name) {
            return Err(invalid());
        }
        Operation::parse(name).ok_or_else(invalid)
    }

    fn check_patterns(&self, query: &Value) -> Result<(), QueryError> {
        let text = serde_json::to_string(query)
            .map_err(|e| QueryError::MalformedQuery {
                message: e.to_string(),
            })?;
        match self
            .policy
            .dangerous_patterns()
            .iter()
            .find(|re| re.is_match(&text))
        {
            Some(re) => Err(QueryError::DangerousPattern {
                pattern: re.as_str().to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Pipeline operations cost one unit per stage; filter operations cost a
/// constant.
fn estimate_complexity(body: &QueryBody) -> usize {
    body.stage_count().unwrap_or(FILTER_COMPLEXITY)
}
