//! Query policy: the guardrail constants shared by the validator and executor.
//!
//! Built once at startup and handed around as `Arc<QueryPolicy>`.
//! Configuration is resolved in order: explicit values → environment variables → defaults.

use std::time::Duration;

use regex::{Regex, RegexBuilder};

/// Default maximum execution time per data-store read, in milliseconds.
const DEFAULT_MAX_EXECUTION_MS: u64 = 5000;
/// Default maximum rows returned by any operation.
const DEFAULT_MAX_RESULT_ROWS: usize = 1000;
/// Default maximum aggregation pipeline stages.
const DEFAULT_MAX_PIPELINE_STAGES: usize = 5;

/// Collections the planning engine may query.
pub const DEFAULT_COLLECTIONS: &[&str] = &["holdings", "trades"];

/// Read-only operations the planning engine may request.
pub const DEFAULT_OPERATIONS: &[&str] = &["find", "aggregate", "countDocuments", "distinct"];

/// Mutating and administrative verbs. Always rejected, whatever the allow-list says.
pub const BLOCKED_OPERATIONS: &[&str] = &[
    "insert",
    "insertOne",
    "insertMany",
    "update",
    "updateOne",
    "updateMany",
    "replaceOne",
    "delete",
    "deleteOne",
    "deleteMany",
    "findOneAndUpdate",
    "findOneAndReplace",
    "findOneAndDelete",
    "bulkWrite",
    "drop",
    "dropDatabase",
    "createCollection",
    "createIndex",
    "dropIndex",
    "dropIndexes",
    "renameCollection",
];

/// Patterns that indicate server-side code execution or writes from inside
/// a pipeline. Matched case-insensitively against the serialized query.
pub const DANGEROUS_PATTERNS: &[&str] = &[
    r"\$where",
    r"function\s*\(",
    r"eval\s*\(",
    r"\$function",
    r"\$accumulator",
    r"\$out\b",
    r"\$merge\b",
];

/// Immutable guardrail configuration.
#[derive(Debug, Clone)]
pub struct QueryPolicy {
    allowed_collections: Vec<String>,
    allowed_operations: Vec<String>,
    blocked_operations: Vec<String>,
    dangerous_patterns: Vec<Regex>,
    max_execution_time: Duration,
    max_result_rows: usize,
    max_pipeline_stages: usize,
}

impl Default for QueryPolicy {
    fn default() -> Self {
        QueryPolicyBuilder::default().build()
    }
}

impl QueryPolicy {
    /// Creates a new builder for `QueryPolicy`.
    #[must_use]
    pub fn builder() -> QueryPolicyBuilder {
        QueryPolicyBuilder::default()
    }

    /// Creates a policy from environment variables with defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::builder().from_env().build()
    }

    /// Allowed collection names.
    #[must_use]
    pub fn allowed_collections(&self) -> &[String] {
        &self.allowed_collections
    }

    /// Allowed operation names.
    #[must_use]
    pub fn allowed_operations(&self) -> &[String] {
        &self.allowed_operations
    }

    /// Returns `true` if the collection is allow-listed.
    #[must_use]
    pub fn allows_collection(&self, name: &str) -> bool {
        self.allowed_collections.iter().any(|c| c == name)
    }

    /// Returns `true` if the operation is allow-listed.
    #[must_use]
    pub fn allows_operation(&self, name: &str) -> bool {
        self.allowed_operations.iter().any(|o| o == name)
    }

    /// Returns `true` if the operation is block-listed (case-insensitive).
    #[must_use]
    pub fn blocks_operation(&self, name: &str) -> bool {
        self.blocked_operations
            .iter()
            .any(|b| b.eq_ignore_ascii_case(name))
    }

    /// Compiled dangerous-content patterns.
    #[must_use]
    pub fn dangerous_patterns(&self) -> &[Regex] {
        &self.dangerous_patterns
    }

    /// Wall-clock budget for a single data-store read.
    #[must_use]
    pub const fn max_execution_time(&self) -> Duration {
        self.max_execution_time
    }

    /// Maximum rows any operation may return.
    #[must_use]
    pub const fn max_result_rows(&self) -> usize {
        self.max_result_rows
    }

    /// Maximum aggregation pipeline stages.
    #[must_use]
    pub const fn max_pipeline_stages(&self) -> usize {
        self.max_pipeline_stages
    }
}

fn compile_pattern(source: &str) -> Option<Regex> {
    RegexBuilder::new(source).case_insensitive(true).build().ok()
}

fn compile_default_patterns() -> Vec<Regex> {
    DANGEROUS_PATTERNS
        .iter()
        .filter_map(|p| compile_pattern(p))
        .collect()
}

/// Builder for [`QueryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct QueryPolicyBuilder {
    allowed_collections: Option<Vec<String>>,
    allowed_operations: Option<Vec<String>>,
    extra_blocked: Vec<String>,
    extra_patterns: Vec<String>,
    max_execution_time: Option<Duration>,
    max_result_rows: Option<usize>,
    max_pipeline_stages: Option<usize>,
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl QueryPolicyBuilder {
    /// Populates unset fields from environment variables.
    #[must_use]
    pub fn from_env(mut self) -> Self {
        if self.allowed_collections.is_none() {
            self.allowed_collections = std::env::var("PQA_ALLOWED_COLLECTIONS")
                .ok()
                .map(|v| parse_list(&v))
                .filter(|v| !v.is_empty());
        }
        if self.max_execution_time.is_none() {
            self.max_execution_time = std::env::var("PQA_MAX_EXECUTION_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis);
        }
        if self.max_result_rows.is_none() {
            self.max_result_rows = std::env::var("PQA_MAX_RESULT_ROWS")
                .ok()
                .and_then(|v| v.parse().ok());
        }
        if self.max_pipeline_stages.is_none() {
            self.max_pipeline_stages = std::env::var("PQA_MAX_PIPELINE_STAGES")
                .ok()
                .and_then(|v| v.parse().ok());
        }
        self
    }

    /// Replaces the collection allow-list.
    #[must_use]
    pub fn allowed_collections<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_collections = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Replaces the operation allow-list.
    #[must_use]
    pub fn allowed_operations<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_operations = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Adds an operation to the block-list. The built-in verbs cannot be removed.
    #[must_use]
    pub fn block_operation(mut self, name: impl Into<String>) -> Self {
        self.extra_blocked.push(name.into());
        self
    }

    /// Adds a dangerous-content pattern. Invalid regexes are escaped and
    /// matched literally.
    #[must_use]
    pub fn dangerous_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.extra_patterns.push(pattern.into());
        self
    }

    /// Sets the maximum execution time per read.
    #[must_use]
    pub const fn max_execution_time(mut self, duration: Duration) -> Self {
        self.max_execution_time = Some(duration);
        self
    }

    /// Sets the maximum result rows.
    #[must_use]
    pub const fn max_result_rows(mut self, n: usize) -> Self {
        self.max_result_rows = Some(n);
        self
    }

    /// Sets the maximum pipeline stages.
    #[must_use]
    pub const fn max_pipeline_stages(mut self, n: usize) -> Self {
        self.max_pipeline_stages = Some(n);
        self
    }

    /// Builds the [`QueryPolicy`].
    #[must_use]
    pub fn build(self) -> QueryPolicy {
        let mut dangerous_patterns = compile_default_patterns();
        for extra in &self.extra_patterns {
            let compiled =
                compile_pattern(extra).or_else(|| compile_pattern(&regex::escape(extra)));
            if let Some(re) = compiled {
                dangerous_patterns.push(re);
            }
        }

        let mut blocked_operations: Vec<String> =
            BLOCKED_OPERATIONS.iter().map(|s| (*s).to_string()).collect();
        blocked_operations.extend(self.extra_blocked);

        QueryPolicy {
            allowed_collections: self.allowed_collections.unwrap_or_else(|| {
                DEFAULT_COLLECTIONS.iter().map(|s| (*s).to_string()).collect()
            }),
            allowed_operations: self.allowed_operations.unwrap_or_else(|| {
                DEFAULT_OPERATIONS.iter().map(|s| (*s).to_string()).collect()
            }),
            blocked_operations,
            dangerous_patterns,
            max_execution_time: self
                .max_execution_time
                .unwrap_or(Duration::from_millis(DEFAULT_MAX_EXECUTION_MS)),
            max_result_rows: self.max_result_rows.unwrap_or(DEFAULT_MAX_RESULT_ROWS).max(1),
            max_pipeline_stages: self
                .max_pipeline_stages
                .unwrap_or(DEFAULT_MAX_PIPELINE_STAGES),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = QueryPolicy::default();
        assert_eq!(policy.allowed_collections(), ["holdings", "trades"]);
        assert_eq!(policy.allowed_operations().len(), 4);
        assert_eq!(policy.max_result_rows(), DEFAULT_MAX_RESULT_ROWS);
        assert_eq!(policy.max_pipeline_stages(), DEFAULT_MAX_PIPELINE_STAGES);
        assert_eq!(
            policy.max_execution_time(),
            Duration::from_millis(DEFAULT_MAX_EXECUTION_MS)
        );
        assert_eq!(policy.dangerous_patterns().len(), DANGEROUS_PATTERNS.len());
    }

    #[test]
    fn test_block_list_is_case_insensitive() {
        let policy = QueryPolicy::default();
        assert!(policy.blocks_operation("drop"));
        assert!(policy.blocks_operation("DeleteMany"));
        assert!(!policy.blocks_operation("find"));
    }

    #[test]
    fn test_builder_cannot_unblock_builtins() {
        let policy = QueryPolicy::builder()
            .allowed_operations(["find", "drop"])
            .build();
        assert!(policy.allows_operation("drop"));
        assert!(policy.blocks_operation("drop"));
    }

    #[test]
    fn test_extra_pattern_invalid_regex_is_literal() {
        let policy = QueryPolicy::builder().dangerous_pattern("[oops").build();
        let last = policy
            .dangerous_patterns()
            .last()
            .map(|r| r.is_match("contains [OOPS here"));
        assert_eq!(last, Some(true));
    }

    #[test]
    fn test_result_rows_floor() {
        let policy = QueryPolicy::builder().max_result_rows(0).build();
        assert_eq!(policy.max_result_rows(), 1);
    }
}
