//! Error types for portfolio-qa.
//!
//! Each layer owns a `thiserror` enum; [`Error`] wraps them for callers
//! that cross layers (the CLI). Guardrail and execution failures carry a
//! stable reason code so they can be fed back to the planning engine.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage layer failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Query validation or execution failure.
    #[error(transparent)]
    Query(#[from] QueryError),

    /// Agent / planning engine failure.
    #[error(transparent)]
    Agent(#[from] AgentError),

    /// CLI command failure.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// CSV ingestion failure.
    #[error(transparent)]
    Ingest(#[from] IngestError),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reason-coded failures raised by the guardrail validator and the query
/// executor.
///
/// None of these are fatal to a conversation: the orchestrator serializes
/// them into a tool-result turn so the model can correct itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// Target collection is not in the allow-list.
    #[error("Invalid collection: {collection}. Allowed collections: {}", allowed.join(", "))]
    InvalidCollection {
        /// Requested collection.
        collection: String,
        /// Allowed collection names.
        allowed: Vec<String>,
    },

    /// Operation is not in the read-only allow-list.
    #[error("Invalid operation: {operation}. Allowed operations: {}", allowed.join(", "))]
    InvalidOperation {
        /// Requested operation.
        operation: String,
        /// Allowed operation names.
        allowed: Vec<String>,
    },

    /// Operation is a mutating or administrative verb.
    #[error("Blocked operation: {operation}")]
    BlockedOperation {
        /// Requested operation.
        operation: String,
    },

    /// Query text matched a forbidden pattern.
    #[error("Query contains dangerous pattern: {pattern}")]
    DangerousPattern {
        /// Source of the matching pattern.
        pattern: String,
    },

    /// Estimated complexity exceeds the configured ceiling.
    #[error("Query too complex. Maximum {max} stages allowed, got {complexity}")]
    TooComplex {
        /// Estimated complexity.
        complexity: usize,
        /// Configured ceiling.
        max: usize,
    },

    /// Query value does not fit the operation's shape.
    #[error("Malformed query: {message}")]
    MalformedQuery {
        /// What was wrong.
        message: String,
    },

    /// A pipeline stage could not be parsed into an object.
    #[error("Pipeline stage {index} is malformed: {message}")]
    MalformedStage {
        /// Zero-based stage index.
        index: usize,
        /// What was wrong.
        message: String,
    },

    /// `distinct` was requested without a field name.
    #[error("Field name required for {operation} operation")]
    MissingField {
        /// Operation that needed the field.
        operation: String,
    },

    /// The data store read failed.
    #[error("Query execution failed: {message}")]
    ExecutionFailure {
        /// Underlying failure.
        message: String,
    },
}

impl QueryError {
    /// Stable reason code reported to the planning engine.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidCollection { .. } => "InvalidCollection",
            Self::InvalidOperation { .. } => "InvalidOperation",
            Self::BlockedOperation { .. } => "BlockedOperation",
            Self::DangerousPattern { .. } => "DangerousPattern",
            Self::TooComplex { .. } => "TooComplex",
            Self::MalformedQuery { .. } => "MalformedQuery",
            Self::MalformedStage { .. } => "MalformedStage",
            Self::MissingField { .. } => "MissingField",
            Self::ExecutionFailure { .. } => "ExecutionFailure",
        }
    }

    /// Returns `true` for failures raised before any data-store access.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        !matches!(self, Self::ExecutionFailure { .. })
    }

    pub(crate) fn execution(message: impl Into<String>) -> Self {
        Self::ExecutionFailure {
            message: message.into(),
        }
    }
}

impl From<StorageError> for QueryError {
    fn from(e: StorageError) -> Self {
        Self::execution(e.to_string())
    }
}

/// Errors from the agent layer.
#[derive(Debug, Error)]
pub enum AgentError {
    /// No API key configured.
    #[error("API key missing: set OPENAI_API_KEY or PQA_API_KEY")]
    ApiKeyMissing,

    /// Provider name has no implementation.
    #[error("unsupported provider: {name}")]
    UnsupportedProvider {
        /// Requested provider.
        name: String,
    },

    /// Provider API request failed.
    #[error("API request failed: {message}")]
    ApiRequest {
        /// Provider error text.
        message: String,
        /// HTTP status, when known.
        status: Option<u16>,
    },

    /// The planning engine errored or was unreachable.
    #[error("planning engine unavailable: {message}")]
    PlannerUnavailable {
        /// Underlying failure.
        message: String,
    },

    /// The planning engine did not answer within the request timeout.
    #[error("planning engine timed out after {timeout_secs}s")]
    PlannerTimeout {
        /// Timeout that elapsed.
        timeout_secs: u64,
    },

    /// The model named a tool that is not in the dispatch table.
    #[error("Unknown tool {name}")]
    UnknownTool {
        /// Tool name from the model.
        name: String,
    },

    /// Tool arguments could not be decoded.
    #[error("invalid arguments for tool {name}: {message}")]
    ToolArguments {
        /// Tool name.
        name: String,
        /// Decoding failure.
        message: String,
    },

    /// The model kept requesting tools past the turn budget.
    #[error("tool-call turn budget exhausted after {max_turns} turns")]
    MaxTurnsExceeded {
        /// Configured budget.
        max_turns: usize,
    },

    /// Orchestration precondition failed (empty query, etc.).
    #[error("orchestration error: {message}")]
    Orchestration {
        /// What went wrong.
        message: String,
    },
}

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// SQLite failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Stored document could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Read pool could not hand out a connection.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// The writer lock was poisoned by a panicking holder.
    #[error("writer lock poisoned")]
    LockPoisoned,

    /// Schema has not been created.
    #[error("database not initialized. Run `portfolio-qa init` first.")]
    NotInitialized,

    /// Read exceeded its wall-clock budget.
    #[error("operation exceeded time limit of {limit_ms} ms")]
    TimeLimitExceeded {
        /// Budget in milliseconds.
        limit_ms: u64,
    },

    /// Record lookup failed.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record.
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// Filesystem failure while preparing the database path.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from CSV ingestion.
#[derive(Debug, Error)]
pub enum IngestError {
    /// CSV reader failure.
    #[error("CSV error in {path}: {source}")]
    Csv {
        /// File being read.
        path: String,
        /// Reader error.
        #[source]
        source: csv::Error,
    },

    /// Storage failure while inserting.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors raised by CLI commands.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Command could not run.
    #[error("{0}")]
    ExecutionFailed(String),

    /// Input could not be parsed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Output could not be rendered.
    #[error("output error: {0}")]
    OutputFormat(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes_match_variant_names() {
        let err = QueryError::BlockedOperation {
            operation: "drop".to_string(),
        };
        assert_eq!(err.code(), "BlockedOperation");
        assert!(err.is_validation());

        let err = QueryError::execution("boom");
        assert_eq!(err.code(), "ExecutionFailure");
        assert!(!err.is_validation());
    }

    #[test]
    fn test_invalid_collection_message_lists_allowed() {
        let err = QueryError::InvalidCollection {
            collection: "users".to_string(),
            allowed: vec!["holdings".to_string(), "trades".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Invalid collection: users. Allowed collections: holdings, trades"
        );
    }

    #[test]
    fn test_unknown_tool_message() {
        let err = AgentError::UnknownTool {
            name: "drop_table".to_string(),
        };
        assert_eq!(err.to_string(), "Unknown tool drop_table");
    }
}
