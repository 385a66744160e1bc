//! Document storage.
//!
//! [`DataStore`] is the read-only view the query executor holds. It has no
//! write methods; ingestion and session persistence go through the concrete
//! [`SqliteStorage`] type instead.

pub mod session;
mod sqlite;

use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

pub use session::{SessionStore, SessionSummary, StoredTurn};
pub use sqlite::{DEFAULT_READ_POOL_SIZE, SqliteStorage};

use crate::error::StorageError;

/// Default database location, relative to the working directory.
pub const DEFAULT_DB_PATH: &str = ".pqa/portfolio.db";

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Wall-clock budget for one read.
///
/// Checked by the SQLite progress handler while rows stream out of the
/// database, and by the in-process evaluator between documents.
#[derive(Debug, Clone, Copy)]
pub struct ReadBudget {
    deadline: Instant,
    limit: Duration,
}

impl ReadBudget {
    /// Starts a budget of `limit` from now.
    #[must_use]
    pub fn new(limit: Duration) -> Self {
        Self {
            deadline: Instant::now() + limit,
            limit,
        }
    }

    /// Returns `true` once the deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Errors once the deadline has passed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::TimeLimitExceeded`].
    pub fn check(&self) -> Result<(), StorageError> {
        if self.is_expired() {
            return Err(self.exceeded());
        }
        Ok(())
    }

    /// The error reported when this budget runs out.
    #[must_use]
    pub fn exceeded(&self) -> StorageError {
        StorageError::TimeLimitExceeded {
            limit_ms: u64::try_from(self.limit.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Read-only access to named document collections.
pub trait DataStore: Send + Sync {
    /// Names of collections that currently hold documents.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn collections(&self) -> Result<Vec<String>, StorageError>;

    /// Returns every document in `collection`, in insertion order.
    ///
    /// An unknown collection yields an empty vector.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::TimeLimitExceeded`] if `budget` runs out, or
    /// any underlying read failure.
    fn scan(&self, collection: &str, budget: &ReadBudget) -> Result<Vec<Value>, StorageError>;
}

/// Document and session counts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageStats {
    /// Documents per collection.
    pub collections: Vec<(String, usize)>,
    /// Stored chat sessions.
    pub session_count: usize,
    /// Stored chat turns.
    pub message_count: usize,
    /// Schema version.
    pub schema_version: Option<u32>,
    /// Database file size in bytes (absent for in-memory stores).
    pub db_size: Option<u64>,
}

impl StorageStats {
    /// Total documents across collections.
    #[must_use]
    pub fn document_count(&self) -> usize {
        self.collections.iter().map(|(_, n)| n).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_budget_expiry() {
        let budget = ReadBudget::new(Duration::ZERO);
        assert!(budget.is_expired());
        assert!(matches!(
            budget.check(),
            Err(StorageError::TimeLimitExceeded { limit_ms: 0 })
        ));

        let budget = ReadBudget::new(Duration::from_secs(60));
        assert!(budget.check().is_ok());
    }

    #[test]
    fn test_exceeded_message() {
        let budget = ReadBudget::new(Duration::from_millis(250));
        assert_eq!(
            budget.exceeded().to_string(),
            "operation exceeded time limit of 250 ms"
        );
    }
}
