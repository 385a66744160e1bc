//! # portfolio-qa
//!
//! Natural-language question answering over portfolio holdings and trades.
//!
//! A planning engine (an LLM) answers questions by calling a single
//! `execute_query` tool. Every call is checked by a guardrail
//! [`Validator`](query::Validator) against a [`QueryPolicy`] before the
//! [`QueryExecutor`](query::QueryExecutor) reads from a read-only
//! [`DataStore`](storage::DataStore).
//!
//! ## Modules
//!
//! - [`policy`]: allow-lists, block-lists and execution limits
//! - [`query`]: tool invocations, validation and in-process evaluation
//! - [`agent`]: planning-engine providers and the tool-call orchestrator
//! - [`storage`]: `SQLite` document and session storage
//! - [`ingest`]: CSV export loading
//! - [`cli`]: command-line interface

pub mod agent;
pub mod cli;
pub mod error;
pub mod ingest;
pub mod policy;
pub mod query;
pub mod storage;

pub use error::{AgentError, CommandError, Error, IngestError, QueryError, Result, StorageError};
pub use policy::QueryPolicy;
pub use query::{ExecutionResult, QueryExecutor, ToolInvocation, ValidatedQuery, Validator};
pub use storage::{DataStore, SessionStore, SqliteStorage};
