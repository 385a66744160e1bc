//! Query guardrails and execution.
//!
//! Tool invocations from the planning engine are decoded into a
//! [`ToolInvocation`], checked by the [`Validator`], and run by the
//! [`QueryExecutor`] against a read-only data store. The executor evaluates a
//! read-only subset of the document query language in process.

pub mod executor;
pub mod expr;
pub mod filter;
pub mod invocation;
pub mod pipeline;
pub mod validator;
pub mod value;

pub use executor::{ExecutionResult, Plan, QueryExecutor, QueryInfo};
pub use filter::Filter;
pub use invocation::{
    MAX_TOOL_ARGS_LEN, Operation, QueryBody, QueryOptions, SortKey, ToolInvocation,
};
pub use pipeline::{Pipeline, Projection, Stage};
pub use validator::{ValidatedQuery, Validator};
