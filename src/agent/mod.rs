//! Planning-engine integration for portfolio-qa.
//!
//! Turns a natural-language question into guarded, read-only queries. The
//! planning engine sees one tool; every call it makes passes through the
//! validator before the executor reads anything.
//!
//! # Architecture
//!
//! ```text
//! User question → Orchestrator
//!   ├── seed: system prompt + normalized prior turns + question
//!   └── agentic_loop (≤ max turns)
//!       ├── LlmProvider::chat
//!       ├── text → FinalAnswer
//!       └── tool calls → ToolExecutor (concurrent, results in order)
//!           └── ToolInvocation → Validator → QueryExecutor → payload
//! ```

pub mod agentic_loop;
pub mod client;
pub mod config;
pub mod executor;
pub mod message;
pub mod orchestrator;
pub mod prompt;
pub mod provider;
pub mod providers;
pub mod tool;

// Re-export key types
pub use agentic_loop::{LoopOutcome, agentic_loop};
pub use client::create_provider;
pub use config::AgentConfig;
pub use executor::{IssuedQuery, ToolExecutor, ToolKind, ToolOutcome};
pub use message::{ChatMessage, ChatRequest, ChatResponse, HistoryTurn, Role, TokenUsage};
pub use orchestrator::{AnswerStatus, FinalAnswer, Orchestrator};
pub use provider::LlmProvider;
pub use tool::{QUERY_TOOL_NAME, ToolCall, ToolDefinition, ToolResult, ToolSet};
