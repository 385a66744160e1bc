//! CLI layer for portfolio-qa.
//!
//! Provides the command-line interface using clap, with commands for
//! initializing the database, loading exports, asking questions, running
//! queries directly, and managing chat sessions.

pub mod commands;
pub mod output;
pub mod parser;

pub use commands::{SessionMode, answer_question, execute};
pub use output::OutputFormat;
pub use parser::{Cli, Commands, SessionCommands};
