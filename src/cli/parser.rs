//! Command-line argument parsing.
//!
//! Defines the CLI structure using clap derive macros.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// portfolio-qa: ask questions about portfolio holdings and trades.
///
/// Questions are answered by a planning engine that may only read the
/// data through validated, read-only queries.
#[derive(Parser, Debug)]
#[command(name = "portfolio-qa")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the database file.
    ///
    /// Defaults to `.pqa/portfolio.db` in the current directory.
    #[arg(short, long, env = "PQA_DB_PATH", global = true)]
    pub db_path: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Output format (text, json).
    #[arg(long, default_value = "text", global = true)]
    pub format: String,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize the database.
    ///
    /// Creates the database file and schema if they don't exist.
    #[command(after_help = r#"Examples:
  portfolio-qa init                    # Initialize in current directory
  portfolio-qa init --force            # Re-initialize (destroys existing data)
  portfolio-qa --db-path ./pf.db init  # Initialize with custom path
"#)]
    Init {
        /// Force re-initialization (destroys existing data).
        #[arg(short, long)]
        force: bool,
    },

    /// Show document and session counts.
    Status,

    /// Load the holdings and trades CSV exports.
    #[command(after_help = r#"Examples:
  portfolio-qa ingest --holdings holdings.csv --trades trades.csv
  portfolio-qa ingest --trades trades.csv --replace
"#)]
    Ingest {
        /// Holdings CSV export.
        #[arg(long)]
        holdings: Option<PathBuf>,

        /// Trades CSV export.
        #[arg(long)]
        trades: Option<PathBuf>,

        /// Clear each collection before loading it.
        #[arg(long)]
        replace: bool,
    },

    /// Ask a question about the portfolio.
    ///
    /// Requires an API key in `OPENAI_API_KEY` or `PQA_API_KEY`.
    #[command(after_help = r#"Examples:
  portfolio-qa ask "How many trades did we make in 2024?"
  portfolio-qa ask "Which portfolio had the most trades?" --new-session
  portfolio-qa ask "And the least?" --session 2f0c9d1e-...
  portfolio-qa --format json ask "Total P&L by fund" | jq '.queries'
"#)]
    Ask {
        /// The question.
        question: String,

        /// Continue an existing session.
        #[arg(short, long, conflicts_with = "new_session")]
        session: Option<String>,

        /// Start a new session and record this exchange in it.
        #[arg(long)]
        new_session: bool,
    },

    /// Run one query tool invocation without the planning engine.
    ///
    /// Takes the same JSON arguments the planning engine would send.
    #[command(after_help = r#"Examples:
  portfolio-qa query '{"collection":"trades","operation":"countDocuments","query":{"TradeTypeName":"Buy"}}'
  portfolio-qa query '{"collection":"holdings","operation":"distinct","field":"PortfolioName","query":{}}'
"#)]
    Query {
        /// Tool arguments as JSON.
        json: String,
    },

    /// Check tool arguments against the guardrails without running them.
    #[command(after_help = r#"Examples:
  portfolio-qa validate '{"collection":"trades","operation":"drop","query":{}}'
"#)]
    Validate {
        /// Tool arguments as JSON.
        json: String,
    },

    /// Chat session management.
    #[command(subcommand)]
    Session(SessionCommands),
}

/// Session subcommands.
#[derive(Subcommand, Debug)]
pub enum SessionCommands {
    /// List sessions, most recent first.
    List,

    /// Show a session's turns.
    Show {
        /// Session ID.
        id: String,
    },

    /// Delete a session.
    Delete {
        /// Session ID.
        id: String,
    },
}

impl Cli {
    /// Returns the database path, using default if not specified.
    #[must_use]
    pub fn get_db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(crate::storage::DEFAULT_DB_PATH))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parse() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_db_path() {
        let cli = Cli {
            db_path: None,
            verbose: 0,
            format: "text".to_string(),
            command: Commands::Status,
        };
        assert_eq!(
            cli.get_db_path(),
            PathBuf::from(crate::storage::DEFAULT_DB_PATH)
        );
    }

    #[test]
    fn test_verbosity_counts() {
        let cli = Cli::try_parse_from(["portfolio-qa", "-vv", "status"]);
        assert_eq!(cli.map(|c| c.verbose).ok(), Some(2));
    }

    #[test]
    fn test_ask_session_flags_conflict() {
        let result = Cli::try_parse_from([
            "portfolio-qa",
            "ask",
            "question",
            "--session",
            "abc",
            "--new-session",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_session_subcommands() {
        let cli = Cli::try_parse_from(["portfolio-qa", "session", "show", "abc"]);
        assert!(matches!(
            cli.map(|c| c.command),
            Ok(Commands::Session(SessionCommands::Show { ref id })) if id == "abc"
        ));
    }
}
