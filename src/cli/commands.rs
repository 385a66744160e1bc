//! CLI command implementations.
//!
//! Contains the business logic for each CLI command.

use std::path::Path;
use std::sync::Arc;

use crate::agent::{
    AgentConfig, FinalAnswer, HistoryTurn, LlmProvider, Orchestrator, create_provider,
};
use crate::cli::output::{
    OutputFormat, format_answer, format_execution, format_ingest, format_sessions,
    format_status, format_turns, format_validation,
};
use crate::cli::parser::{Cli, Commands, SessionCommands};
use crate::error::{CommandError, Result, StorageError};
use crate::ingest::ingest;
use crate::policy::QueryPolicy;
use crate::query::{QueryExecutor, ToolInvocation, ValidatedQuery, Validator};
use crate::storage::{DataStore, SessionStore, SqliteStorage, StoredTurn};

/// Session handling for the `ask` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode<'a> {
    /// Do not record the exchange.
    Off,
    /// Start a new session.
    New,
    /// Continue the given session.
    Continue(&'a str),
}

/// Executes the CLI command.
///
/// # Arguments
///
/// * `cli` - Parsed CLI arguments.
///
/// # Returns
///
/// Result with output string on success.
///
/// # Errors
///
/// Returns an error if the command fails to execute.
pub fn execute(cli: &Cli) -> Result<String> {
    let format = OutputFormat::parse(&cli.format);
    let db_path = cli.get_db_path();

    match &cli.command {
        Commands::Init { force } => cmd_init(&db_path, *force, format),
        Commands::Status => cmd_status(&db_path, format),
        Commands::Ingest {
            holdings,
            trades,
            replace,
        } => cmd_ingest(
            &db_path,
            holdings.as_deref(),
            trades.as_deref(),
            *replace,
            format,
        ),
        Commands::Ask {
            question,
            session,
            new_session,
        } => {
            let mode = match (session.as_deref(), *new_session) {
                (Some(id), _) => SessionMode::Continue(id),
                (None, true) => SessionMode::New,
                (None, false) => SessionMode::Off,
            };
            cmd_ask(&db_path, question, mode, format)
        }
        Commands::Query { json } => cmd_query(&db_path, json, format),
        Commands::Validate { json } => cmd_validate(json, format),
        Commands::Session(sub) => execute_session(sub, &db_path, format),
    }
}

fn execute_session(
    sub: &SessionCommands,
    db_path: &Path,
    format: OutputFormat,
) -> Result<String> {
    match sub {
        SessionCommands::List => cmd_session_list(db_path, format),
        SessionCommands::Show { id } => cmd_session_show(db_path, id, format),
        SessionCommands::Delete { id } => cmd_session_delete(db_path, id, format),
    }
}

/// Opens storage and ensures it's initialized.
fn open_storage(db_path: &Path) -> Result<SqliteStorage> {
    let storage = SqliteStorage::open(db_path)?;

    if !storage.is_initialized()? {
        return Err(StorageError::NotInitialized.into());
    }

    Ok(storage)
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().map_err(|e| {
        CommandError::ExecutionFailed(format!("Failed to create async runtime: {e}")).into()
    })
}

fn parse_invocation(json: &str) -> Result<ToolInvocation> {
    ToolInvocation::from_arguments(json)
        .map_err(|e| CommandError::InvalidInput(e.to_string()).into())
}

// ==================== Command Implementations ====================

fn cmd_init(db_path: &Path, force: bool, format: OutputFormat) -> Result<String> {
    if db_path.exists() && !force {
        return Err(CommandError::ExecutionFailed(
            "Database already exists. Use --force to reinitialize.".to_string(),
        )
        .into());
    }

    let storage = SqliteStorage::open(db_path)?;
    if force {
        storage.reset()?;
    } else {
        storage.init()?;
    }

    match format {
        OutputFormat::Text => Ok(format!(
            "Initialized portfolio-qa database at: {}\n",
            db_path.display()
        )),
        OutputFormat::Json => Ok(format.to_json(&serde_json::json!({
            "success": true,
            "path": db_path.to_string_lossy(),
            "force": force
        }))),
    }
}

fn cmd_status(db_path: &Path, format: OutputFormat) -> Result<String> {
    let storage = open_storage(db_path)?;
    let stats = storage.stats()?;
    Ok(format_status(&stats, format))
}

fn cmd_ingest(
    db_path: &Path,
    holdings: Option<&Path>,
    trades: Option<&Path>,
    replace: bool,
    format: OutputFormat,
) -> Result<String> {
    if holdings.is_none() && trades.is_none() {
        return Err(CommandError::InvalidInput(
            "nothing to ingest: pass --holdings and/or --trades".to_string(),
        )
        .into());
    }
    let storage = open_storage(db_path)?;
    let report = ingest(&storage, holdings, trades, replace)?;
    Ok(format_ingest(&report, format))
}

fn cmd_ask(
    db_path: &Path,
    question: &str,
    mode: SessionMode<'_>,
    format: OutputFormat,
) -> Result<String> {
    let storage = Arc::new(open_storage(db_path)?);
    let config = AgentConfig::from_env()?;
    let provider: Arc<dyn LlmProvider> = Arc::from(create_provider(&config)?);
    let store: Arc<dyn DataStore> = Arc::clone(&storage) as Arc<dyn DataStore>;
    let policy = Arc::new(QueryPolicy::from_env());
    let orchestrator = Orchestrator::new(provider, &config, store, policy);

    let rt = runtime()?;
    let (answer, session) =
        rt.block_on(answer_question(&storage, &orchestrator, question, mode))?;
    Ok(format_answer(&answer, session.as_deref(), format))
}

/// Answers one question, replaying and recording the session when asked.
///
/// Returns the answer and the session it was recorded in.
///
/// # Errors
///
/// Returns an error for unknown sessions, rejected questions, or storage
/// failures while recording.
pub async fn answer_question(
    storage: &SqliteStorage,
    orchestrator: &Orchestrator,
    question: &str,
    mode: SessionMode<'_>,
) -> Result<(FinalAnswer, Option<String>)> {
    let history: Vec<HistoryTurn> = match mode {
        SessionMode::Continue(id) => storage
            .load_turns(id)?
            .iter()
            .map(HistoryTurn::from)
            .collect(),
        SessionMode::Off | SessionMode::New => Vec::new(),
    };

    let answer = orchestrator.process(question, &history).await?;

    let session = match mode {
        SessionMode::Off => None,
        SessionMode::New => Some(storage.create_session()?),
        SessionMode::Continue(id) => Some(id.to_string()),
    };
    if let Some(id) = &session {
        let queries = serde_json::to_value(&answer.queries).map_err(StorageError::from)?;
        storage.append_turns(
            id,
            &[
                StoredTurn::now("user", question),
                StoredTurn::now("assistant", answer.answer.clone()).with_queries(queries),
            ],
        )?;
    }

    Ok((answer, session))
}

fn cmd_query(db_path: &Path, json: &str, format: OutputFormat) -> Result<String> {
    let invocation = parse_invocation(json)?;
    let policy = Arc::new(QueryPolicy::from_env());
    let validator = Validator::new(Arc::clone(&policy));
    let validated = match validator.validate(&invocation) {
        Ok(v) => v,
        Err(e) => {
            let result = crate::query::ExecutionResult::failure(None, e);
            return Ok(format_execution(&result, format));
        }
    };

    let storage: Arc<dyn DataStore> = Arc::new(open_storage(db_path)?);
    let executor = QueryExecutor::new(storage, policy);
    let rt = runtime()?;
    let result = rt.block_on(executor.execute(&validated));
    Ok(format_execution(&result, format))
}

fn cmd_validate(json: &str, format: OutputFormat) -> Result<String> {
    let invocation = parse_invocation(json)?;
    let validator = Validator::new(Arc::new(QueryPolicy::from_env()));
    let verdict = validator.validate(&invocation);
    Ok(format_validation(
        verdict.as_ref().map(ValidatedQuery::complexity),
        format,
    ))
}

fn cmd_session_list(db_path: &Path, format: OutputFormat) -> Result<String> {
    let storage = open_storage(db_path)?;
    let sessions = storage.list_sessions()?;
    Ok(format_sessions(&sessions, format))
}

fn cmd_session_show(db_path: &Path, id: &str, format: OutputFormat) -> Result<String> {
    let storage = open_storage(db_path)?;
    let turns = storage.load_turns(id)?;
    Ok(format_turns(id, &turns, format))
}

fn cmd_session_delete(db_path: &Path, id: &str, format: OutputFormat) -> Result<String> {
    let storage = open_storage(db_path)?;
    storage.delete_session(id)?;
    match format {
        OutputFormat::Text => Ok(format!("Deleted session {id}\n")),
        OutputFormat::Json => Ok(format.to_json(&serde_json::json!({
            "success": true,
            "deleted": id
        }))),
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::agent::agentic_loop::tests::{ScriptedProvider, text_turn, tool_turn};
    use serde_json::{Value, json};
    use tempfile::TempDir;

    fn setup() -> (TempDir, std::path::PathBuf) {
        let temp_dir = TempDir::new().unwrap_or_else(|e| panic!("tempdir failed: {e}"));
        let db_path = temp_dir.path().join("test.db");
        (temp_dir, db_path)
    }

    fn seeded(db_path: &Path) -> SqliteStorage {
        cmd_init(db_path, false, OutputFormat::Text)
            .unwrap_or_else(|e| panic!("init failed: {e}"));
        let storage = open_storage(db_path).unwrap_or_else(|e| panic!("open failed: {e}"));
        storage
            .insert_documents(
                "trades",
                &[
                    json!({"TradeTypeName": "Buy", "PortfolioName": "Alpha"}),
                    json!({"TradeTypeName": "Sell", "PortfolioName": "Beta"}),
                    json!({"TradeTypeName": "Buy", "PortfolioName": "Alpha"}),
                ],
            )
            .unwrap_or_else(|e| panic!("insert failed: {e}"));
        storage
    }

    fn orchestrator(storage: &Arc<SqliteStorage>, provider: Arc<ScriptedProvider>) -> Orchestrator {
        let config = AgentConfig::builder()
            .api_key("test")
            .build()
            .unwrap_or_else(|e| panic!("config failed: {e}"));
        let store: Arc<dyn DataStore> = Arc::clone(storage) as Arc<dyn DataStore>;
        Orchestrator::new(provider, &config, store, Arc::new(QueryPolicy::default()))
            .with_system_prompt("test prompt")
    }

    #[test]
    fn test_cmd_init() {
        let (_temp_dir, db_path) = setup();
        assert!(cmd_init(&db_path, false, OutputFormat::Text).is_ok());
        assert!(db_path.exists());
    }

    #[test]
    fn test_cmd_init_already_exists() {
        let (_temp_dir, db_path) = setup();
        let storage = seeded(&db_path);
        drop(storage);

        assert!(cmd_init(&db_path, false, OutputFormat::Text).is_err());
        assert!(cmd_init(&db_path, true, OutputFormat::Text).is_ok());

        let stats = open_storage(&db_path)
            .and_then(|s| Ok(s.stats()?))
            .unwrap_or_else(|e| panic!("stats failed: {e}"));
        assert_eq!(stats.document_count(), 0);
    }

    #[test]
    fn test_status_requires_init() {
        let (_temp_dir, db_path) = setup();
        assert!(cmd_status(&db_path, OutputFormat::Text).is_err());
    }

    #[test]
    fn test_ingest_requires_a_path() {
        let (_temp_dir, db_path) = setup();
        let result = cmd_ingest(&db_path, None, None, false, OutputFormat::Text);
        assert!(matches!(
            result,
            Err(crate::error::Error::Command(CommandError::InvalidInput(_)))
        ));
    }

    #[test]
    fn test_cmd_query_counts() {
        let (_temp_dir, db_path) = setup();
        drop(seeded(&db_path));
        let out = cmd_query(
            &db_path,
            r#"{"collection":"trades","operation":"countDocuments","query":{"TradeTypeName":"Buy"}}"#,
            OutputFormat::Json,
        )
        .unwrap_or_else(|e| panic!("query failed: {e}"));
        let payload: Value =
            serde_json::from_str(&out).unwrap_or_else(|e| panic!("invalid JSON: {e}"));
        assert_eq!(payload["success"], true);
        assert_eq!(payload["count"], 2);
    }

    #[test]
    fn test_cmd_query_rejection_needs_no_database() {
        let (_temp_dir, db_path) = setup();
        let out = cmd_query(
            &db_path,
            r#"{"collection":"users","operation":"find","query":{}}"#,
            OutputFormat::Json,
        )
        .unwrap_or_else(|e| panic!("query failed: {e}"));
        let payload: Value =
            serde_json::from_str(&out).unwrap_or_else(|e| panic!("invalid JSON: {e}"));
        assert_eq!(payload["code"], "InvalidCollection");
        assert!(!db_path.exists());
    }

    #[test]
    fn test_cmd_validate() {
        let ok = cmd_validate(
            r#"{"collection":"trades","operation":"find","query":{}}"#,
            OutputFormat::Text,
        );
        assert_eq!(ok.ok().as_deref(), Some("ok\n"));

        let blocked = cmd_validate(
            r#"{"collection":"trades","operation":"drop","query":{}}"#,
            OutputFormat::Text,
        )
        .unwrap_or_default();
        assert!(blocked.starts_with("BlockedOperation"));

        assert!(cmd_validate("not json", OutputFormat::Text).is_err());
    }

    #[tokio::test]
    async fn test_answer_records_new_session() {
        let (_temp_dir, db_path) = setup();
        let storage = Arc::new(seeded(&db_path));
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_turn(&[(
                "execute_query",
                r#"{"collection":"trades","operation":"countDocuments","query":{}}"#,
            )]),
            text_turn("There are 3 trades."),
        ]));
        let orch = orchestrator(&storage, Arc::clone(&provider));

        let (answer, session) = answer_question(&storage, &orch, "How many trades?", SessionMode::New)
            .await
            .unwrap_or_else(|e| panic!("ask failed: {e}"));
        assert_eq!(answer.answer, "There are 3 trades.");
        let id = session.unwrap_or_else(|| panic!("no session recorded"));

        let turns = storage
            .load_turns(&id)
            .unwrap_or_else(|e| panic!("load failed: {e}"));
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, "user");
        assert_eq!(turns[1].role, "assistant");
        let queries = turns[1].query_used.clone().unwrap_or_default();
        assert_eq!(queries[0]["count"], 3);
    }

    #[tokio::test]
    async fn test_answer_replays_prior_turns() {
        let (_temp_dir, db_path) = setup();
        let storage = Arc::new(seeded(&db_path));
        let id = storage
            .create_session()
            .unwrap_or_else(|e| panic!("create failed: {e}"));
        storage
            .append_turns(
                &id,
                &[
                    StoredTurn::now("user", "How many trades?"),
                    StoredTurn::now("assistant", "3"),
                ],
            )
            .unwrap_or_else(|e| panic!("append failed: {e}"));

        let provider = Arc::new(ScriptedProvider::new(vec![text_turn("2 of them are buys.")]));
        let orch = orchestrator(&storage, Arc::clone(&provider));
        answer_question(&storage, &orch, "How many buys?", SessionMode::Continue(&id))
            .await
            .unwrap_or_else(|e| panic!("ask failed: {e}"));

        let first = provider
            .first_request
            .lock()
            .map(|m| m.len())
            .unwrap_or_default();
        // system + two prior turns + question
        assert_eq!(first, 4);
        let turns = storage
            .load_turns(&id)
            .unwrap_or_else(|e| panic!("load failed: {e}"));
        assert_eq!(turns.len(), 4);
    }

    #[tokio::test]
    async fn test_answer_unknown_session() {
        let (_temp_dir, db_path) = setup();
        let storage = Arc::new(seeded(&db_path));
        let provider = Arc::new(ScriptedProvider::new(vec![text_turn("unused")]));
        let orch = orchestrator(&storage, Arc::clone(&provider));

        let result =
            answer_question(&storage, &orch, "hi", SessionMode::Continue("missing")).await;
        assert!(result.is_err());
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_rejected_question_creates_no_session() {
        let (_temp_dir, db_path) = setup();
        let storage = Arc::new(seeded(&db_path));
        let provider = Arc::new(ScriptedProvider::new(vec![text_turn("unused")]));
        let orch = orchestrator(&storage, Arc::clone(&provider));

        let result = answer_question(&storage, &orch, "   ", SessionMode::New).await;
        assert!(result.is_err());
        let sessions = storage
            .list_sessions()
            .unwrap_or_else(|e| panic!("list failed: {e}"));
        assert!(sessions.is_empty());
    }
}
