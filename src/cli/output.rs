//! Output formatting for CLI commands.
//!
//! Every command renders either human-readable text or a JSON document.

#![allow(clippy::format_push_string)]

use std::fmt::Write as _;

use serde::Serialize;
use serde_json::Value;

use crate::agent::FinalAnswer;
use crate::error::QueryError;
use crate::ingest::IngestReport;
use crate::query::ExecutionResult;
use crate::storage::{SessionSummary, StorageStats, StoredTurn};

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Human-readable text.
    #[default]
    Text,
    /// Pretty-printed JSON.
    Json,
}

impl OutputFormat {
    /// Parses a format name; anything other than `json` is text.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Text
        }
    }

    /// Serializes a value as a JSON document followed by a newline.
    #[must_use]
    pub fn to_json<T: Serialize + ?Sized>(self, value: &T) -> String {
        let mut out = serde_json::to_string_pretty(value)
            .unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() }).to_string());
        out.push('\n');
        out
    }
}

fn format_bytes(n: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    #[allow(clippy::cast_precision_loss)]
    let mut size = n as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{n} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

/// Formats database statistics.
#[must_use]
pub fn format_status(stats: &StorageStats, format: OutputFormat) -> String {
    match format {
        OutputFormat::Text => {
            let mut out = String::from("portfolio-qa status\n");
            if let Some(v) = stats.schema_version {
                out.push_str(&format!("  Schema version: {v}\n"));
            }
            if let Some(size) = stats.db_size {
                out.push_str(&format!("  Database size:  {}\n", format_bytes(size)));
            }
            out.push_str(&format!("  Documents:      {}\n", stats.document_count()));
            for (collection, n) in &stats.collections {
                out.push_str(&format!("    {collection}: {n}\n"));
            }
            out.push_str(&format!("  Sessions:       {}\n", stats.session_count));
            out.push_str(&format!("  Messages:       {}\n", stats.message_count));
            out
        }
        OutputFormat::Json => {
            let collections: serde_json::Map<String, Value> = stats
                .collections
                .iter()
                .map(|(name, n)| (name.clone(), Value::from(*n)))
                .collect();
            format.to_json(&serde_json::json!({
                "schema_version": stats.schema_version,
                "db_size": stats.db_size,
                "document_count": stats.document_count(),
                "collections": collections,
                "session_count": stats.session_count,
                "message_count": stats.message_count,
            }))
        }
    }
}

/// Formats an ingestion report.
#[must_use]
pub fn format_ingest(report: &IngestReport, format: OutputFormat) -> String {
    match format {
        OutputFormat::Text => format!(
            "Ingested {} holdings and {} trades\n",
            report.holdings, report.trades
        ),
        OutputFormat::Json => format.to_json(report),
    }
}

/// Formats a query tool payload. Text output is the payload itself.
#[must_use]
pub fn format_execution(result: &ExecutionResult, format: OutputFormat) -> String {
    format.to_json(&result.to_payload())
}

/// Formats a guardrail verdict.
#[must_use]
pub fn format_validation(verdict: Result<usize, &QueryError>, format: OutputFormat) -> String {
    match (verdict, format) {
        (Ok(_), OutputFormat::Text) => "ok\n".to_string(),
        (Err(e), OutputFormat::Text) => format!("{}: {e}\n", e.code()),
        (Ok(complexity), OutputFormat::Json) => format.to_json(&serde_json::json!({
            "valid": true,
            "complexity": complexity,
        })),
        (Err(e), OutputFormat::Json) => format.to_json(&serde_json::json!({
            "valid": false,
            "code": e.code(),
            "error": e.to_string(),
        })),
    }
}

/// Formats an answer, with the session it was recorded in.
#[must_use]
pub fn format_answer(answer: &FinalAnswer, session: Option<&str>, format: OutputFormat) -> String {
    match format {
        OutputFormat::Text => {
            let mut out = format!("{}\n", answer.answer.trim_end());
            if !answer.queries.is_empty() {
                out.push_str(&format!("\nQueries ({}):\n", answer.queries.len()));
                for q in &answer.queries {
                    let status = q.code.as_deref().unwrap_or("ok");
                    out.push_str(&format!(
                        "  {} {} [{status}] {} rows\n",
                        q.operation, q.collection, q.count
                    ));
                }
            }
            if let Some(id) = session {
                out.push_str(&format!("\nSession: {id}\n"));
            }
            out
        }
        OutputFormat::Json => {
            let mut value = serde_json::to_value(answer).unwrap_or(Value::Null);
            if let (Some(obj), Some(id)) = (value.as_object_mut(), session) {
                obj.insert("session_id".to_string(), Value::from(id));
            }
            format.to_json(&value)
        }
    }
}

/// Formats a session listing.
#[must_use]
pub fn format_sessions(sessions: &[SessionSummary], format: OutputFormat) -> String {
    match format {
        OutputFormat::Text => {
            if sessions.is_empty() {
                return "No sessions.\n".to_string();
            }
            let mut out = String::new();
            for s in sessions {
                let _ = writeln!(
                    out,
                    "{}  {}  {:>3} msgs  {}",
                    s.id,
                    s.updated_at.format("%Y-%m-%d %H:%M"),
                    s.message_count,
                    if s.title.is_empty() { "(untitled)" } else { s.title.as_str() }
                );
            }
            out
        }
        OutputFormat::Json => format.to_json(sessions),
    }
}

/// Formats a session's turns.
#[must_use]
pub fn format_turns(id: &str, turns: &[StoredTurn], format: OutputFormat) -> String {
    match format {
        OutputFormat::Text => {
            let mut out = format!("Session {id} ({} turns)\n", turns.len());
            for turn in turns {
                let _ = write!(
                    out,
                    "\n[{}] {}\n{}\n",
                    turn.created_at.format("%Y-%m-%d %H:%M:%S"),
                    turn.role,
                    turn.content.trim_end()
                );
            }
            out
        }
        OutputFormat::Json => format.to_json(&serde_json::json!({
            "id": id,
            "turns": turns,
        })),
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format() {
        assert_eq!(OutputFormat::parse("json"), OutputFormat::Json);
        assert_eq!(OutputFormat::parse("JSON"), OutputFormat::Json);
        assert_eq!(OutputFormat::parse("text"), OutputFormat::Text);
        assert_eq!(OutputFormat::parse("yaml"), OutputFormat::Text);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn test_status_json_counts() {
        let stats = StorageStats {
            collections: vec![("holdings".to_string(), 2), ("trades".to_string(), 3)],
            session_count: 1,
            message_count: 4,
            schema_version: Some(1),
            db_size: None,
        };
        let out = format_status(&stats, OutputFormat::Json);
        let value: Value =
            serde_json::from_str(&out).unwrap_or_else(|e| panic!("invalid JSON: {e}"));
        assert_eq!(value["document_count"], 5);
        assert_eq!(value["collections"]["trades"], 3);
    }

    #[test]
    fn test_validation_text() {
        assert_eq!(format_validation(Ok(1), OutputFormat::Text), "ok\n");
        let err = QueryError::BlockedOperation {
            operation: "drop".to_string(),
        };
        assert!(
            format_validation(Err(&err), OutputFormat::Text).starts_with("BlockedOperation: ")
        );
    }

    #[test]
    fn test_empty_sessions() {
        assert_eq!(format_sessions(&[], OutputFormat::Text), "No sessions.\n");
        assert_eq!(format_sessions(&[], OutputFormat::Json), "[]\n");
    }
}
