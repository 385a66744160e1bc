//! Chat session persistence.
//!
//! Sessions are keyed by an opaque UUID string. Turns are stored with their
//! raw role label; role normalization happens when they are replayed into a
//! conversation.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::SqliteStorage;
use crate::error::StorageError;

/// Maximum characters kept from the first user message as a session title.
pub const MAX_TITLE_CHARS: usize = 80;

/// Session listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session identifier.
    pub id: String,
    /// Title derived from the first user message.
    pub title: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last appended turn.
    pub updated_at: DateTime<Utc>,
    /// Number of stored turns.
    pub message_count: usize,
}

/// One persisted chat turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTurn {
    /// Role label as stored (`user`, `assistant`).
    pub role: String,
    /// Turn text.
    pub content: String,
    /// Queries issued while producing this turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_used: Option<Value>,
    /// When the turn was stored.
    pub created_at: DateTime<Utc>,
}

impl StoredTurn {
    /// A turn stamped with the current time.
    #[must_use]
    pub fn now(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            query_used: None,
            created_at: Utc::now(),
        }
    }

    /// Attaches the queries issued for this turn.
    #[must_use]
    pub fn with_queries(mut self, queries: Value) -> Self {
        self.query_used = Some(queries);
        self
    }
}

/// Conversation persistence collaborator.
pub trait SessionStore {
    /// Creates an empty session and returns its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be stored.
    fn create_session(&self) -> Result<String, StorageError>;

    /// Lists sessions, most recently updated first.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing cannot be read.
    fn list_sessions(&self) -> Result<Vec<SessionSummary>, StorageError>;

    /// Loads a session's turns in order.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] for unknown ids.
    fn load_turns(&self, session_id: &str) -> Result<Vec<StoredTurn>, StorageError>;

    /// Appends turns to a session. The first user turn of an untitled session
    /// becomes its title.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] for unknown ids.
    fn append_turns(&self, session_id: &str, turns: &[StoredTurn]) -> Result<(), StorageError>;

    /// Deletes a session and its turns.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] for unknown ids.
    fn delete_session(&self, session_id: &str) -> Result<(), StorageError>;
}

fn title_from(content: &str) -> String {
    let line = content.trim();
    if line.chars().count() <= MAX_TITLE_CHARS {
        return line.to_string();
    }
    let mut title: String = line.chars().take(MAX_TITLE_CHARS - 3).collect();
    title.push_str("...");
    title
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

fn not_found(id: &str) -> StorageError {
    StorageError::NotFound {
        entity: "session",
        id: id.to_string(),
    }
}

impl SqliteStorage {
    fn session_exists(conn: &rusqlite::Connection, id: &str) -> Result<bool, StorageError> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM chat_sessions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

impl SessionStore for SqliteStorage {
    fn create_session(&self) -> Result<String, StorageError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        self.writer()?.execute(
            "INSERT INTO chat_sessions (id, title, created_at, updated_at) VALUES (?1, '', ?2, ?2)",
            params![id, now],
        )?;
        Ok(id)
    }

    fn list_sessions(&self) -> Result<Vec<SessionSummary>, StorageError> {
        let conn = self.writer()?;
        let mut stmt = conn.prepare(
            "SELECT s.id, s.title, s.created_at, s.updated_at, COUNT(m.id)
             FROM chat_sessions s LEFT JOIN chat_messages m ON m.session_id = s.id
             GROUP BY s.id
             ORDER BY s.updated_at DESC, s.created_at DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let created: String = row.get(2)?;
                let updated: String = row.get(3)?;
                let count: i64 = row.get(4)?;
                Ok(SessionSummary {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    created_at: parse_time(&created),
                    updated_at: parse_time(&updated),
                    message_count: usize::try_from(count).unwrap_or(0),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn load_turns(&self, session_id: &str) -> Result<Vec<StoredTurn>, StorageError> {
        let conn = self.writer()?;
        if !Self::session_exists(&conn, session_id)? {
            return Err(not_found(session_id));
        }
        let mut stmt = conn.prepare(
            "SELECT role, content, query_used, created_at FROM chat_messages
             WHERE session_id = ?1 ORDER BY id",
        )?;
        let raw = stmt
            .query_map(params![session_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(role, content, query_used, created_at)| {
                Ok(StoredTurn {
                    role,
                    content,
                    query_used: query_used.as_deref().map(serde_json::from_str).transpose()?,
                    created_at: parse_time(&created_at),
                })
            })
            .collect()
    }

    fn append_turns(&self, session_id: &str, turns: &[StoredTurn]) -> Result<(), StorageError> {
        let mut conn = self.writer()?;
        if !Self::session_exists(&conn, session_id)? {
            return Err(not_found(session_id));
        }
        let tx = conn.transaction()?;
        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO chat_messages (session_id, role, content, query_used, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for turn in turns {
                let query_used = turn
                    .query_used
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                insert.execute(params![
                    session_id,
                    turn.role,
                    turn.content,
                    query_used,
                    turn.created_at.to_rfc3339()
                ])?;
            }
        }
        if let Some(first_user) = turns.iter().find(|t| t.role == "user") {
            tx.execute(
                "UPDATE chat_sessions SET title = ?2 WHERE id = ?1 AND title = ''",
                params![session_id, title_from(&first_user.content)],
            )?;
        }
        tx.execute(
            "UPDATE chat_sessions SET updated_at = ?2 WHERE id = ?1",
            params![session_id, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn delete_session(&self, session_id: &str) -> Result<(), StorageError> {
        let conn = self.writer()?;
        conn.execute(
            "DELETE FROM chat_messages WHERE session_id = ?1",
            params![session_id],
        )?;
        let removed = conn.execute("DELETE FROM chat_sessions WHERE id = ?1", params![session_id])?;
        if removed == 0 {
            return Err(not_found(session_id));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use serde_json::json;

    use super::*;

    fn setup() -> SqliteStorage {
        let storage = SqliteStorage::in_memory().unwrap_or_else(|e| panic!("in_memory failed: {e}"));
        storage.init().unwrap_or_else(|e| panic!("init failed: {e}"));
        storage
    }

    #[test]
    fn test_session_lifecycle() {
        let storage = setup();
        let id = storage
            .create_session()
            .unwrap_or_else(|e| panic!("create failed: {e}"));
        assert!(uuid::Uuid::parse_str(&id).is_ok());

        let turns = vec![
            StoredTurn::now("user", "How many trades in January?"),
            StoredTurn::now("assistant", "There were 12.").with_queries(json!([{"collection": "trades"}])),
        ];
        storage
            .append_turns(&id, &turns)
            .unwrap_or_else(|e| panic!("append failed: {e}"));

        let loaded = storage
            .load_turns(&id)
            .unwrap_or_else(|e| panic!("load failed: {e}"));
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].role, "user");
        assert_eq!(loaded[1].query_used, Some(json!([{"collection": "trades"}])));

        let sessions = storage.list_sessions().unwrap_or_default();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].title, "How many trades in January?");
        assert_eq!(sessions[0].message_count, 2);

        storage
            .delete_session(&id)
            .unwrap_or_else(|e| panic!("delete failed: {e}"));
        assert!(matches!(storage.load_turns(&id), Err(StorageError::NotFound { .. })));
    }

    #[test]
    fn test_title_kept_after_first_user_turn() {
        let storage = setup();
        let id = storage.create_session().unwrap_or_default();
        let _ = storage.append_turns(&id, &[StoredTurn::now("user", "first question")]);
        let _ = storage.append_turns(&id, &[StoredTurn::now("user", "second question")]);
        let sessions = storage.list_sessions().unwrap_or_default();
        assert_eq!(sessions[0].title, "first question");
    }

    #[test]
    fn test_title_truncated() {
        let long = "x".repeat(200);
        let title = title_from(&long);
        assert_eq!(title.chars().count(), MAX_TITLE_CHARS);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn test_unknown_session_errors() {
        let storage = setup();
        assert!(matches!(
            storage.append_turns("nope", &[]),
            Err(StorageError::NotFound { entity: "session", .. })
        ));
        assert!(storage.delete_session("nope").is_err());
    }
}
