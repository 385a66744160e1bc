//! SQLite-backed document store.
//!
//! Documents are stored as Extended-JSON text in a single `documents` table
//! keyed by collection. One writer connection handles ingestion and session
//! persistence; reads go through a pool of `query_only` connections.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension, params};
use serde_json::Value;
use tracing::{debug, info};

use super::{DataStore, ReadBudget, SCHEMA_VERSION, StorageStats};
use crate::error::StorageError;

/// Read connections per store.
pub const DEFAULT_READ_POOL_SIZE: usize = 4;
/// Rows inserted per transaction.
const INSERT_BATCH_SIZE: usize = 1000;
/// VM instructions between progress-handler deadline checks.
const PROGRESS_OPS: i32 = 1000;
/// Busy timeout applied to every connection (ms).
const BUSY_TIMEOUT_MS: u32 = 5000;

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_info (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS documents (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    doc        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection, id);
CREATE TABLE IF NOT EXISTS chat_sessions (
    id         TEXT PRIMARY KEY,
    title      TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS chat_messages (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES chat_sessions(id) ON DELETE CASCADE,
    role       TEXT NOT NULL,
    content    TEXT NOT NULL,
    query_used TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chat_messages_session ON chat_messages(session_id, id);
";

const DROP_SQL: &str = r"
DROP TABLE IF EXISTS chat_messages;
DROP TABLE IF EXISTS chat_sessions;
DROP TABLE IF EXISTS documents;
DROP TABLE IF EXISTS schema_info;
";

/// SQLite document store with a pooled read path.
pub struct SqliteStorage {
    writer: Mutex<Connection>,
    readers: Pool<SqliteConnectionManager>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage")
            .field("path", &self.path)
            .field("readers", &self.readers.max_size())
            .finish_non_exhaustive()
    }
}

fn configure(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.busy_timeout(std::time::Duration::from_millis(u64::from(BUSY_TIMEOUT_MS)))?;
    conn.pragma_update(None, "foreign_keys", "ON")
}

/// Builds the read pool. Every pooled connection is `query_only`; readers of
/// a shared in-memory database also skip the shared-cache table locks.
fn reader_pool(
    target: &str,
    flags: OpenFlags,
    size: usize,
    shared_cache: bool,
) -> Result<Pool<SqliteConnectionManager>, StorageError> {
    let manager = SqliteConnectionManager::file(target)
        .with_flags(flags)
        .with_init(move |conn| {
            configure(conn)?;
            conn.pragma_update(None, "query_only", "ON")?;
            if shared_cache {
                conn.pragma_update(None, "read_uncommitted", "ON")?;
            }
            Ok(())
        });
    let size = u32::try_from(size.max(1)).unwrap_or(u32::MAX);
    Ok(Pool::builder().max_size(size).build(manager)?)
}

impl SqliteStorage {
    /// Opens (or creates) a database file.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or the
    /// database cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with_pool_size(path, DEFAULT_READ_POOL_SIZE)
    }

    /// Opens a database file with a custom read pool size.
    ///
    /// # Errors
    ///
    /// See [`SqliteStorage::open`].
    pub fn open_with_pool_size(
        path: impl AsRef<Path>,
        pool_size: usize,
    ) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let writer = Connection::open(path)?;
        configure(&writer)?;
        let _mode: String = writer.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get(0)
        })?;

        let target = path.to_string_lossy().into_owned();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let readers = reader_pool(&target, flags, pool_size, false)?;
        debug!(path = %path.display(), pool_size, "opened database");

        Ok(Self {
            writer: Mutex::new(writer),
            readers,
            path: Some(path.to_path_buf()),
        })
    }

    /// Creates a private in-memory database shared by the writer and the
    /// read pool.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite cannot open the database.
    pub fn in_memory() -> Result<Self, StorageError> {
        let uri = format!(
            "file:pqa-{}?mode=memory&cache=shared",
            uuid::Uuid::new_v4().simple()
        );
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        // The writer keeps the shared in-memory database alive.
        let writer = Connection::open_with_flags(&uri, flags)?;
        configure(&writer)?;
        let readers = reader_pool(&uri, flags, DEFAULT_READ_POOL_SIZE, true)?;
        Ok(Self {
            writer: Mutex::new(writer),
            readers,
            path: None,
        })
    }

    /// Database file path (`None` for in-memory stores).
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(super) fn writer(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.writer.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn reader(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        Ok(self.readers.get()?)
    }

    /// Creates the schema if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn init(&self) -> Result<(), StorageError> {
        let conn = self.writer()?;
        conn.execute_batch(SCHEMA_SQL)?;
        conn.execute(
            "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?1)",
            params![SCHEMA_VERSION.to_string()],
        )?;
        info!(version = SCHEMA_VERSION, "database schema ready");
        Ok(())
    }

    /// Drops all data and recreates the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the tables cannot be dropped or recreated.
    pub fn reset(&self) -> Result<(), StorageError> {
        self.writer()?.execute_batch(DROP_SQL)?;
        self.init()
    }

    /// Returns `true` once [`SqliteStorage::init`] has run.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be read.
    pub fn is_initialized(&self) -> Result<bool, StorageError> {
        has_schema(&*self.reader()?)
    }

    /// Stored schema version.
    ///
    /// # Errors
    ///
    /// Returns an error if the version row cannot be read.
    pub fn schema_version(&self) -> Result<Option<u32>, StorageError> {
        let conn = self.reader()?;
        if !has_schema(&conn)? {
            return Ok(None);
        }
        stored_version(&conn)
    }

    /// Appends documents to a collection in batched transactions.
    ///
    /// # Errors
    ///
    /// Returns an error if a document cannot be serialized or inserted. Batches
    /// committed before the failure stay committed.
    pub fn insert_documents(&self, collection: &str, docs: &[Value]) -> Result<usize, StorageError> {
        let mut conn = self.writer()?;
        ensure_schema(&conn)?;
        let mut inserted = 0;
        for batch in docs.chunks(INSERT_BATCH_SIZE) {
            let tx = conn.transaction()?;
            {
                let mut stmt =
                    tx.prepare_cached("INSERT INTO documents (collection, doc) VALUES (?1, ?2)")?;
                for doc in batch {
                    stmt.execute(params![collection, serde_json::to_string(doc)?])?;
                }
            }
            tx.commit()?;
            inserted += batch.len();
            debug!(collection, inserted, "inserted document batch");
        }
        Ok(inserted)
    }

    /// Deletes every document in a collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn clear_collection(&self, collection: &str) -> Result<usize, StorageError> {
        let conn = self.writer()?;
        ensure_schema(&conn)?;
        Ok(conn.execute(
            "DELETE FROM documents WHERE collection = ?1",
            params![collection],
        )?)
    }

    /// Document and session counts.
    ///
    /// # Errors
    ///
    /// Returns an error if the counts cannot be read.
    pub fn stats(&self) -> Result<StorageStats, StorageError> {
        let conn = self.reader()?;
        ensure_schema(&conn)?;
        let schema_version = stored_version(&conn)?;
        let mut stmt = conn.prepare(
            "SELECT collection, COUNT(*) FROM documents GROUP BY collection ORDER BY collection",
        )?;
        let collections = stmt
            .query_map([], |row| {
                let n: i64 = row.get(1)?;
                Ok((row.get::<_, String>(0)?, usize::try_from(n).unwrap_or(0)))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let count = |sql: &str| -> Result<usize, StorageError> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(usize::try_from(n).unwrap_or(0))
        };
        let session_count = count("SELECT COUNT(*) FROM chat_sessions")?;
        let message_count = count("SELECT COUNT(*) FROM chat_messages")?;
        let db_size = self
            .path
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len());

        Ok(StorageStats {
            collections,
            session_count,
            message_count,
            schema_version,
            db_size,
        })
    }
}

fn has_schema(conn: &Connection) -> Result<bool, StorageError> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'schema_info'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn ensure_schema(conn: &Connection) -> Result<(), StorageError> {
    if has_schema(conn)? {
        Ok(())
    } else {
        Err(StorageError::NotInitialized)
    }
}

fn stored_version(conn: &Connection) -> Result<Option<u32>, StorageError> {
    let version: Option<String> = conn
        .query_row(
            "SELECT value FROM schema_info WHERE key = 'version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.and_then(|v| v.parse().ok()))
}

fn read_collection(
    conn: &Connection,
    collection: &str,
    budget: &ReadBudget,
) -> Result<Vec<Value>, StorageError> {
    let mut stmt =
        conn.prepare_cached("SELECT doc FROM documents WHERE collection = ?1 ORDER BY id")?;
    let mut rows = stmt.query(params![collection])?;
    let mut docs = Vec::new();
    while let Some(row) = rows.next()? {
        let text: String = row.get(0)?;
        docs.push(serde_json::from_str(&text)?);
        if docs.len() % INSERT_BATCH_SIZE == 0 {
            budget.check()?;
        }
    }
    Ok(docs)
}

fn is_interrupt(err: &StorageError) -> bool {
    matches!(
        err,
        StorageError::Database(rusqlite::Error::SqliteFailure(e, _))
            if e.code == ErrorCode::OperationInterrupted
    )
}

impl DataStore for SqliteStorage {
    fn collections(&self) -> Result<Vec<String>, StorageError> {
        let conn = self.reader()?;
        ensure_schema(&conn)?;
        let mut stmt =
            conn.prepare_cached("SELECT DISTINCT collection FROM documents ORDER BY collection")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    fn scan(&self, collection: &str, budget: &ReadBudget) -> Result<Vec<Value>, StorageError> {
        budget.check()?;
        let started = Instant::now();
        let conn = self.reader()?;
        ensure_schema(&conn)?;
        let watched = *budget;
        conn.progress_handler(PROGRESS_OPS, Some(move || watched.is_expired()));
        let result = read_collection(&conn, collection, budget);
        conn.progress_handler(0, None::<fn() -> bool>);
        let docs = result.map_err(|e| if is_interrupt(&e) { budget.exceeded() } else { e })?;
        debug!(
            collection,
            documents = docs.len(),
            elapsed_ms = started.elapsed().as_millis(),
            "scanned collection"
        );
        Ok(docs)
    }
}
