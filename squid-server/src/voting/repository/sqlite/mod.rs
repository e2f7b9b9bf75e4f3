//! SQLite implementation of `VoteRepository`.
//!
//! Sessions, the messages they render to and individual ballots live in
//! three tables, so a ballot change is a single-row write.
//!
//! # Schema Versioning
//!
//! The `schema_version` table records the applied schema. To change the
//! schema, increment `CURRENT_SCHEMA_VERSION` and add a step to
//! `run_migrations()`. Steps run sequentially from the stored version.

#[cfg(test)]
mod tests;

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use squid_core::{
    EmojiSet, MessageId, SessionId, SessionParts, SessionPayload, SessionResult, SessionStatus,
    Thresholds, UserId, VoteSession,
};

use super::{RepositoryError, VoteRepository};

/// Current schema version. Increment this when making schema changes and add
/// the corresponding step in `run_migrations()`.
const CURRENT_SCHEMA_VERSION: i64 = 1;

const SESSION_COLUMNS: &str = "id, status, result, author_id, pass_threshold, fail_threshold, \
                               payload_json, emojis_json";

/// SQLite-backed vote repository.
///
/// Uses `tokio::task::spawn_blocking` to run synchronous rusqlite calls
/// without blocking the async runtime.
pub struct SqliteRepository {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

/// A `vote_sessions` row before its messages and ballots are attached.
struct SessionRow {
    id: i64,
    status: String,
    result: Option<String>,
    author_id: i64,
    pass_threshold: i64,
    fail_threshold: i64,
    payload_json: String,
    emojis_json: String,
}

impl SessionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            result: row.get(2)?,
            author_id: row.get(3)?,
            pass_threshold: row.get(4)?,
            fail_threshold: row.get(5)?,
            payload_json: row.get(6)?,
            emojis_json: row.get(7)?,
        })
    }
}

impl SqliteRepository {
    /// Open (or create) the database at `path` and bring its schema up to date.
    ///
    /// # Durability
    ///
    /// The database is configured with:
    /// - `journal_mode = WAL`
    /// - `synchronous = FULL` so a recorded vote survives power loss
    /// - `busy_timeout = 5000ms`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory && !path_str.is_empty() {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        RepositoryError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| RepositoryError::storage("open database", e.to_string()))?;

        // In-memory databases report "memory" instead of "wal".
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| RepositoryError::storage("set journal_mode", e.to_string()))?;
        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));
        if !journal_mode_ok {
            return Err(RepositoryError::storage(
                "configure journal_mode",
                format!(
                    "Failed to enable WAL mode: SQLite returned '{}' instead of 'wal'",
                    journal_mode
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            PRAGMA foreign_keys = ON;
            "#,
        )
        .map_err(|e| RepositoryError::storage("configure pragmas", e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| RepositoryError::storage("create schema_version table", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| RepositoryError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run migrations from `from_version` to `CURRENT_SCHEMA_VERSION`.
    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), RepositoryError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(RepositoryError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}. \
                     Please upgrade the application.",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS vote_sessions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    kind TEXT NOT NULL,
                    status TEXT NOT NULL,
                    result TEXT,
                    author_id INTEGER NOT NULL,
                    pass_threshold INTEGER NOT NULL,
                    fail_threshold INTEGER NOT NULL,
                    payload_json TEXT NOT NULL,
                    emojis_json TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    closed_at INTEGER
                );

                CREATE INDEX IF NOT EXISTS idx_vote_sessions_open
                    ON vote_sessions(status) WHERE status = 'open';

                CREATE TABLE IF NOT EXISTS vote_session_messages (
                    message_id INTEGER PRIMARY KEY,
                    session_id INTEGER NOT NULL REFERENCES vote_sessions(id)
                );

                CREATE INDEX IF NOT EXISTS idx_vote_session_messages_session
                    ON vote_session_messages(session_id);

                CREATE TABLE IF NOT EXISTS votes (
                    session_id INTEGER NOT NULL REFERENCES vote_sessions(id),
                    user_id INTEGER NOT NULL,
                    weight INTEGER NOT NULL CHECK (weight != 0),
                    emoji TEXT,
                    recorded_at INTEGER NOT NULL,
                    PRIMARY KEY (session_id, user_id)
                );
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v1", e.to_string()))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| RepositoryError::storage("update schema version", e.to_string()))?;

        Ok(())
    }

    /// Create a new in-memory SQLite repository (for testing).
    pub fn new_in_memory() -> Result<Self, RepositoryError> {
        Self::new(":memory:")
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T, RepositoryError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, RepositoryError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| RepositoryError::storage(operation, "connection mutex poisoned"))?;
            f(&conn)
        })
        .await
        .map_err(|e| RepositoryError::storage(operation, e.to_string()))?
    }
}

// =============================================================================
// Integer conversion helpers
// =============================================================================

/// Convert a platform id (u64) to i64 for SQLite storage.
///
/// Platform snowflakes fit in 63 bits; anything larger is rejected rather
/// than wrapped.
pub(super) fn platform_id_to_i64(id: u64, operation: &'static str) -> Result<i64, RepositoryError> {
    i64::try_from(id).map_err(|_| {
        RepositoryError::storage(
            operation,
            format!("id {} exceeds maximum storable value ({})", id, i64::MAX),
        )
    })
}

/// Convert an i64 from SQLite back to a platform id.
pub(super) fn i64_to_platform_id(value: i64, what: &str) -> Result<u64, RepositoryError> {
    u64::try_from(value)
        .map_err(|_| RepositoryError::corruption(format!("negative {} {}", what, value)))
}

fn threshold_from_i64(value: i64, which: &str) -> Result<u32, RepositoryError> {
    u32::try_from(value)
        .map_err(|_| RepositoryError::corruption(format!("{} threshold {}", which, value)))
}

fn status_columns(status: SessionStatus) -> (&'static str, Option<&'static str>) {
    match status {
        SessionStatus::Open => ("open", None),
        SessionStatus::Closed { result } => ("closed", Some(result.as_str())),
    }
}

fn parse_status(status: &str, result: Option<&str>) -> Result<SessionStatus, RepositoryError> {
    match (status, result) {
        ("open", _) => Ok(SessionStatus::Open),
        ("closed", Some(result)) => {
            let result: SessionResult = result.parse().map_err(RepositoryError::corruption)?;
            Ok(SessionStatus::Closed { result })
        }
        (other, _) => Err(RepositoryError::corruption(format!(
            "session status '{}'",
            other
        ))),
    }
}

/// Attach messages and ballots to a session row and rebuild the session.
fn load_session(conn: &Connection, row: SessionRow) -> Result<VoteSession, RepositoryError> {
    let session_id = row.id;

    let mut stmt = conn
        .prepare_cached(
            "SELECT message_id FROM vote_session_messages
             WHERE session_id = ?1 ORDER BY message_id",
        )
        .map_err(|e| RepositoryError::storage("load messages", e.to_string()))?;
    let message_ids = stmt
        .query_map(params![session_id], |row| row.get::<_, i64>(0))
        .map_err(|e| RepositoryError::storage("load messages", e.to_string()))?
        .map(|raw| {
            let raw = raw.map_err(|e| RepositoryError::storage("load messages", e.to_string()))?;
            i64_to_platform_id(raw, "message id").map(MessageId)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn
        .prepare_cached("SELECT user_id, weight FROM votes WHERE session_id = ?1")
        .map_err(|e| RepositoryError::storage("load votes", e.to_string()))?;
    let ballots = stmt
        .query_map(params![session_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })
        .map_err(|e| RepositoryError::storage("load votes", e.to_string()))?
        .map(|raw| {
            let (user, weight) =
                raw.map_err(|e| RepositoryError::storage("load votes", e.to_string()))?;
            Ok((UserId(i64_to_platform_id(user, "voter id")?), weight))
        })
        .collect::<Result<Vec<_>, RepositoryError>>()?;

    let payload: SessionPayload = serde_json::from_str(&row.payload_json)
        .map_err(|_| RepositoryError::corruption("session payload JSON"))?;
    let emojis: EmojiSet = serde_json::from_str(&row.emojis_json)
        .map_err(|_| RepositoryError::corruption("session emoji JSON"))?;
    let thresholds = Thresholds::new(
        threshold_from_i64(row.pass_threshold, "pass")?,
        threshold_from_i64(row.fail_threshold, "fail")?,
    )
    .map_err(|e| RepositoryError::corruption(e.to_string()))?;

    VoteSession::from_parts(SessionParts {
        id: Some(SessionId(session_id)),
        status: parse_status(&row.status, row.result.as_deref())?,
        message_ids,
        author_id: UserId(i64_to_platform_id(row.author_id, "author id")?),
        thresholds,
        emojis,
        ballots,
        payload,
    })
    .map_err(|e| RepositoryError::corruption(format!("vote session {}: {}", session_id, e)))
}

// =============================================================================
// VoteRepository trait implementation
// =============================================================================

#[async_trait]
impl VoteRepository for SqliteRepository {
    async fn insert_session(&self, session: &VoteSession) -> Result<SessionId, RepositoryError> {
        let kind = session.kind().as_str();
        let (status, result) = status_columns(session.status());
        let author_id = platform_id_to_i64(session.author_id().0, "insert_session")?;
        let pass = i64::from(session.thresholds().pass());
        let fail = i64::from(session.thresholds().fail());
        let payload_json = serde_json::to_string(session.payload())
            .map_err(|e| RepositoryError::storage("serialize payload", e.to_string()))?;
        let emojis_json = serde_json::to_string(session.emojis())
            .map_err(|e| RepositoryError::storage("serialize emojis", e.to_string()))?;
        let now = chrono::Utc::now().timestamp();

        self.with_conn("insert_session", move |conn| {
            conn.execute(
                "INSERT INTO vote_sessions
                     (kind, status, result, author_id, pass_threshold, fail_threshold,
                      payload_json, emojis_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    kind,
                    status,
                    result,
                    author_id,
                    pass,
                    fail,
                    payload_json,
                    emojis_json,
                    now
                ],
            )
            .map_err(|e| RepositoryError::storage("insert_session", e.to_string()))?;
            Ok(SessionId(conn.last_insert_rowid()))
        })
        .await
    }

    async fn track_message(
        &self,
        session_id: SessionId,
        message_id: MessageId,
    ) -> Result<(), RepositoryError> {
        let message = platform_id_to_i64(message_id.0, "track_message")?;

        self.with_conn("track_message", move |conn| {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT id FROM vote_sessions WHERE id = ?1",
                    params![session_id.0],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| RepositoryError::storage("track_message", e.to_string()))?;
            if exists.is_none() {
                return Err(RepositoryError::NotFound(session_id));
            }

            let existing: Option<i64> = conn
                .query_row(
                    "SELECT session_id FROM vote_session_messages WHERE message_id = ?1",
                    params![message],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| RepositoryError::storage("track_message", e.to_string()))?;
            match existing {
                Some(owner) if owner == session_id.0 => Ok(()),
                Some(owner) => Err(RepositoryError::MessageTaken {
                    message_id,
                    owner: SessionId(owner),
                }),
                None => {
                    conn.execute(
                        "INSERT INTO vote_session_messages (message_id, session_id)
                         VALUES (?1, ?2)",
                        params![message, session_id.0],
                    )
                    .map_err(|e| RepositoryError::storage("track_message", e.to_string()))?;
                    Ok(())
                }
            }
        })
        .await
    }

    async fn message_owner(
        &self,
        message_id: MessageId,
    ) -> Result<Option<SessionId>, RepositoryError> {
        let message = platform_id_to_i64(message_id.0, "message_owner")?;

        self.with_conn("message_owner", move |conn| {
            conn.query_row(
                "SELECT session_id FROM vote_session_messages WHERE message_id = ?1",
                params![message],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map(|owner| owner.map(SessionId))
            .map_err(|e| RepositoryError::storage("message_owner", e.to_string()))
        })
        .await
    }

    async fn upsert_vote(
        &self,
        session_id: SessionId,
        voter: UserId,
        weight: Option<i64>,
        emoji: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let user = platform_id_to_i64(voter.0, "upsert_vote")?;
        let emoji = emoji.map(str::to_string);
        let now = chrono::Utc::now().timestamp();

        self.with_conn("upsert_vote", move |conn| {
            let result = match weight {
                Some(weight) if weight != 0 => conn.execute(
                    "INSERT INTO votes (session_id, user_id, weight, emoji, recorded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(session_id, user_id) DO UPDATE SET
                         weight = excluded.weight,
                         emoji = excluded.emoji,
                         recorded_at = excluded.recorded_at",
                    params![session_id.0, user, weight, emoji, now],
                ),
                _ => conn.execute(
                    "DELETE FROM votes WHERE session_id = ?1 AND user_id = ?2",
                    params![session_id.0, user],
                ),
            };
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(RepositoryError::NotFound(session_id))
                }
                Err(e) => Err(RepositoryError::storage("upsert_vote", e.to_string())),
            }
        })
        .await
    }

    async fn update_session_status(
        &self,
        session_id: SessionId,
        status: SessionStatus,
    ) -> Result<(), RepositoryError> {
        let (status, result) = status_columns(status);
        let closed_at = result.map(|_| chrono::Utc::now().timestamp());

        self.with_conn("update_session_status", move |conn| {
            let updated = conn
                .execute(
                    "UPDATE vote_sessions SET status = ?1, result = ?2, closed_at = ?3
                     WHERE id = ?4",
                    params![status, result, closed_at, session_id.0],
                )
                .map_err(|e| RepositoryError::storage("update_session_status", e.to_string()))?;
            if updated == 0 {
                return Err(RepositoryError::NotFound(session_id));
            }
            Ok(())
        })
        .await
    }

    async fn get_session(
        &self,
        session_id: SessionId,
    ) -> Result<Option<VoteSession>, RepositoryError> {
        self.with_conn("get_session", move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {} FROM vote_sessions WHERE id = ?1", SESSION_COLUMNS),
                    params![session_id.0],
                    SessionRow::from_row,
                )
                .optional()
                .map_err(|e| RepositoryError::storage("get_session", e.to_string()))?;
            row.map(|row| load_session(conn, row)).transpose()
        })
        .await
    }

    async fn list_open_sessions(&self) -> Result<Vec<VoteSession>, RepositoryError> {
        self.with_conn("list_open_sessions", |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM vote_sessions WHERE status = 'open' ORDER BY id",
                    SESSION_COLUMNS
                ))
                .map_err(|e| RepositoryError::storage("list_open_sessions", e.to_string()))?;
            let rows = stmt
                .query_map([], SessionRow::from_row)
                .map_err(|e| RepositoryError::storage("list_open_sessions", e.to_string()))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| RepositoryError::storage("list_open_sessions", e.to_string()))?;

            let mut sessions = Vec::with_capacity(rows.len());
            for row in rows {
                let id = row.id;
                match load_session(conn, row) {
                    Ok(session) => sessions.push(session),
                    Err(RepositoryError::Corruption { what }) => {
                        warn!("Skipping corrupt vote session {}: {}", id, what);
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(sessions)
        })
        .await
    }
}
