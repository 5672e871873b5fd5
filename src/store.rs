//! SQLite persistence layer.
//!
//! Stores users, chat messages, and session records. Uses WAL mode for
//! concurrent reads during writes. The connection sits behind a mutex so the
//! handle can be cloned into the shared server state; callers must not hold
//! it across an await point.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};

use crate::protocol::HistoryEntry;

/// A persisted user row.
#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
}

/// A session row that has not been marked disconnected.
#[derive(Debug, Clone)]
pub struct OpenSessionRow {
    pub session_id: String,
    pub user_id: i64,
    pub connected_at: i64,
}

/// Database handle wrapping a shared SQLite connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init(conn: &Connection) -> SqlResult<()> {
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                username   TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL,
                last_seen  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id        INTEGER NOT NULL REFERENCES users(id),
                kind           TEXT NOT NULL,
                content        TEXT NOT NULL,
                target_user_id INTEGER,
                payload        BLOB,
                created_at     INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_created
                ON messages(created_at DESC);

            CREATE TABLE IF NOT EXISTS sessions (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id         INTEGER NOT NULL REFERENCES users(id),
                session_id      TEXT NOT NULL UNIQUE,
                connected_at    INTEGER NOT NULL,
                disconnected_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_user
                ON sessions(user_id);
            ",
        )?;
        tracing::debug!("Database schema ready");
        Ok(())
    }

    // ── Users ──────────────────────────────────────────────────────────

    /// Look up a user by name, creating the row if absent. Touches `last_seen`
    /// either way.
    pub fn upsert_user_by_name(&self, name: &str, now_ms: i64) -> SqlResult<UserRow> {
        let conn = self.conn.lock();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM users WHERE username = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE users SET last_seen = ?1 WHERE id = ?2",
                    params![now_ms, id],
                )?;
                Ok(UserRow {
                    id,
                    username: name.to_string(),
                })
            }
            None => {
                conn.execute(
                    "INSERT INTO users (username, created_at, last_seen) VALUES (?1, ?2, ?3)",
                    params![name, now_ms, now_ms],
                )?;
                Ok(UserRow {
                    id: conn.last_insert_rowid(),
                    username: name.to_string(),
                })
            }
        }
    }

    /// Look up a user by id.
    pub fn get_user(&self, user_id: i64) -> SqlResult<Option<UserRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, username FROM users WHERE id = ?1",
            params![user_id],
            |row| {
                Ok(UserRow {
                    id: row.get(0)?,
                    username: row.get(1)?,
                })
            },
        )
        .optional()
    }

    /// True if no other user currently holds `name`.
    pub fn is_name_available(&self, name: &str, for_user_id: i64) -> SqlResult<bool> {
        let conn = self.conn.lock();
        let taken: Option<i64> = conn
            .query_row(
                "SELECT id FROM users WHERE username = ?1 AND id != ?2",
                params![name, for_user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(taken.is_none())
    }

    /// Change a user's display name. The UNIQUE constraint still applies, so
    /// this fails if the availability check raced with another rename.
    pub fn update_username(&self, user_id: i64, name: &str, now_ms: i64) -> SqlResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET username = ?1, last_seen = ?2 WHERE id = ?3",
            params![name, now_ms, user_id],
        )?;
        Ok(())
    }

    // ── Sessions ───────────────────────────────────────────────────────

    /// Record a new session for a user.
    pub fn create_session(&self, user_id: i64, session_id: &str, now_ms: i64) -> SqlResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (user_id, session_id, connected_at) VALUES (?1, ?2, ?3)",
            params![user_id, session_id, now_ms],
        )?;
        Ok(())
    }

    /// Mark a session as disconnected. Idempotent: an already-ended row keeps
    /// its original disconnect time.
    pub fn end_session(&self, session_id: &str, now_ms: i64) -> SqlResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sessions SET disconnected_at = ?1
             WHERE session_id = ?2 AND disconnected_at IS NULL",
            params![now_ms, session_id],
        )?;
        Ok(())
    }

    /// Mark every open session as disconnected. Run at boot to clear rows
    /// left behind by an unclean shutdown. Returns the number of rows closed.
    pub fn end_all_open_sessions(&self, now_ms: i64) -> SqlResult<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sessions SET disconnected_at = ?1 WHERE disconnected_at IS NULL",
            params![now_ms],
        )
    }

    /// List all sessions not yet marked disconnected.
    pub fn open_sessions(&self) -> SqlResult<Vec<OpenSessionRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, user_id, connected_at FROM sessions
             WHERE disconnected_at IS NULL",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(OpenSessionRow {
                session_id: row.get(0)?,
                user_id: row.get(1)?,
                connected_at: row.get(2)?,
            })
        })?;
        rows.collect()
    }

    /// Distinct users with at least one open session, ordered by name.
    pub fn online_users(&self) -> SqlResult<Vec<UserRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT u.id, u.username
             FROM users u JOIN sessions s ON s.user_id = u.id
             WHERE s.disconnected_at IS NULL
             ORDER BY u.username",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
            })
        })?;
        rows.collect()
    }

    // ── Messages ───────────────────────────────────────────────────────

    /// Store a message. `target_user_id` marks private messages; `payload`
    /// carries raw file bytes for file posts. Returns the new row id.
    pub fn insert_message(
        &self,
        user_id: i64,
        kind: &str,
        content: &str,
        target_user_id: Option<i64>,
        payload: Option<&[u8]>,
        now_ms: i64,
    ) -> SqlResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO messages (user_id, kind, content, target_user_id, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![user_id, kind, content, target_user_id, payload, now_ms],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Fetch the most recent public messages, ordered oldest-first.
    /// Private and system rows never appear; file rows surface their metadata
    /// JSON in `content`, not the binary payload.
    pub fn recent_history(&self, limit: usize) -> SqlResult<Vec<HistoryEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT m.id, m.kind, m.user_id, u.username, m.content, m.created_at
             FROM messages m JOIN users u ON u.id = m.user_id
             WHERE m.kind NOT IN ('private', 'system')
             ORDER BY m.created_at DESC, m.id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], map_history_row)?;
        let mut entries = rows.collect::<SqlResult<Vec<_>>>()?;
        // Reverse to oldest-first order
        entries.reverse();
        Ok(entries)
    }

    /// Total number of persisted messages.
    pub fn message_count(&self) -> SqlResult<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
    }
}

fn map_history_row(row: &rusqlite::Row) -> SqlResult<HistoryEntry> {
    Ok(HistoryEntry {
        id: row.get(0)?,
        kind: row.get(1)?,
        user_id: row.get(2)?,
        name: row.get(3)?,
        content: row.get(4)?,
        ts: row.get(5)?,
    })
}
