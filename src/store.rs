//! SQLite persistence: identities, saved files, install records, transcripts.
//!
//! Every operation opens a fresh connection, commits and closes. The schema
//! is installed idempotently on open.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Persisted `command` column is bounded to this many characters.
pub const MAX_COMMAND_CHARS: usize = 500;
/// Persisted `output` column is bounded to this many characters.
pub const MAX_OUTPUT_CHARS: usize = 10000;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Sql(rusqlite::Error),
    Join(tokio::task::JoinError),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io: {err}"),
            Self::Sql(err) => write!(f, "sqlite: {err}"),
            Self::Join(err) => write!(f, "task join: {err}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Sql(err)
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Join(err)
    }
}

/// Transcript tag: what kind of invocation produced a terminal log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    Lib,
    Cmd,
    Exec,
    Error,
}

impl TerminalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lib => "lib",
            Self::Cmd => "cmd",
            Self::Exec => "exec",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub project_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LibraryRow {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone)]
pub struct TerminalLogRow {
    pub terminal_type: String,
    pub command: String,
    pub output: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ExportedFile {
    pub filename: String,
    pub content: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ExportedLibrary {
    pub library_name: String,
    pub version: String,
}

#[derive(Debug, Clone)]
pub struct ExportData {
    pub code_files: Vec<ExportedFile>,
    pub libraries: Vec<ExportedLibrary>,
}

#[derive(Debug, Clone, Copy)]
pub struct AdminCounts {
    pub users: i64,
    pub code_files: i64,
    pub distinct_libraries: i64,
}

/// Unix time in milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Debug, Clone)]
pub struct Store {
    db_path: PathBuf,
}

impl Store {
    pub fn open(db_path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = Self { db_path };
        let conn = store.connect()?;
        install_schema(&conn)?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    /// Look up the newest anonymous identity for a network address, or
    /// create one with a synthetic handle. Rows bound to a project are
    /// never matched by address.
    pub fn resolve_anonymous(&self, ip_address: &str, now_ms: i64) -> Result<UserRecord, StoreError> {
        let conn = self.connect()?;
        let existing = conn
            .query_row(
                "SELECT id, username FROM users \
                 WHERE ip_address = ?1 AND project_name IS NULL \
                 ORDER BY created_at_ms DESC, id DESC LIMIT 1",
                params![ip_address],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        if let Some((id, username)) = existing {
            return Ok(UserRecord {
                id,
                username,
                project_name: None,
            });
        }

        let username = format!(
            "user_{}_{}",
            now_ms / 1000,
            ip_address.replace(['.', ':'], "_")
        );
        conn.execute(
            "INSERT INTO users(username, ip_address, project_name, created_at_ms) \
             VALUES (?1, ?2, NULL, ?3)",
            params![username, ip_address, now_ms],
        )?;
        Ok(UserRecord {
            id: conn.last_insert_rowid(),
            username,
            project_name: None,
        })
    }

    /// Look up or create the identity for a (username, project) pair.
    pub fn resolve_login(
        &self,
        username: &str,
        project_name: &str,
        ip_address: &str,
        now_ms: i64,
    ) -> Result<UserRecord, StoreError> {
        let conn = self.connect()?;
        let existing = conn
            .query_row(
                "SELECT id FROM users WHERE username = ?1 AND project_name = ?2",
                params![username, project_name],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(UserRecord {
                id,
                username: username.to_string(),
                project_name: Some(project_name.to_string()),
            });
        }

        conn.execute(
            "INSERT INTO users(username, ip_address, project_name, created_at_ms) \
             VALUES (?1, ?2, ?3, ?4)",
            params![username, ip_address, project_name, now_ms],
        )?;
        Ok(UserRecord {
            id: conn.last_insert_rowid(),
            username: username.to_string(),
            project_name: Some(project_name.to_string()),
        })
    }

    /// Upsert a saved file for one identity. Last writer wins.
    pub fn save_code_file(
        &self,
        user_id: i64,
        filename: &str,
        content: &str,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO code_files(user_id, filename, content, updated_at_ms) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(user_id, filename) DO UPDATE \
             SET content = excluded.content, updated_at_ms = excluded.updated_at_ms",
            params![user_id, filename, content, now_ms],
        )?;
        Ok(())
    }

    /// The file the editor opens with: a saved `main.py` when present,
    /// otherwise the most recently updated file.
    pub fn default_file(&self, user_id: i64) -> Result<Option<(String, String)>, StoreError> {
        let conn = self.connect()?;
        let main = conn
            .query_row(
                "SELECT filename, content FROM code_files \
                 WHERE user_id = ?1 AND filename = 'main.py'",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if main.is_some() {
            return Ok(main);
        }
        Ok(conn
            .query_row(
                "SELECT filename, content FROM code_files \
                 WHERE user_id = ?1 ORDER BY updated_at_ms DESC, id DESC LIMIT 1",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?)
    }

    /// Distinct installed libraries for one identity, newest first.
    pub fn libraries(&self, user_id: i64) -> Result<Vec<LibraryRow>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT library_name, version, MAX(installed_at_ms) AS ts \
             FROM installed_libraries WHERE user_id = ?1 \
             GROUP BY library_name, version ORDER BY ts DESC",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(LibraryRow {
                name: row.get(0)?,
                version: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn record_library_install(
        &self,
        user_id: i64,
        library_name: &str,
        version: &str,
        command: &str,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO installed_libraries(user_id, library_name, version, command, installed_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, library_name, version, command, now_ms],
        )?;
        Ok(())
    }

    /// Append one transcript row. Command and output are truncated on
    /// character boundaries before storage.
    pub fn append_terminal_log(
        &self,
        user_id: i64,
        kind: TerminalKind,
        command: &str,
        output: &str,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO terminal_logs(user_id, terminal_type, command, output, created_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user_id,
                kind.as_str(),
                truncate_chars(command, MAX_COMMAND_CHARS),
                truncate_chars(output, MAX_OUTPUT_CHARS),
                now_ms
            ],
        )?;
        Ok(())
    }

    /// Recent transcript rows for one identity, newest first.
    pub fn terminal_logs(&self, user_id: i64, limit: usize) -> Result<Vec<TerminalLogRow>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT terminal_type, command, output FROM terminal_logs \
             WHERE user_id = ?1 ORDER BY created_at_ms DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit as i64], |row| {
            Ok(TerminalLogRow {
                terminal_type: row.get(0)?,
                command: row.get(1)?,
                output: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Outputs of the most recent `lib` transcripts, newest first. Replayed
    /// into a freshly connected live channel.
    pub fn recent_lib_outputs(&self, user_id: i64, limit: usize) -> Result<Vec<String>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT output FROM terminal_logs \
             WHERE user_id = ?1 AND terminal_type = 'lib' \
             ORDER BY created_at_ms DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit as i64], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Distinct project labels a username has logged in with.
    pub fn projects(&self, username: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT project_name FROM users \
             WHERE username = ?1 AND project_name IS NOT NULL ORDER BY project_name",
        )?;
        let rows = stmt.query_map(params![username], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Everything saved under a (username, project) pair, or None when the
    /// pair is unknown.
    pub fn export(&self, username: &str, project_name: &str) -> Result<Option<ExportData>, StoreError> {
        let conn = self.connect()?;
        let user_id = conn
            .query_row(
                "SELECT id FROM users WHERE username = ?1 AND project_name = ?2",
                params![username, project_name],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        let Some(user_id) = user_id else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT filename, content FROM code_files WHERE user_id = ?1 ORDER BY filename",
        )?;
        let code_files = stmt
            .query_map(params![user_id], |row| {
                Ok(ExportedFile {
                    filename: row.get(0)?,
                    content: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT library_name, version, MAX(installed_at_ms) AS ts \
             FROM installed_libraries WHERE user_id = ?1 \
             GROUP BY library_name, version ORDER BY ts",
        )?;
        let libraries = stmt
            .query_map(params![user_id], |row| {
                Ok(ExportedLibrary {
                    library_name: row.get(0)?,
                    version: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(ExportData {
            code_files,
            libraries,
        }))
    }

    pub fn counts(&self) -> Result<AdminCounts, StoreError> {
        let conn = self.connect()?;
        let users = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        let code_files = conn.query_row("SELECT COUNT(*) FROM code_files", [], |row| row.get(0))?;
        let distinct_libraries = conn.query_row(
            "SELECT COUNT(DISTINCT library_name) FROM installed_libraries",
            [],
            |row| row.get(0),
        )?;
        Ok(AdminCounts {
            users,
            code_files,
            distinct_libraries,
        })
    }
}

fn install_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL,
            ip_address TEXT,
            project_name TEXT,
            created_at_ms INTEGER NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_users_identity
            ON users(username, project_name);
        CREATE TABLE IF NOT EXISTS code_files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL REFERENCES users(id),
            filename TEXT NOT NULL,
            content TEXT NOT NULL,
            updated_at_ms INTEGER NOT NULL,
            UNIQUE(user_id, filename)
        );
        CREATE TABLE IF NOT EXISTS installed_libraries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL REFERENCES users(id),
            library_name TEXT NOT NULL,
            version TEXT NOT NULL,
            command TEXT NOT NULL,
            installed_at_ms INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS terminal_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL REFERENCES users(id),
            terminal_type TEXT NOT NULL,
            command TEXT NOT NULL,
            output TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        );",
    )?;
    Ok(())
}

/// Truncate on a character boundary, never splitting a code point.
fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
