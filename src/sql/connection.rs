use crate::error::PilotResult;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Bootstrap statements for the learning tables. Idempotent.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS rl_policy (
    id INTEGER PRIMARY KEY,
    tool_name TEXT NOT NULL,
    context_hash TEXT NOT NULL,
    action_value REAL NOT NULL DEFAULT 0.0,
    visit_count INTEGER NOT NULL DEFAULT 0,
    last_updated TEXT NOT NULL,
    UNIQUE (tool_name, context_hash)
);
CREATE INDEX IF NOT EXISTS idx_rl_policy_tool ON rl_policy (tool_name);

CREATE TABLE IF NOT EXISTS rl_episodes (
    id INTEGER PRIMARY KEY,
    session_id TEXT NOT NULL,
    episode_reward REAL NOT NULL DEFAULT 0.0,
    tool_sequence TEXT NOT NULL DEFAULT '[]',
    outcome TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rl_episodes_session ON rl_episodes (session_id);
CREATE INDEX IF NOT EXISTS idx_rl_episodes_outcome ON rl_episodes (outcome);

CREATE TABLE IF NOT EXISTS rl_tool_sequences (
    id INTEGER PRIMARY KEY,
    sequence_key TEXT NOT NULL UNIQUE,
    count INTEGER NOT NULL DEFAULT 1,
    avg_reward REAL NOT NULL DEFAULT 0.0,
    success_rate REAL NOT NULL DEFAULT 0.0,
    last_seen TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rl_metrics (
    id INTEGER PRIMARY KEY,
    timestamp TEXT NOT NULL,
    metric_name TEXT NOT NULL,
    metric_value REAL NOT NULL,
    extra_data TEXT
);
CREATE INDEX IF NOT EXISTS idx_rl_metrics_name ON rl_metrics (metric_name);
";

/// Represents a database connection
#[derive(Debug, Clone)]
pub struct DbConnection {
    /// Path to the database file
    path: PathBuf,
    /// Connection to the database
    connection: Arc<Mutex<Connection>>,
}

/// Type of database connection
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConnectionType {
    /// In-memory database
    Memory,
    /// File-based database
    File,
}

impl DbConnection {
    /// Open a new database connection
    pub fn open(path: Option<impl AsRef<Path>>) -> PilotResult<Self> {
        match path {
            Some(path) => {
                let path_buf = PathBuf::from(path.as_ref());
                debug!("Opening database connection to {}", path_buf.display());

                let conn = Connection::open(&path_buf)?;

                Ok(Self {
                    path: path_buf,
                    connection: Arc::new(Mutex::new(conn)),
                })
            }
            None => {
                debug!("Opening in-memory database connection");

                let conn = Connection::open_in_memory()?;

                Ok(Self {
                    path: PathBuf::from(":memory:"),
                    connection: Arc::new(Mutex::new(conn)),
                })
            }
        }
    }

    /// Get the connection type
    pub fn connection_type(&self) -> ConnectionType {
        if self.path.to_string_lossy() == ":memory:" {
            ConnectionType::Memory
        } else {
            ConnectionType::File
        }
    }

    /// Create the learning tables and indices if they do not exist yet
    pub fn initialize_schema(&self) -> PilotResult<()> {
        debug!("Ensuring learning tables exist");

        let conn = self.connection.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Run a closure against the underlying connection while holding its
    /// lock. Everything inside the closure is atomic with respect to other
    /// users of this handle.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> PilotResult<T> {
        let conn = self.connection.lock().unwrap();
        Ok(f(&conn)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_in_memory_connection() {
        let conn = DbConnection::open(None::<&str>).unwrap();
        assert_eq!(conn.connection_type(), ConnectionType::Memory);
        conn.initialize_schema().unwrap();

        let count: i64 = conn
            .with_conn(|c| {
                c.query_row("SELECT COUNT(*) FROM rl_policy", [], |row| row.get(0))
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_file_connection() {
        let file = NamedTempFile::new().unwrap();
        let conn = DbConnection::open(Some(file.path())).unwrap();
        assert_eq!(conn.connection_type(), ConnectionType::File);
        conn.initialize_schema().unwrap();

        conn.with_conn(|c| {
            c.execute(
                "INSERT INTO rl_policy (tool_name, context_hash, action_value, visit_count, last_updated)
                 VALUES ('get_members', 'abc', 1.5, 1, '2025-01-01T00:00:00Z')",
                [],
            )
        })
        .unwrap();

        let value: f64 = conn
            .with_conn(|c| {
                c.query_row(
                    "SELECT action_value FROM rl_policy WHERE tool_name = 'get_members'",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert!((value - 1.5).abs() < 1e-9);
    }

    #[test]
    fn schema_bootstrap_is_idempotent() {
        let conn = DbConnection::open(None::<&str>).unwrap();
        conn.initialize_schema().unwrap();
        conn.initialize_schema().unwrap();
    }
}
