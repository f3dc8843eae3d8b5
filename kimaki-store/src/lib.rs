//! SQLite persistence shared between kimakid and its worker processes.
//!
//! The `ipc_requests` table is the only mutable resource the daemon shares
//! with workers. Every status change goes through a guarded `UPDATE` so a row
//! can be claimed at most once, even with several claimers on one file.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, anyhow};
use kimaki_core::IpcRequest;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::debug;

mod blocking;
mod ipc_requests;
mod thread_sessions;

pub use blocking::run_blocking;
pub use thread_sessions::ThreadSession;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Store operations the IPC dispatcher depends on.
pub trait IpcRequestStore: Send + Sync {
    /// Move every `pending` row to `processing` and return them oldest first.
    fn claim_pending_ipc_requests(&self) -> anyhow::Result<Vec<IpcRequest>>;

    /// Write the terminal response. Returns false when the row was already
    /// terminal (or missing) and nothing changed.
    fn complete_ipc_request(&self, id: &str, response: &str) -> anyhow::Result<bool>;

    /// Cancel every `pending` or `processing` row left by a previous run.
    fn cancel_all_pending_ipc_requests(&self) -> anyhow::Result<usize>;

    /// Cancel rows stuck in `processing` for longer than `ttl`.
    fn cancel_stale_processing_requests(&self, ttl: Duration) -> anyhow::Result<usize>;
}

/// Row counts per status, for `kimakid inspect-ipc`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub cancelled: u64,
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create database directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database: {}", path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("failed to set sqlite busy timeout")?;
        let mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .context("failed to enable WAL journal")?;
        debug!(path = %path.display(), journal_mode = %mode, "sqlite opened");
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> anyhow::Result<Self> {
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection.
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> anyhow::Result<T>) -> anyhow::Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| anyhow!("sqlite connection mutex poisoned"))?;
        f(&guard)
    }
}

fn ensure_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "\
        CREATE TABLE IF NOT EXISTS ipc_requests (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          id TEXT NOT NULL UNIQUE,
          type TEXT NOT NULL,
          session_id TEXT NOT NULL,
          thread_id TEXT NOT NULL,
          payload TEXT NOT NULL DEFAULT '{}',
          response TEXT,
          status TEXT NOT NULL DEFAULT 'pending',
          created_at INTEGER NOT NULL,
          claimed_at INTEGER,
          updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_ipc_requests_status
          ON ipc_requests (status, created_at);

        CREATE TABLE IF NOT EXISTS thread_sessions (
          thread_id TEXT PRIMARY KEY,
          session_id TEXT NOT NULL,
          directory TEXT,
          updated_at INTEGER NOT NULL
        );
        ",
    )
    .context("failed to ensure sqlite schema")
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn open_creates_parent_directory_and_schema() {
        let tmp = TempDir::new().expect("create tempdir");
        let db_path = tmp.path().join("nested/dir/kimaki.db");
        let store = Store::open(&db_path).expect("open store");
        assert!(db_path.exists());
        assert_eq!(store.status_counts().unwrap(), StatusCounts::default());
    }

    #[test]
    fn schema_is_idempotent() {
        let conn = Connection::open_in_memory().expect("open in memory sqlite");
        ensure_schema(&conn).expect("first");
        ensure_schema(&conn).expect("second");
    }
}
