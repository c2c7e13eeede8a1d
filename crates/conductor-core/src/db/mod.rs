//! SQLite database layer for the Conductor coordinator.
//!
//! Uses rusqlite with WAL mode for concurrent read performance.
//! All database operations are executed via `tokio::task::spawn_blocking`
//! to avoid blocking the async runtime. The relational store is the single
//! source of truth for run/approval state; multi-row updates go through
//! explicit transactions.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::CoreError;

/// Thread-safe handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(db_path: &str) -> Result<Self, CoreError> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)
            .map_err(|e| CoreError::Database(format!("Failed to open database: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| CoreError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;

        tracing::info!("SQLite database opened at: {}", db_path);
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, CoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CoreError::Database(format!("Failed to open in-memory db: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| CoreError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    /// Automatically handles locking and error conversion.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, rusqlite::Error>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| CoreError::Database(format!("Lock poisoned: {}", e)))?;
        f(&mut conn).map_err(|e| CoreError::Database(e.to_string()))
    }

    /// Execute a closure with access to the database connection (async-friendly).
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| CoreError::Database(format!("Task join error: {}", e)))?
    }

    /// Create all tables if they don't exist.
    fn initialize_tables(&self) -> Result<(), CoreError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS workflow_runs (
                    id                  TEXT PRIMARY KEY,
                    status              TEXT NOT NULL DEFAULT 'pending',
                    max_parallel        INTEGER NOT NULL DEFAULT 4,
                    working_directory   TEXT NOT NULL DEFAULT '',
                    created_at          INTEGER NOT NULL,
                    updated_at          INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS steps (
                    run_id              TEXT NOT NULL REFERENCES workflow_runs(id) ON DELETE CASCADE,
                    id                  TEXT NOT NULL,
                    position            INTEGER NOT NULL,
                    kind                TEXT NOT NULL,
                    role                TEXT NOT NULL DEFAULT '',
                    task                TEXT NOT NULL DEFAULT '',
                    deps                TEXT NOT NULL DEFAULT '[]',
                    payload             TEXT NOT NULL DEFAULT '{}',
                    status              TEXT NOT NULL DEFAULT 'pending',
                    output              TEXT,
                    continuation_token  TEXT,
                    continue_on_error   INTEGER NOT NULL DEFAULT 0,
                    created_at          INTEGER NOT NULL,
                    updated_at          INTEGER NOT NULL,
                    PRIMARY KEY (run_id, id)
                );
                CREATE INDEX IF NOT EXISTS idx_steps_run ON steps(run_id);

                CREATE TABLE IF NOT EXISTS checkpoints (
                    id                  TEXT PRIMARY KEY,
                    run_id              TEXT NOT NULL REFERENCES workflow_runs(id) ON DELETE CASCADE,
                    frontier            TEXT NOT NULL DEFAULT '[]',
                    step_state          TEXT NOT NULL DEFAULT '{}',
                    created_at          INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_checkpoints_run ON checkpoints(run_id, created_at);

                CREATE TABLE IF NOT EXISTS approvals (
                    id                          TEXT PRIMARY KEY,
                    run_id                      TEXT NOT NULL,
                    step_id                     TEXT NOT NULL,
                    prompt                      TEXT NOT NULL,
                    context_snapshot            TEXT NOT NULL DEFAULT '{}',
                    risk_level                  TEXT NOT NULL DEFAULT 'medium',
                    requested_at                INTEGER NOT NULL,
                    timeout_seconds             INTEGER NOT NULL,
                    expires_at                  INTEGER NOT NULL,
                    status                      TEXT NOT NULL DEFAULT 'pending',
                    resolved_at                 INTEGER,
                    resolved_by                 TEXT,
                    auto_approve_after_timeout  INTEGER NOT NULL DEFAULT 0
                );
                CREATE INDEX IF NOT EXISTS idx_approvals_run ON approvals(run_id);
                CREATE INDEX IF NOT EXISTS idx_approvals_status ON approvals(status);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_approvals_open_step
                    ON approvals(run_id, step_id) WHERE status = 'pending';

                CREATE TABLE IF NOT EXISTS approval_decisions (
                    id              TEXT PRIMARY KEY,
                    approval_id     TEXT NOT NULL REFERENCES approvals(id) ON DELETE CASCADE,
                    decision        TEXT NOT NULL,
                    comment         TEXT,
                    reasoning       TEXT,
                    decided_by      TEXT NOT NULL,
                    decided_at      INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_decisions_approval ON approval_decisions(approval_id);

                CREATE TABLE IF NOT EXISTS approval_notifications (
                    id              TEXT PRIMARY KEY,
                    approval_id     TEXT NOT NULL REFERENCES approvals(id) ON DELETE CASCADE,
                    channel         TEXT NOT NULL,
                    sent_at         INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_notifications_approval
                    ON approval_notifications(approval_id);
                ",
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_creates_schema() {
        let db = Database::open_in_memory().unwrap();
        let count: i64 = db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN \
                     ('workflow_runs','steps','checkpoints','approvals','approval_decisions',\
                      'approval_notifications')",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert_eq!(count, 6);
    }

    #[test]
    fn open_on_disk_is_reusable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conductor.db").to_string_lossy().to_string();
        {
            let db = Database::open(&path).unwrap();
            db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO workflow_runs (id, status, max_parallel, created_at, updated_at) \
                     VALUES ('r1', 'running', 4, 0, 0)",
                    [],
                )
            })
            .unwrap();
        }
        let db = Database::open(&path).unwrap();
        let status: String = db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT status FROM workflow_runs WHERE id = 'r1'",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert_eq!(status, "running");
    }
}
