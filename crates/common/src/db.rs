//! SQLite database for crmqa task persistence
//!
//! Two tables:
//! - `tasks`: one row per task (status, result, parameters, timestamps)
//! - `task_logs`: one row per log line, ordered by its autoincrement id
//!
//! Every mutation runs in a single transaction and creates the task row if it
//! is missing, so writers never need a separate existence check.

use crate::types::{LogEntry, Task, TaskParameters, TaskState};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Database wrapper for task persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Expose the underlying connection for maintenance and tests.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                result TEXT,
                parameters TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks(created_at);

            CREATE TABLE IF NOT EXISTS task_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                message TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_task_logs_task ON task_logs(task_id);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Create a task in `pending` state.
    ///
    /// An existing task with the same id is reset to `pending` and its
    /// parameters replaced; logs and result are left alone. Returns `true`
    /// when an existing row was overwritten.
    pub fn create_task(&self, id: &str, parameters: &TaskParameters) -> Result<bool> {
        let mut conn = self.conn.lock();
        let now = Utc::now().timestamp_millis();
        let parameters = serde_json::to_string(parameters)?;

        let tx = conn.transaction()?;
        let existed: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO tasks (id, status, result, parameters, created_at, updated_at)
             VALUES (?1, ?2, NULL, ?3, ?4, ?4)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                parameters = excluded.parameters,
                updated_at = excluded.updated_at",
            params![id, TaskState::Pending.as_str(), parameters, now],
        )?;
        tx.commit()?;

        if existed {
            warn!("Task {} already exists, reset to pending", id);
        } else {
            debug!("Created task {}", id);
        }
        Ok(existed)
    }

    /// Create a `pending` task unless one with this id exists.
    /// Returns `true` when a row was inserted.
    pub fn ensure_task(&self, id: &str, parameters: &TaskParameters) -> Result<bool> {
        let conn = self.conn.lock();
        let now = Utc::now().timestamp_millis();
        let parameters = serde_json::to_string(parameters)?;

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO tasks (id, status, result, parameters, created_at, updated_at)
             VALUES (?1, ?2, NULL, ?3, ?4, ?4)",
            params![id, TaskState::Pending.as_str(), parameters, now],
        )?;
        Ok(inserted > 0)
    }

    /// Move a task to `status`, optionally recording a result message.
    ///
    /// A missing task is created first. The move is checked against
    /// [`TaskState::can_transition_to`]; illegal moves leave the row untouched
    /// and return [`Error::InvalidStateTransition`]. Returns the previous state.
    pub fn update_status(
        &self,
        id: &str,
        status: TaskState,
        result: Option<&str>,
    ) -> Result<TaskState> {
        let mut conn = self.conn.lock();
        let now = Utc::now().timestamp_millis();

        let tx = conn.transaction()?;
        insert_missing(&tx, id, "{}", now)?;

        let current: String = tx.query_row(
            "SELECT status FROM tasks WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        let current: TaskState = current.parse()?;

        if !current.can_transition_to(status) {
            // Keep the self-healed row even though the move is refused.
            tx.commit()?;
            return Err(Error::InvalidStateTransition {
                from: current.to_string(),
                to: status.to_string(),
            });
        }

        tx.execute(
            "UPDATE tasks SET status = ?1, result = COALESCE(?2, result), updated_at = ?3
             WHERE id = ?4",
            params![status.as_str(), result, now, id],
        )?;
        tx.commit()?;

        debug!("Task {} {} -> {}", id, current, status);
        Ok(current)
    }

    /// Append one log line to a task, creating the task if it is missing
    pub fn append_log(&self, id: &str, message: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let now = Utc::now().timestamp_millis();

        let tx = conn.transaction()?;
        insert_missing(&tx, id, "{}", now)?;
        tx.execute(
            "INSERT INTO task_logs (task_id, timestamp, message) VALUES (?1, ?2, ?3)",
            params![id, now, message],
        )?;
        tx.execute(
            "UPDATE tasks SET updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        tx.commit()?;

        Ok(())
    }

    /// Fail every `pending` or `running` task with `result`, appending the
    /// same text to its log. Returns the ids that were closed.
    pub fn fail_unfinished(&self, result: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.lock();
        let now = Utc::now().timestamp_millis();

        let tx = conn.transaction()?;
        let ids = {
            let mut stmt = tx.prepare(
                "SELECT id FROM tasks WHERE status IN (?1, ?2) ORDER BY created_at, rowid",
            )?;
            let ids = stmt
                .query_map(
                    params![TaskState::Pending.as_str(), TaskState::Running.as_str()],
                    |row| row.get::<_, String>(0),
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };

        for id in &ids {
            tx.execute(
                "UPDATE tasks SET status = ?1, result = ?2, updated_at = ?3 WHERE id = ?4",
                params![TaskState::Failed.as_str(), result, now, id],
            )?;
            tx.execute(
                "INSERT INTO task_logs (task_id, timestamp, message) VALUES (?1, ?2, ?3)",
                params![id, now, result],
            )?;
        }
        tx.commit()?;

        Ok(ids)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Get a task by ID, logs included
    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.conn.lock();

        let row = conn
            .query_row(
                "SELECT id, status, result, parameters, created_at, updated_at
                 FROM tasks WHERE id = ?1",
                params![id],
                RawRow::from_row,
            )
            .optional()?;

        match row {
            Some(raw) => {
                let logs = load_logs(&conn, &raw.id)?;
                Ok(Some(raw.parse(logs)?))
            }
            None => Ok(None),
        }
    }

    /// List all tasks, newest first
    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT id, status, result, parameters, created_at, updated_at
             FROM tasks ORDER BY created_at DESC, rowid DESC",
        )?;
        let rows = stmt
            .query_map([], RawRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut tasks = Vec::with_capacity(rows.len());
        for raw in rows {
            let logs = load_logs(&conn, &raw.id)?;
            tasks.push(raw.parse(logs)?);
        }

        Ok(tasks)
    }
}

/// Insert a `pending` row for `id` unless one exists
fn insert_missing(conn: &Connection, id: &str, parameters: &str, now: i64) -> Result<()> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO tasks (id, status, result, parameters, created_at, updated_at)
         VALUES (?1, ?2, NULL, ?3, ?4, ?4)",
        params![id, TaskState::Pending.as_str(), parameters, now],
    )?;
    if inserted > 0 {
        warn!("Task {} not found, created it", id);
    }
    Ok(())
}

fn load_logs(conn: &Connection, task_id: &str) -> Result<Vec<LogEntry>> {
    let mut stmt = conn.prepare_cached(
        "SELECT timestamp, message FROM task_logs WHERE task_id = ?1 ORDER BY id ASC",
    )?;
    let logs = stmt
        .query_map(params![task_id], |row| {
            Ok(LogEntry {
                timestamp: from_millis(row.get(0)?),
                message: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(logs)
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

/// Raw database row before parsing
struct RawRow {
    id: String,
    status: String,
    result: Option<String>,
    parameters: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawRow {
            id: row.get(0)?,
            status: row.get(1)?,
            result: row.get(2)?,
            parameters: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    fn parse(self, logs: Vec<LogEntry>) -> Result<Task> {
        let parameters = match self.parameters.as_deref() {
            None | Some("") => TaskParameters::new(),
            Some(text) => serde_json::from_str(text).unwrap_or_else(|e| {
                warn!("Malformed parameters for task {}: {}", self.id, e);
                TaskParameters::new()
            }),
        };

        Ok(Task {
            status: self.status.parse()?,
            id: self.id,
            result: self.result,
            logs,
            parameters,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        })
    }
}
