//! State management for the daemon
//!
//! [`StateManager`] is the task lifecycle's view of the store. Storage faults
//! are logged and turned into neutral values so a broken write never takes a
//! running task down with it. Request handlers that must report faults use
//! [`StateManager::db`] directly.

use crate::config::DaemonConfig;
use crmqa_common::{Database, Error, Result, Task, TaskParameters, TaskState};
use tracing::{debug, error, info, warn};

/// State manager for task records
#[derive(Clone)]
pub struct StateManager {
    db: Database,
}

impl StateManager {
    /// Create a new state manager backed by the configured database
    pub fn new(config: &DaemonConfig) -> Result<Self> {
        let db = Database::open(config.db_path())?;
        info!("Task store ready at {}", config.db_path().display());
        Ok(Self { db })
    }

    /// Wrap an already opened database
    pub fn with_database(db: Database) -> Self {
        Self { db }
    }

    /// Get database
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Create (or reset) a task. Returns `false` if the store failed.
    pub fn create_task(&self, id: &str, parameters: &TaskParameters) -> bool {
        match self.db.create_task(id, parameters) {
            Ok(_) => true,
            Err(e) => {
                error!("Failed to create task {}: {}", id, e);
                false
            }
        }
    }

    /// Create the task only if it is not already stored
    pub fn ensure_task(&self, id: &str, parameters: &TaskParameters) {
        match self.db.ensure_task(id, parameters) {
            Ok(true) => debug!("Task {} created by its runner", id),
            Ok(false) => {}
            Err(e) => error!("Failed to ensure task {}: {}", id, e),
        }
    }

    /// Move a task to `status`. Returns `false` if the move was refused or failed.
    pub fn update_status(&self, id: &str, status: TaskState, result: Option<&str>) -> bool {
        match self.db.update_status(id, status, result) {
            Ok(_) => {
                info!("Task {} is now {}", id, status);
                true
            }
            Err(e @ Error::InvalidStateTransition { .. }) => {
                warn!("Refused status change for task {}: {}", id, e);
                false
            }
            Err(e) => {
                error!("Failed to update task {}: {}", id, e);
                false
            }
        }
    }

    /// Append a log line to a task
    pub fn append_log(&self, id: &str, message: &str) {
        if let Err(e) = self.db.append_log(id, message) {
            error!("Failed to append log to task {}: {}", id, e);
            return;
        }

        let lower = message.to_lowercase();
        if lower.contains("error") || lower.contains("fail") || lower.contains("success") {
            info!("Task {} log: {}", id, message);
        }
    }

    /// Get a task, `None` if absent or unreadable
    pub fn get_task(&self, id: &str) -> Option<Task> {
        match self.db.get_task(id) {
            Ok(task) => task,
            Err(e) => {
                error!("Failed to read task {}: {}", id, e);
                None
            }
        }
    }

    /// List all tasks newest first, empty if unreadable
    pub fn list_tasks(&self) -> Vec<Task> {
        match self.db.list_tasks() {
            Ok(tasks) => tasks,
            Err(e) => {
                error!("Failed to list tasks: {}", e);
                Vec::new()
            }
        }
    }
}
