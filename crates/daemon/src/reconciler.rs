//! Startup reconciliation
//!
//! A task that is `pending` or `running` in the store but has no run in this
//! process was orphaned by an earlier daemon. Such tasks are failed once at
//! startup, before the API accepts requests.

use crate::state::StateManager;
use tracing::{error, info, warn};

/// Result recorded on tasks interrupted by a daemon restart
pub const RESTART_MESSAGE: &str = "Error during test: Daemon restarted before the test finished";

/// Brings stored task state in line with what this process is running
pub struct Reconciler {
    state: StateManager,
}

impl Reconciler {
    pub fn new(state: StateManager) -> Self {
        Self { state }
    }

    /// Fail every unfinished task. Returns how many were closed.
    pub fn reconcile_startup(&self) -> usize {
        match self.state.db().fail_unfinished(RESTART_MESSAGE) {
            Ok(ids) => {
                for id in &ids {
                    warn!("Task {} was interrupted by a restart", id);
                }
                if !ids.is_empty() {
                    info!("Reconciled {} unfinished tasks", ids.len());
                }
                ids.len()
            }
            Err(e) => {
                error!("Reconciliation error: {}", e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crmqa_common::{Database, TaskParameters, TaskState};

    #[test]
    fn test_restart_fails_orphaned_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");

        {
            let state = StateManager::with_database(Database::open(&path).unwrap());
            for id in ["stale", "queued", "done"] {
                state.create_task(id, &TaskParameters::new());
            }
            state.update_status("stale", TaskState::Running, None);
            state.update_status("done", TaskState::Running, None);
            state.update_status("done", TaskState::Completed, Some("Test completed successfully"));
        }

        let state = StateManager::with_database(Database::open(&path).unwrap());
        assert_eq!(Reconciler::new(state.clone()).reconcile_startup(), 2);

        for id in ["stale", "queued"] {
            let task = state.get_task(id).unwrap();
            assert_eq!(task.status, TaskState::Failed);
            assert_eq!(task.result.as_deref(), Some(RESTART_MESSAGE));
            assert_eq!(task.logs.last().unwrap().message, RESTART_MESSAGE);
        }
        assert_eq!(state.get_task("done").unwrap().status, TaskState::Completed);

        // A second pass has nothing left to do
        assert_eq!(Reconciler::new(state).reconcile_startup(), 0);
    }
}
