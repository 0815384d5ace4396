//! Bounded task executor
//!
//! Every admitted task gets its own tokio task, but only `max_concurrent` of
//! them may hold a run slot at once. Up to `queue_depth` more wait for a slot
//! while staying `pending`; anything beyond that is refused at admission.

use crate::config::ExecutorConfig;
use crate::runner::{RunRequest, TaskRunner};
use crmqa_common::{Error, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// A reserved place in the executor. Released when dropped.
pub struct Admission {
    admitted: Arc<AtomicUsize>,
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.admitted.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs admitted tasks with bounded concurrency
#[derive(Clone)]
pub struct TaskExecutor {
    runner: Arc<TaskRunner>,
    slots: Arc<Semaphore>,
    capacity: usize,
    admitted: Arc<AtomicUsize>,
    /// Cancellation handles for queued and running tasks
    active: Arc<DashMap<String, CancellationToken>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl TaskExecutor {
    pub fn new(runner: Arc<TaskRunner>, config: &ExecutorConfig) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            runner,
            slots: Arc::new(Semaphore::new(max_concurrent)),
            capacity: max_concurrent + config.queue_depth,
            admitted: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Reserve room for one more task, or refuse with [`Error::QueueFull`]
    pub fn admit(&self) -> Result<Admission> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let previous = self.admitted.fetch_add(1, Ordering::SeqCst);
        if previous >= self.capacity {
            self.admitted.fetch_sub(1, Ordering::SeqCst);
            warn!("Refusing task: {} tasks already admitted", previous);
            return Err(Error::QueueFull {
                capacity: self.capacity,
            });
        }

        Ok(Admission {
            admitted: self.admitted.clone(),
        })
    }

    /// Number of tasks currently queued or running
    pub fn admitted(&self) -> usize {
        self.admitted.load(Ordering::SeqCst)
    }

    /// Start an admitted task in the background. The returned handle yields
    /// the runner's exit code; callers are free to drop it.
    pub fn spawn(&self, admission: Admission, task_id: String, request: RunRequest) -> JoinHandle<i32> {
        let token = self.shutdown.child_token();
        self.active.insert(task_id.clone(), token.clone());
        debug!("Task {} admitted ({} in flight)", task_id, self.admitted());

        let this = self.clone();
        self.tracker.spawn(async move {
            let _admission = admission;

            // `None` means cancelled while queued; the runner then records
            // the failure without launching anything.
            let _slot = this.acquire_slot(&token).await;
            let code = this.runner.run(&task_id, &request, &token).await;

            this.active.remove(&task_id);
            code
        })
    }

    async fn acquire_slot(&self, token: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            permit = self.slots.clone().acquire_owned() => permit.ok(),
            _ = token.cancelled() => None,
        }
    }

    /// Signal a queued or running task to stop. Returns `false` if this
    /// executor does not know the task or its run has already finished.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.active.get(task_id) {
            // The run can record its outcome just before leaving `active`
            Some(_) if self.is_finished(task_id) => false,
            Some(token) => {
                info!("Cancelling task {}", task_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn is_finished(&self, task_id: &str) -> bool {
        self.runner
            .state()
            .get_task(task_id)
            .map_or(false, |task| task.status.is_terminal())
    }

    /// Cancel everything and wait (up to `grace`) for runs to wind down
    pub async fn shutdown(&self, grace: Duration) {
        info!("Stopping executor ({} tasks in flight)", self.admitted());
        self.shutdown.cancel();
        self.tracker.close();

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!("Executor did not drain within {:?}", grace);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{RunnerConfig, ScenarioConfig};
    use crate::scenario::ScenarioRegistry;
    use crate::state::StateManager;
    use crmqa_common::{Database, TaskState};

    fn executor(script: &str, config: ExecutorConfig) -> (tempfile::TempDir, StateManager, TaskExecutor) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("scenario.sh"), script).unwrap();

        let scenarios = ScenarioRegistry::with_configured(&[ScenarioConfig {
            goal: "add customer".into(),
            label: "Add customer".into(),
            script: "scenario.sh".into(),
        }]);
        let runner_config = RunnerConfig {
            interpreter: "sh".into(),
            scenarios_dir: dir.path().to_path_buf(),
            task_timeout_secs: 60,
            kill_grace_ms: 200,
            ..RunnerConfig::default()
        };

        let state = StateManager::with_database(Database::open_memory().unwrap());
        let runner = Arc::new(TaskRunner::new(state.clone(), scenarios, runner_config));
        (dir, state, TaskExecutor::new(runner, &config))
    }

    fn request() -> RunRequest {
        serde_json::from_str(r#"{"goal": "add customer", "headless": true}"#).unwrap()
    }

    #[tokio::test]
    async fn test_admission_is_bounded() {
        let (_dir, _state, exec) = executor(
            "exit 0\n",
            ExecutorConfig {
                max_concurrent: 1,
                queue_depth: 1,
            },
        );

        let first = exec.admit().unwrap();
        let second = exec.admit().unwrap();
        assert!(matches!(exec.admit(), Err(Error::QueueFull { capacity: 2 })));
        assert_eq!(exec.admitted(), 2);

        drop(first);
        assert_eq!(exec.admitted(), 1);
        let _third = exec.admit().unwrap();
        drop(second);
    }

    #[tokio::test]
    async fn test_spawned_task_completes_and_releases() {
        let (_dir, state, exec) = executor("echo hi\nexit 0\n", ExecutorConfig::default());

        let admission = exec.admit().unwrap();
        let req = request();
        state.create_task("t-1", &req.parameters());
        let code = exec.spawn(admission, "t-1".into(), req).await.unwrap();

        assert_eq!(code, 0);
        assert_eq!(exec.admitted(), 0);
        assert!(!exec.cancel("t-1"));
        assert_eq!(state.get_task("t-1").unwrap().status, TaskState::Completed);
    }

    #[tokio::test]
    async fn test_cancel_refuses_finished_run() {
        let (_dir, state, exec) = executor("exit 0\n", ExecutorConfig::default());

        // A run that has stored its outcome but not yet left the registry
        let token = CancellationToken::new();
        exec.active.insert("t-1".into(), token.clone());
        state.update_status("t-1", TaskState::Running, None);
        state.update_status("t-1", TaskState::Completed, Some("Test completed successfully"));

        assert!(!exec.cancel("t-1"));
        assert!(!token.is_cancelled());

        exec.active.insert("t-2".into(), CancellationToken::new());
        state.update_status("t-2", TaskState::Running, None);
        assert!(exec.cancel("t-2"));
    }

    #[tokio::test]
    async fn test_queued_task_waits_for_slot_and_can_be_cancelled() {
        let (_dir, state, exec) = executor(
            "exec sleep 30\n",
            ExecutorConfig {
                max_concurrent: 1,
                queue_depth: 4,
            },
        );

        for id in ["busy", "queued"] {
            state.create_task(id, &request().parameters());
        }

        let running = exec.spawn(exec.admit().unwrap(), "busy".into(), request());
        for _ in 0..100 {
            if state.get_task("busy").unwrap().status == TaskState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let queued = exec.spawn(exec.admit().unwrap(), "queued".into(), request());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(state.get_task("queued").unwrap().status, TaskState::Pending);

        assert!(exec.cancel("queued"));
        assert_eq!(queued.await.unwrap(), 1);
        let task = state.get_task("queued").unwrap();
        assert_eq!(task.status, TaskState::Failed);
        assert_eq!(task.result.as_deref(), Some("Error during test: Test cancelled"));

        exec.shutdown(Duration::from_secs(5)).await;
        assert_eq!(running.await.unwrap(), 1);
        assert_eq!(state.get_task("busy").unwrap().status, TaskState::Failed);
        assert!(matches!(exec.admit(), Err(Error::ShuttingDown)));
    }
}
