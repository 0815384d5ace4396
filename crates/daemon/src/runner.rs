//! Scenario process management
//!
//! Launches a scenario script for a task, streams its output into the task
//! log and maps the exit code to a terminal status. The runner never returns
//! an error: every failure ends up as a `failed` task with a readable result.

use crate::config::RunnerConfig;
use crate::scenario::{Scenario, ScenarioRegistry, DEFAULT_GOAL};
use crate::state::StateManager;
use crmqa_common::{TaskParameters, TaskState, DEFAULT_TARGET_URL};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const SUCCESS_MESSAGE: &str = "Test completed successfully";

/// What a task asks the runner to do
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub goal: Option<String>,
    #[serde(default)]
    pub headless: bool,
    #[serde(default = "default_url")]
    pub url: String,
}

fn default_url() -> String {
    DEFAULT_TARGET_URL.to_string()
}

impl RunRequest {
    /// Parameters recorded on the task
    pub fn parameters(&self) -> TaskParameters {
        let mut params = TaskParameters::new();
        params.insert("url".into(), self.url.clone().into());
        params.insert("headless".into(), self.headless.into());
        params.insert(
            "goal".into(),
            self.goal
                .clone()
                .map(serde_json::Value::from)
                .unwrap_or(serde_json::Value::Null),
        );
        params
    }
}

/// Orchestration failures
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Failed to locate the script: {}", .0.display())]
    ScriptNotFound(PathBuf),

    #[error("Failed to launch {interpreter}")]
    Spawn {
        interpreter: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Error running subprocess: {0}")]
    Io(#[from] std::io::Error),

    #[error("Test timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Test cancelled")]
    Cancelled,
}

enum Interrupt {
    Deadline,
    Cancelled,
}

/// Runs scenario scripts on behalf of tasks
pub struct TaskRunner {
    state: StateManager,
    scenarios: ScenarioRegistry,
    config: RunnerConfig,
}

impl TaskRunner {
    pub fn new(state: StateManager, scenarios: ScenarioRegistry, config: RunnerConfig) -> Self {
        Self {
            state,
            scenarios,
            config,
        }
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    /// Run a task to completion. Returns 0 when the scenario passed, 1 otherwise.
    pub async fn run(&self, task_id: &str, request: &RunRequest, cancel: &CancellationToken) -> i32 {
        let goal = request.goal.as_deref().unwrap_or(DEFAULT_GOAL);
        info!("Starting task {} for goal '{}' at {}", task_id, goal, request.url);

        self.state.ensure_task(task_id, &request.parameters());
        self.log(task_id, format!("Starting test for goal: {}", goal));

        match self.execute(task_id, request, cancel).await {
            Ok(code) => code,
            Err(e) => {
                self.fail(task_id, &e);
                1
            }
        }
    }

    async fn execute(
        &self,
        task_id: &str,
        request: &RunRequest,
        cancel: &CancellationToken,
    ) -> Result<i32, RunError> {
        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        let scenario = self.scenarios.resolve(request.goal.as_deref());
        self.log(
            task_id,
            format!(
                "Setting up test with URL: {}, headless: {}",
                request.url, request.headless
            ),
        );
        self.log(task_id, format!("Selected scenario: {}", scenario.label));

        let script = scenario.script_path(&self.config.scenarios_dir);
        self.log(task_id, format!("Using interpreter: {}", self.config.interpreter));
        self.log(task_id, format!("Script path: {}", script.display()));

        match tokio::fs::metadata(&script).await {
            Ok(meta) if meta.is_file() => {
                self.log(task_id, "Script exists");
                self.log(task_id, format!("Script size: {} bytes", meta.len()));
            }
            _ => {
                self.log(task_id, "Script does not exist");
                return Err(RunError::ScriptNotFound(script));
            }
        }

        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        self.state.update_status(task_id, TaskState::Running, None);

        let mut command = Command::new(&self.config.interpreter);
        command
            .arg(&script)
            .env("TEST_URL", &request.url)
            .env("TEST_HEADLESS", request.headless.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so the browsers a scenario starts are stopped with it
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| RunError::Spawn {
            interpreter: self.config.interpreter.clone(),
            source,
        })?;

        debug!("Task {} launched scenario (pid {:?})", task_id, child.id());

        // stderr is drained on its own task so it survives an interrupted run
        let stderr = tokio::spawn(read_to_end(child.stderr.take()));

        let timeout = self.config.task_timeout();
        let outcome = {
            let supervised = self.supervise(task_id, &mut child);
            tokio::select! {
                result = supervised => Ok(result),
                _ = tokio::time::sleep(timeout) => Err(Interrupt::Deadline),
                _ = cancel.cancelled() => Err(Interrupt::Cancelled),
            }
        };

        let status = match outcome {
            Ok(result) => {
                self.log_stderr(task_id, stderr).await;
                result?
            }
            Err(interrupt) => {
                self.terminate(task_id, &mut child).await;
                self.log_stderr(task_id, stderr).await;
                return Err(match interrupt {
                    Interrupt::Deadline => RunError::Timeout {
                        seconds: timeout.as_secs(),
                    },
                    Interrupt::Cancelled => RunError::Cancelled,
                });
            }
        };

        Ok(self.finish(task_id, scenario, status))
    }

    /// Stream stdout into the task log and wait for exit
    async fn supervise(&self, task_id: &str, child: &mut Child) -> Result<ExitStatus, RunError> {
        let stdout = child.stdout.take();
        self.stream_lines(task_id, stdout).await?;
        Ok(child.wait().await?)
    }

    /// Append whatever the scenario wrote to stderr as one entry
    async fn log_stderr(&self, task_id: &str, mut reader: JoinHandle<std::io::Result<String>>) {
        let stderr = match tokio::time::timeout(self.config.kill_grace(), &mut reader).await {
            Ok(Ok(Ok(text))) => text,
            Ok(Ok(Err(e))) => {
                warn!("Failed to read stderr for task {}: {}", task_id, e);
                return;
            }
            Ok(Err(e)) => {
                warn!("stderr reader for task {} panicked: {}", task_id, e);
                return;
            }
            Err(_) => {
                // A leftover process still holds the pipe open
                warn!("Gave up waiting for stderr of task {}", task_id);
                reader.abort();
                return;
            }
        };

        if !stderr.trim().is_empty() {
            self.log(task_id, format!("STDERR:\n{}", stderr.trim_end()));
        }
    }

    async fn stream_lines<R>(&self, task_id: &str, stream: Option<R>) -> Result<(), RunError>
    where
        R: AsyncRead + Unpin,
    {
        let Some(stream) = stream else {
            return Ok(());
        };

        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim();
            if !line.is_empty() {
                self.state.append_log(task_id, line);
            }
        }

        Ok(())
    }

    fn finish(&self, task_id: &str, scenario: &Scenario, status: ExitStatus) -> i32 {
        // Killed by a signal: no exit code
        let code = status.code().unwrap_or(-1);
        self.log(task_id, format!("Process completed with return code: {}", code));

        if code == 0 {
            info!("Task {} passed", task_id);
            self.state
                .update_status(task_id, TaskState::Completed, Some(SUCCESS_MESSAGE));
            0
        } else {
            let message = format!("{} test failed with return code {}", scenario.label, code);
            warn!("Task {}: {}", task_id, message);
            self.state
                .update_status(task_id, TaskState::Failed, Some(&message));
            1
        }
    }

    fn fail(&self, task_id: &str, err: &RunError) {
        let message = format!("Error during test: {}", err);
        error!("Task {}: {}", task_id, message);

        self.log(task_id, &message);
        self.log(task_id, error_report(err));
        self.state
            .update_status(task_id, TaskState::Failed, Some(&message));
    }

    /// SIGTERM to the scenario's process group, a grace period, then SIGKILL
    async fn terminate(&self, task_id: &str, child: &mut Child) {
        info!("Stopping scenario for task {}", task_id);

        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                let group = Pid::from_raw(pid as i32);
                let mut exited = false;
                if killpg(group, Signal::SIGTERM).is_ok() {
                    let grace = self.config.kill_grace();
                    if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
                        debug!("Scenario for task {} exited: {}", task_id, status);
                        exited = true;
                    }
                }
                // Whatever is left of the group after the grace period
                let _ = killpg(group, Signal::SIGKILL);
                if exited {
                    return;
                }
            }
        }

        if let Err(e) = child.kill().await {
            warn!("Failed to kill scenario for task {}: {}", task_id, e);
        }
    }

    fn log(&self, task_id: &str, message: impl AsRef<str>) {
        self.state.append_log(task_id, message.as_ref());
    }
}

async fn read_to_end<R>(stream: Option<R>) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = Vec::new();
    if let Some(mut stream) = stream {
        stream.read_to_end(&mut bytes).await?;
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Error and its sources, one per line
fn error_report(err: &dyn std::error::Error) -> String {
    let mut report = format!("Traceback:\n  0: {}", err);
    let mut source = err.source();
    let mut depth = 1;
    while let Some(cause) = source {
        report.push_str(&format!("\n  {}: {}", depth, cause));
        source = cause.source();
        depth += 1;
    }
    report
}
