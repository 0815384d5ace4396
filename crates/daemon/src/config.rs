//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// HTTP listen address
    pub listen: String,

    /// Scenario runner configuration
    pub runner: RunnerConfig,

    /// Admission and concurrency limits
    pub executor: ExecutorConfig,

    /// Extra scenarios on top of the built-in ones
    pub scenarios: Vec<ScenarioConfig>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_path: crmqa_common::default_store_path(),
            listen: "127.0.0.1:8000".to_string(),
            runner: RunnerConfig::default(),
            executor: ExecutorConfig::default(),
            scenarios: Vec::new(),
        }
    }
}

/// How scenario scripts are located and launched
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Interpreter used to run scenario scripts
    pub interpreter: String,

    /// Directory containing scenario scripts
    pub scenarios_dir: PathBuf,

    /// Deadline for a single run, in seconds
    pub task_timeout_secs: u64,

    /// Time between SIGTERM and SIGKILL when stopping a run
    pub kill_grace_ms: u64,

    /// Launcher for the Playwright CLI (`<launcher> playwright ...`)
    pub playwright_launcher: String,

    /// Browser installed by `crmqad init`
    pub browser: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            interpreter: "node".to_string(),
            scenarios_dir: PathBuf::from("scenarios"),
            task_timeout_secs: 600,
            kill_grace_ms: 2000,
            playwright_launcher: "npx".to_string(),
            browser: "chromium".to_string(),
        }
    }
}

impl RunnerConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Executor limits. Every run owns a full browser, so keep these small.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Runs allowed to execute at the same time
    pub max_concurrent: usize,

    /// Admitted runs allowed to wait for a free slot
    pub queue_depth: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            queue_depth: 8,
        }
    }
}

/// A goal -> script mapping declared in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Goal text that selects this scenario (matched case-insensitively)
    pub goal: String,

    /// Human-readable name used in result messages
    pub label: String,

    /// Script path, relative to `scenarios_dir` unless absolute
    pub script: PathBuf,
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("tasks.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.runner.interpreter, "node");
        assert_eq!(config.runner.playwright_launcher, "npx");
        assert_eq!(config.runner.browser, "chromium");
        assert_eq!(config.executor.max_concurrent, 2);
        assert!(config.scenarios.is_empty());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
listen = "0.0.0.0:9000"

[runner]
task_timeout_secs = 30

[[scenarios]]
goal = "delete customer"
label = "Delete customer"
script = "delete_customer.js"
"#,
        )
        .unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.runner.task_timeout(), Duration::from_secs(30));
        assert_eq!(config.runner.interpreter, "node");
        assert_eq!(config.executor.queue_depth, 8);
        assert_eq!(config.scenarios.len(), 1);
        assert_eq!(config.scenarios[0].label, "Delete customer");
    }
}
