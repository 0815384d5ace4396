//! Scenario toolchain checks
//!
//! Scenarios need the script interpreter, the Playwright package and a
//! downloaded browser. `crmqad init` installs the browser; `crmqad` checks
//! the toolchain at startup and warns when something is missing.

use crate::config::RunnerConfig;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Toolchain failures
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("{program} is not available")]
    Missing {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with code {code}: {stderr}")]
    Failed {
        command: String,
        code: i32,
        stderr: String,
    },
}

/// Versions reported by a healthy toolchain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolVersions {
    pub interpreter: String,
    pub playwright: String,
}

/// The programs scenario runs depend on
pub struct Toolchain {
    interpreter: String,
    launcher: String,
    browser: String,
    scenarios_dir: PathBuf,
}

impl Toolchain {
    pub fn new(config: &RunnerConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            launcher: config.playwright_launcher.clone(),
            browser: config.browser.clone(),
            scenarios_dir: config.scenarios_dir.clone(),
        }
    }

    /// Verify the interpreter and the Playwright CLI both run
    pub async fn check(&self) -> Result<ToolVersions, SetupError> {
        let interpreter = self.run(&self.interpreter, &["--version"]).await?;
        let playwright = self.run(&self.launcher, &["playwright", "--version"]).await?;
        Ok(ToolVersions {
            interpreter,
            playwright,
        })
    }

    /// Download the browser the scenarios launch
    pub async fn install_browser(&self) -> Result<(), SetupError> {
        info!("Installing Playwright browser: {}", self.browser);
        self.run(&self.launcher, &["playwright", "install", &self.browser])
            .await?;
        info!("Playwright browser installed");
        Ok(())
    }

    /// Run a tool to completion and return the first line of its stdout
    async fn run(&self, program: &str, args: &[&str]) -> Result<String, SetupError> {
        let mut command = Command::new(program);
        command
            .args(args)
            .env("npm_config_yes", "true")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Lets npx find the Playwright package installed next to the scenarios
        if self.scenarios_dir.is_dir() {
            command.current_dir(&self.scenarios_dir);
        }

        let rendered = format!("{} {}", program, args.join(" "));
        debug!("Running {}", rendered);

        let output = command.output().await.map_err(|source| SetupError::Missing {
            program: program.to_string(),
            source,
        })?;

        if !output.status.success() {
            return Err(SetupError::Failed {
                command: rendered,
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    /// `sh` stands in for npx and runs a fake `playwright` script from the
    /// scenarios directory
    fn toolchain(dir: &std::path::Path, fake_playwright: &str) -> Toolchain {
        std::fs::write(dir.join("playwright"), fake_playwright).unwrap();
        Toolchain::new(&RunnerConfig {
            interpreter: "true".into(),
            playwright_launcher: "sh".into(),
            scenarios_dir: dir.to_path_buf(),
            ..RunnerConfig::default()
        })
    }

    const FAKE_PLAYWRIGHT: &str = r#"case "$1" in
  --version) echo "Version 1.41.2" ;;
  install) echo "$@" > installed.txt ;;
  *) exit 2 ;;
esac
"#;

    #[tokio::test]
    async fn test_check_reports_playwright_version() {
        let dir = tempfile::tempdir().unwrap();
        let tools = toolchain(dir.path(), FAKE_PLAYWRIGHT);

        let versions = tools.check().await.unwrap();
        assert_eq!(versions.playwright, "Version 1.41.2");
    }

    #[tokio::test]
    async fn test_install_downloads_configured_browser() {
        let dir = tempfile::tempdir().unwrap();
        let tools = toolchain(dir.path(), FAKE_PLAYWRIGHT);

        tools.install_browser().await.unwrap();
        let args = std::fs::read_to_string(dir.path().join("installed.txt")).unwrap();
        assert_eq!(args.trim(), "install chromium");
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut tools = toolchain(dir.path(), FAKE_PLAYWRIGHT);
        tools.interpreter = "/nonexistent/node".into();

        match tools.check().await {
            Err(SetupError::Missing { program, .. }) => assert_eq!(program, "/nonexistent/node"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_install_keeps_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let tools = toolchain(dir.path(), "echo 'browser download failed' >&2\nexit 3\n");

        match tools.install_browser().await {
            Err(SetupError::Failed { code, stderr, .. }) => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "browser download failed");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
