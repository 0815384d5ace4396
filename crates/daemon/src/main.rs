//! crmqa Daemon
//!
//! Serves the task API and runs browser scenarios against the demo CRM.

use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;
mod executor;
mod reconciler;
mod runner;
mod scenario;
mod setup;
mod state;

use config::DaemonConfig;

/// How long in-flight runs get to stop once the server is down
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "crmqad")]
#[command(about = "crmqa daemon - browser-driven QA tasks for the demo CRM")]
#[command(version)]
struct Cli {
    /// Configuration file path (defaults to <store>/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Store directory
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// HTTP listen address
    #[arg(short, long, env = "CRMQA_LISTEN")]
    listen: Option<String>,

    /// Directory containing scenario scripts
    #[arg(long)]
    scenarios_dir: Option<PathBuf>,

    /// Interpreter used to run scenario scripts
    #[arg(long)]
    interpreter: Option<String>,

    /// Maximum number of scenarios running at once
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the task API (the default)
    Serve,

    /// Create the store and install the browser scenarios use
    Init,
}

impl Cli {
    fn apply(&self, config: &mut DaemonConfig) {
        if let Some(store) = &self.store {
            config.store_path = store.clone();
        }
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(dir) = &self.scenarios_dir {
            config.runner.scenarios_dir = dir.clone();
        }
        if let Some(interpreter) = &self.interpreter {
            config.runner.interpreter = interpreter.clone();
        }
        if let Some(n) = self.max_concurrent {
            config.executor.max_concurrent = n;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("crmqa daemon v{}", crmqa_common::VERSION);

    // Load configuration, then let flags override it
    let store_path = cli
        .store
        .clone()
        .unwrap_or_else(crmqa_common::default_store_path);
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| store_path.join("config.toml"));
    let mut config = DaemonConfig::load(&config_path)?;
    cli.apply(&mut config);

    tokio::fs::create_dir_all(&config.store_path).await?;

    let state = state::StateManager::new(&config)?;
    let toolchain = setup::Toolchain::new(&config.runner);

    if let Some(Commands::Init) = cli.command {
        toolchain.install_browser().await?;
        let versions = toolchain.check().await?;
        info!(
            "Ready: {} / Playwright {}",
            versions.interpreter, versions.playwright
        );
        return Ok(());
    }

    match toolchain.check().await {
        Ok(versions) => info!(
            "Scenario toolchain: {} / Playwright {}",
            versions.interpreter, versions.playwright
        ),
        Err(e) => warn!("Scenario toolchain not ready ({}); run `crmqad init`", e),
    }

    reconciler::Reconciler::new(state.clone()).reconcile_startup();

    let scenarios = scenario::ScenarioRegistry::with_configured(&config.scenarios);
    for s in scenarios.scenarios() {
        info!("Scenario '{}' -> {}", s.goal, s.script.display());
    }

    let runner = Arc::new(runner::TaskRunner::new(
        state.clone(),
        scenarios,
        config.runner.clone(),
    ));
    let executor = executor::TaskExecutor::new(runner, &config.executor);

    let api_state = Arc::new(api::ApiState {
        state,
        executor: executor.clone(),
    });

    api::serve(&config.listen, api_state, shutdown_signal()?).await?;

    executor.shutdown(SHUTDOWN_GRACE).await;

    info!("Daemon shutdown complete");
    Ok(())
}

/// Resolves on Ctrl-C, or on SIGTERM where there is one.
/// The SIGTERM handler is installed before this returns.
fn shutdown_signal() -> std::io::Result<impl Future<Output = ()> + Send + 'static> {
    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    Ok(async move {
        #[cfg(unix)]
        let terminated = async move {
            terminate.recv().await;
        };
        #[cfg(not(unix))]
        let terminated = std::future::pending::<()>();

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Received Ctrl-C");
            }
            _ = terminated => info!("Received SIGTERM"),
        }
    })
}
