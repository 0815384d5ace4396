//! Scenario registry: which browser script a goal runs

use crate::config::ScenarioConfig;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Goal used when a task does not name one
pub const DEFAULT_GOAL: &str = "add customer";

/// A browser scenario the runner can launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scenario {
    /// Goal text that selects this scenario, normalized to lowercase
    pub goal: String,
    /// Name used in result messages ("<label> test failed ...")
    pub label: String,
    /// Script path, relative to the scenarios directory unless absolute
    pub script: PathBuf,
}

impl Scenario {
    pub fn new(goal: &str, label: &str, script: impl Into<PathBuf>) -> Self {
        Self {
            goal: normalize(goal),
            label: label.to_string(),
            script: script.into(),
        }
    }

    /// Resolve the script against the scenarios directory
    pub fn script_path(&self, scenarios_dir: &Path) -> PathBuf {
        if self.script.is_absolute() {
            self.script.clone()
        } else {
            scenarios_dir.join(&self.script)
        }
    }
}

/// Goal -> scenario lookup with a fallback
#[derive(Debug, Clone)]
pub struct ScenarioRegistry {
    scenarios: Vec<Scenario>,
    fallback: usize,
}

impl Default for ScenarioRegistry {
    fn default() -> Self {
        Self {
            scenarios: vec![
                Scenario::new(DEFAULT_GOAL, "Add customer", "add_customer.js"),
                Scenario::new(
                    "verify total customers",
                    "Verify total customers",
                    "verify_total_customers.js",
                ),
            ],
            fallback: 0,
        }
    }
}

impl ScenarioRegistry {
    /// Built-in scenarios plus the ones declared in config.
    /// A configured goal that matches a built-in replaces it.
    pub fn with_configured(configured: &[ScenarioConfig]) -> Self {
        let mut registry = Self::default();
        for entry in configured {
            registry.register(Scenario::new(&entry.goal, &entry.label, entry.script.clone()));
        }
        registry
    }

    pub fn register(&mut self, scenario: Scenario) {
        match self.scenarios.iter_mut().find(|s| s.goal == scenario.goal) {
            Some(existing) => {
                warn!("Scenario for goal '{}' overridden", scenario.goal);
                *existing = scenario;
            }
            None => self.scenarios.push(scenario),
        }
    }

    /// Pick the scenario for a goal; unknown or missing goals get the fallback
    pub fn resolve(&self, goal: Option<&str>) -> &Scenario {
        goal.map(normalize)
            .and_then(|goal| self.scenarios.iter().find(|s| s.goal == goal))
            .unwrap_or(&self.scenarios[self.fallback])
    }

    pub fn scenarios(&self) -> &[Scenario] {
        &self.scenarios
    }
}

fn normalize(goal: &str) -> String {
    goal.trim().to_lowercase()
}
