//! The scenario plug-in contract and the process-wide registry of scenario
//! singletons. A scenario is a trait object rather than a base class: shared
//! counter/histogram state lives in each implementation's own struct fields.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::ScenarioError;
use crate::job::UserContext;

/// The four-operation contract every protocol plug-in satisfies.
#[async_trait]
pub trait Scenario: Send + Sync {
    /// Stable identifier used in the registry, counters, and Job config.
    fn name(&self) -> &str;

    /// Called once per worker before any user executes. Seeds counters and
    /// establishes pooled resources. An error here is fatal to the Job.
    async fn setup(&self, params: &HashMap<String, String>) -> Result<(), ScenarioError>;

    /// Runs one virtual user's lifecycle to completion. Safe to invoke
    /// concurrently from many schedulers. Errors are counted, not propagated.
    async fn execute(&self, ctx: &UserContext) -> Result<(), ScenarioError>;

    /// Snapshot read of all counters this scenario owns.
    fn counters(&self) -> HashMap<String, i64>;
}

/// Process-wide mapping from scenario name to its singleton instance,
/// built once at startup and shared read-only thereafter.
#[derive(Clone, Default)]
pub struct ScenarioRegistry {
    scenarios: HashMap<String, Arc<dyn Scenario>>,
}

impl ScenarioRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, scenario: Arc<dyn Scenario>) {
        self.scenarios.insert(scenario.name().to_string(), scenario);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Scenario>> {
        self.scenarios.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.scenarios.keys().map(|s| s.as_str())
    }

    /// Runs `setup` on every registered scenario, aborting on the first error.
    pub async fn setup_all(&self, params: &HashMap<String, String>) -> Result<(), ScenarioError> {
        for scenario in self.scenarios.values() {
            scenario.setup(params).await?;
        }
        Ok(())
    }

    /// Merges counters from the named scenarios; colliding keys are summed,
    /// matching the observed source behaviour.
    pub fn list_counters(&self, scenario_names: &[String]) -> HashMap<String, i64> {
        let mut merged: HashMap<String, i64> = HashMap::new();
        for name in scenario_names {
            let Some(scenario) = self.scenarios.get(name) else {
                continue;
            };
            for (k, v) in scenario.counters() {
                *merged.entry(k).or_insert(0) += v;
            }
        }
        merged
    }
}
