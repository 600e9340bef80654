//! Scenario registry
//!
//! Maps scenario names to configured scenario instances. One registry is
//! built per process invocation.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::cluster::ClusterClient;
use crate::config::Config;
use crate::engine::StopSignal;

use super::types::{RunOutcome, ScenarioError};
use super::{ConnectionsScenario, PortForwardsScenario, Scenario, connections, portforwards};

/// Errors surfaced by the registry
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Unknown scenario '{name}' (available: {available})")]
    UnknownScenario { name: String, available: String },

    #[error("Scenario {name} failed: {source}")]
    Scenario {
        name: &'static str,
        #[source]
        source: ScenarioError,
    },
}

/// Name to scenario lookup
pub struct ScenarioRegistry {
    scenarios: BTreeMap<&'static str, Arc<dyn Scenario>>,
    /// Process-wide interrupt, checked before and during every scenario
    interrupt: StopSignal,
}

impl ScenarioRegistry {
    /// Register every built-in scenario with its configuration
    pub fn new(config: &Config, cluster: Arc<dyn ClusterClient>, interrupt: StopSignal) -> Self {
        let mut registry = Self::empty(interrupt.clone());
        registry.register(Arc::new(ConnectionsScenario::new(
            config.concurrent_connections.clone(),
            Arc::clone(&cluster),
        )));
        registry.register(Arc::new(PortForwardsScenario::new(
            config.concurrent_portforwards.clone(),
            cluster,
            interrupt,
        )));
        registry
    }

    /// A registry with no scenarios, stopped by `interrupt`
    pub fn empty(interrupt: StopSignal) -> Self {
        Self {
            scenarios: BTreeMap::new(),
            interrupt,
        }
    }

    /// Add a scenario, replacing any previous one with the same name
    pub fn register(&mut self, scenario: Arc<dyn Scenario>) {
        self.scenarios.insert(scenario.name(), scenario);
    }

    /// Names of the built-in scenarios, sorted
    pub fn known_names() -> Vec<&'static str> {
        let mut names = vec![connections::NAME, portforwards::NAME];
        names.sort_unstable();
        names
    }

    /// Names of the registered scenarios, sorted
    pub fn names(&self) -> Vec<&'static str> {
        self.scenarios.keys().copied().collect()
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Scenario>, RegistryError> {
        self.scenarios
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownScenario {
                name: name.to_string(),
                available: self.names().join(", "),
            })
    }

    /// Reject unknown names before anything runs
    pub fn validate<S: AsRef<str>>(&self, names: &[S]) -> Result<(), RegistryError> {
        for name in names {
            self.resolve(name.as_ref())?;
        }
        Ok(())
    }

    /// Run scenarios in order, stopping at the first failure
    pub async fn run_all<S: AsRef<str>>(
        &self,
        names: &[S],
    ) -> Result<Vec<RunOutcome>, RegistryError> {
        self.validate(names)?;

        let mut outcomes = Vec::with_capacity(names.len());
        for name in names {
            let scenario = self.resolve(name.as_ref())?;
            info!("Running scenario {}", scenario.name());
            let outcome = self
                .run_one(scenario.as_ref())
                .await
                .map_err(|source| RegistryError::Scenario {
                    name: scenario.name(),
                    source,
                })?;
            info!(
                "Scenario {} finished in {:.2}s",
                outcome.scenario,
                outcome.duration.as_secs_f64()
            );
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Clean up after scenarios in order, stopping at the first failure
    pub async fn cleanup_all<S: AsRef<str>>(&self, names: &[S]) -> Result<(), RegistryError> {
        self.validate(names)?;

        for name in names {
            let scenario = self.resolve(name.as_ref())?;
            info!("Cleaning up scenario {}", scenario.name());
            self.cleanup_one(scenario.as_ref())
                .await
                .map_err(|source| RegistryError::Scenario {
                    name: scenario.name(),
                    source,
                })?;
        }
        Ok(())
    }

    async fn run_one(&self, scenario: &dyn Scenario) -> Result<RunOutcome, ScenarioError> {
        if self.interrupt.is_triggered() {
            warn!("Interrupted, not starting scenario {}", scenario.name());
            return Err(ScenarioError::Interrupted);
        }
        if scenario.handles_interrupt() {
            return scenario.run().await;
        }

        tokio::select! {
            outcome = scenario.run() => outcome,
            _ = self.interrupt.triggered() => {
                warn!("Interrupted, abandoning scenario {}", scenario.name());
                Err(ScenarioError::Interrupted)
            }
        }
    }

    async fn cleanup_one(&self, scenario: &dyn Scenario) -> Result<(), ScenarioError> {
        if self.interrupt.is_triggered() {
            return Err(ScenarioError::Interrupted);
        }

        tokio::select! {
            cleaned = scenario.cleanup() => cleaned,
            _ = self.interrupt.triggered() => Err(ScenarioError::Interrupted),
        }
    }
}
