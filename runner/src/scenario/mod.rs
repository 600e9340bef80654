//! Load scenarios
//!
//! This module provides:
//! - `Scenario` trait implemented by every load scenario
//! - `ConnectionsScenario` streaming logs from random pods
//! - `PortForwardsScenario` holding port-forward tunnels to a fixture deployment
//! - `ScenarioRegistry` resolving scenario names

pub mod connections;
pub mod portforwards;
pub mod registry;
mod types;

use async_trait::async_trait;

pub use connections::ConnectionsScenario;
pub use portforwards::PortForwardsScenario;
pub use registry::{RegistryError, ScenarioRegistry};
pub use types::{RunOutcome, ScenarioError};

/// A named load scenario
#[async_trait]
pub trait Scenario: Send + Sync {
    /// Name the scenario is registered under
    fn name(&self) -> &'static str;

    /// Whether `run` watches the process interrupt itself. Scenarios that
    /// don't are abandoned by the registry when the interrupt fires.
    fn handles_interrupt(&self) -> bool {
        false
    }

    /// Run the scenario to completion
    async fn run(&self) -> Result<RunOutcome, ScenarioError>;

    /// Remove anything a previous interrupted run may have left behind
    async fn cleanup(&self) -> Result<(), ScenarioError>;
}
