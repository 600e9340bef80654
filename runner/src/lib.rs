//! konnload library
//!
//! Load scenarios for exercising a cluster's API server tunnel path: many
//! concurrent log streams and many concurrent port-forward tunnels.

pub mod cluster;
pub mod config;
pub mod engine;
pub mod scenario;

// Re-export commonly used types
pub use cluster::{ClusterClient, KubeClient};
pub use config::Config;
pub use engine::StopSignal;
pub use scenario::{RunOutcome, Scenario, ScenarioError, ScenarioRegistry};
