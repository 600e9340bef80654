//! Scenario results and error definitions

use std::fmt::Write;
use std::time::Duration;

use thiserror::Error;

use crate::cluster::{ClusterError, TargetSelector};

/// Errors that can occur while running a scenario
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("No targets found for {0}")]
    NoTargets(TargetSelector),

    #[error("Cluster request failed: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Request through tunnel on port {port} failed: {source}")]
    Probe {
        port: u16,
        source: reqwest::Error,
    },

    #[error("Tunnel on port {port} closed unexpectedly")]
    TunnelClosed { port: u16 },

    #[error("Tunnel on port {port} did not become ready within {after:?}")]
    TunnelNotReady { port: u16, after: Duration },

    #[error("Failed to {action} fixture: {source}")]
    Fixture {
        action: &'static str,
        source: ClusterError,
    },

    #[error("Interrupt received")]
    Interrupted,

    #[error("Worker {worker} panicked")]
    WorkerPanicked { worker: usize },
}

/// Summary of one scenario run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub scenario: &'static str,
    pub succeeded: u64,
    pub failed: u64,
    pub duration: Duration,
}

impl RunOutcome {
    /// Operations attempted (successes plus failures)
    pub fn attempted(&self) -> u64 {
        self.succeeded + self.failed
    }

    /// Generate a summary report
    pub fn report(&self) -> String {
        let mut report = String::new();
        let _ = writeln!(report, "=== {} ===", self.scenario);
        let _ = writeln!(report, "Duration: {:.2}s", self.duration.as_secs_f64());
        let _ = writeln!(report, "Attempted: {}", self.attempted());
        let _ = writeln!(report, "Succeeded: {}", self.succeeded);
        let _ = write!(report, "Failed: {}", self.failed);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_counts() {
        let outcome = RunOutcome {
            scenario: "concurrent-connections",
            succeeded: 4,
            failed: 2,
            duration: Duration::from_millis(1500),
        };

        assert_eq!(outcome.attempted(), 6);
        let report = outcome.report();
        assert!(report.starts_with("=== concurrent-connections ==="));
        assert!(report.contains("Duration: 1.50s"));
        assert!(report.contains("Attempted: 6"));
        assert!(report.contains("Failed: 2"));
    }
}
