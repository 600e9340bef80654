//! ClusterClient trait definition

use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use super::types::{
    ClusterError, FixtureHandle, FixtureSpec, OutputStream, ReadyPolicy, Target, TargetSelector,
    TunnelRequest,
};

/// Operations the scenarios need from the cluster
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// List targets matching a selector
    async fn list_targets(&self, selector: &TargetSelector) -> Result<Vec<Target>, ClusterError>;

    /// Open a streaming read of a target's output
    async fn stream_output(
        &self,
        target: &Target,
        container: Option<&str>,
    ) -> Result<OutputStream, ClusterError>;

    /// Forward a local port to a target port.
    ///
    /// Signals `request.ready` once the local port accepts connections and
    /// returns after `request.stop` fires.
    async fn open_tunnel(&self, request: TunnelRequest) -> Result<(), ClusterError>;

    /// Provision a fixture workload
    async fn create_fixture(&self, spec: &FixtureSpec) -> Result<FixtureHandle, ClusterError>;

    /// Remove a fixture workload
    async fn delete_fixture(&self, handle: &FixtureHandle) -> Result<(), ClusterError>;

    /// Block until every target matching the selector is running.
    ///
    /// An empty target set is not considered ready. Listing errors are
    /// logged and retried until the timeout.
    async fn wait_until_ready(
        &self,
        selector: &TargetSelector,
        policy: &ReadyPolicy,
    ) -> Result<(), ClusterError> {
        let deadline = Instant::now() + policy.timeout;

        loop {
            match self.list_targets(selector).await {
                Ok(targets) if !targets.is_empty() && targets.iter().all(Target::is_running) => {
                    return Ok(());
                }
                Ok(targets) => {
                    let running = targets.iter().filter(|t| t.is_running()).count();
                    debug!("{}/{} targets running for {}", running, targets.len(), selector);
                }
                Err(e) => {
                    debug!("Error checking for running targets: {}", e);
                }
            }

            if Instant::now() + policy.poll_interval > deadline {
                return Err(ClusterError::Timeout {
                    what: format!("targets {} to be running", selector),
                    after: policy.timeout,
                });
            }
            tokio::time::sleep(policy.poll_interval).await;
        }
    }
}
