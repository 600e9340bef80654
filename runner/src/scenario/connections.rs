//! Concurrent log streaming scenario
//!
//! Workers repeatedly pick a random pod and stream its logs to completion,
//! exercising many short-lived connections through the API server. Failures
//! are counted and never abort the run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use metrics::{counter, histogram};
use rand::Rng;
use rand::seq::IndexedRandom;
use tracing::{debug, info};

use crate::cluster::{ClusterClient, TargetSelector};
use crate::config::ConnectionsConfig;
use crate::engine::{AggregationPolicy, ErrorAggregator, WorkerContext, WorkerPool};

use super::Scenario;
use super::types::{RunOutcome, ScenarioError};

pub const NAME: &str = "concurrent-connections";

/// Streams logs from random pods with a fixed number of workers
pub struct ConnectionsScenario {
    config: ConnectionsConfig,
    cluster: Arc<dyn ClusterClient>,
}

impl ConnectionsScenario {
    pub fn new(config: ConnectionsConfig, cluster: Arc<dyn ClusterClient>) -> Self {
        Self { config, cluster }
    }
}

#[async_trait]
impl Scenario for ConnectionsScenario {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn run(&self) -> Result<RunOutcome, ScenarioError> {
        let start = Instant::now();
        let workers = self.config.worker_count;
        let iterations = self.config.iterations;
        let max_jitter = self.config.max_jitter();
        info!(
            "Starting {}: {} workers x {} iterations against {}",
            NAME,
            workers,
            iterations,
            self.config.selector()
        );

        let (aggregator, sink) = ErrorAggregator::new(AggregationPolicy::Tolerant, workers);

        let cluster = Arc::clone(&self.cluster);
        let selector = self.config.selector();
        let pool = WorkerPool::spawn(workers, sink, move |ctx| {
            let cluster = Arc::clone(&cluster);
            let selector = selector.clone();
            async move { stream_logs(ctx, cluster, selector, iterations, max_jitter).await }
        });

        let outcome = aggregator.wait().await;
        pool.join().await;

        info!("{}: total errors when processing logs: {}", NAME, outcome.failed);

        Ok(RunOutcome {
            scenario: NAME,
            succeeded: outcome.succeeded,
            failed: outcome.failed,
            duration: start.elapsed(),
        })
    }

    async fn cleanup(&self) -> Result<(), ScenarioError> {
        Ok(())
    }
}

/// One worker: `iterations` log retrievals, each reported exactly once
async fn stream_logs(
    ctx: WorkerContext,
    cluster: Arc<dyn ClusterClient>,
    selector: TargetSelector,
    iterations: usize,
    max_jitter: Duration,
) -> Result<(), ScenarioError> {
    for iteration in 0..iterations {
        let delay = jitter(max_jitter);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        counter!("konnload_iterations_total", "scenario" => NAME).increment(1);
        match stream_random_target(cluster.as_ref(), &selector).await {
            Ok(bytes) => {
                debug!(
                    "Worker {} iteration {}: read {} bytes",
                    ctx.index(),
                    iteration,
                    bytes
                );
                ctx.succeeded();
            }
            Err(e) => {
                counter!("konnload_iteration_failures_total", "scenario" => NAME).increment(1);
                ctx.fail(e);
            }
        }
    }
    Ok(())
}

/// Random delay in `[0, max)`
fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..max_ms))
}

/// Stream the full log of a random target, returning the bytes read
async fn stream_random_target(
    cluster: &dyn ClusterClient,
    selector: &TargetSelector,
) -> Result<u64, ScenarioError> {
    let targets = cluster.list_targets(selector).await?;
    let target = targets
        .choose(&mut rand::rng())
        .cloned()
        .ok_or_else(|| ScenarioError::NoTargets(selector.clone()))?;

    let mut stream = cluster
        .stream_output(&target, target.default_container())
        .await?;

    let mut total = 0u64;
    while let Some(chunk) = stream.next().await {
        total += chunk?.len() as u64;
    }
    histogram!("konnload_stream_bytes").record(total as f64);

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_jitter_never_sleeps() {
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
        assert_eq!(jitter(Duration::from_micros(500)), Duration::ZERO);
    }

    #[test]
    fn test_jitter_stays_below_max() {
        let max = Duration::from_millis(20);
        for _ in 0..1000 {
            assert!(jitter(max) < max);
        }
    }
}
