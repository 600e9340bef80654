//! Concurrent port-forward scenario
//!
//! Provisions a fixture deployment, then holds one tunnel per worker to a
//! random fixture pod while probing it over HTTP. The first failure (or an
//! interrupt) stops every worker. The fixture is deleted exactly once per run
//! whenever it was created.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, histogram};
use rand::seq::IndexedRandom;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterClient, ClusterError, FixtureHandle, TargetSelector, TunnelRequest};
use crate::config::PortForwardsConfig;
use crate::engine::{
    AggregateOutcome, AggregationPolicy, ErrorAggregator, StopSignal, WorkerContext, WorkerPool,
};

use super::Scenario;
use super::types::{RunOutcome, ScenarioError};

pub const NAME: &str = "concurrent-portforwards";

/// How long a tunnel may take to start listening locally
const TUNNEL_READY_TIMEOUT: Duration = Duration::from_secs(30);

type TunnelTask = JoinHandle<Result<(), ClusterError>>;

/// Holds concurrent port-forward tunnels to a temporary deployment
pub struct PortForwardsScenario {
    config: PortForwardsConfig,
    cluster: Arc<dyn ClusterClient>,
    /// Process-wide interrupt
    interrupt: StopSignal,
}

impl PortForwardsScenario {
    pub fn new(
        config: PortForwardsConfig,
        cluster: Arc<dyn ClusterClient>,
        interrupt: StopSignal,
    ) -> Self {
        Self {
            config,
            cluster,
            interrupt,
        }
    }

    /// Everything between fixture creation and deletion
    async fn exercise(
        &self,
        handle: &FixtureHandle,
        http: reqwest::Client,
    ) -> Result<AggregateOutcome, ScenarioError> {
        let policy = self.config.ready_policy();
        info!("Waiting up to {:?} for fixture {} pods", policy.timeout, handle);
        tokio::select! {
            ready = self.cluster.wait_until_ready(&handle.selector, &policy) => {
                ready.map_err(|source| ScenarioError::Fixture {
                    action: "wait for",
                    source,
                })?;
            }
            _ = self.interrupt.triggered() => return Err(ScenarioError::Interrupted),
        }

        let workers = self.config.worker_count;
        info!(
            "Holding {} tunnels for {:?} from port {}",
            workers,
            self.config.hold_duration(),
            self.config.start_port
        );

        let (aggregator, sink) = ErrorAggregator::new(AggregationPolicy::FailFast, workers);
        let stop = aggregator.stop_signal().clone();

        let worker = Arc::new(TunnelWorker {
            cluster: Arc::clone(&self.cluster),
            http,
            selector: handle.selector.clone(),
            config: self.config.clone(),
        });
        let pool = WorkerPool::spawn(workers, sink, move |ctx| {
            let worker = Arc::clone(&worker);
            async move { worker.run(ctx).await }
        });

        let mut outcome = tokio::select! {
            outcome = aggregator.wait() => outcome,
            _ = self.interrupt.triggered() => {
                warn!("Interrupted, stopping {} tunnels", workers);
                stop.trigger();
                AggregateOutcome {
                    first_error: Some(ScenarioError::Interrupted),
                    ..AggregateOutcome::default()
                }
            }
        };

        // Every tunnel must be closed before the fixture goes away
        pool.join().await;

        match outcome.first_error.take() {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }
}

#[async_trait]
impl Scenario for PortForwardsScenario {
    fn name(&self) -> &'static str {
        NAME
    }

    fn handles_interrupt(&self) -> bool {
        true
    }

    async fn run(&self) -> Result<RunOutcome, ScenarioError> {
        if self.interrupt.is_triggered() {
            return Err(ScenarioError::Interrupted);
        }

        let start = std::time::Instant::now();
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(ClusterError::from)?;

        let spec = self.config.fixture_spec();
        info!(
            "Creating fixture {}/{} ({} x {})",
            spec.namespace, spec.name, spec.replicas, spec.image
        );
        let handle = self
            .cluster
            .create_fixture(&spec)
            .await
            .map_err(|source| ScenarioError::Fixture {
                action: "create",
                source,
            })?;

        let result = self.exercise(&handle, http).await;

        info!("Deleting fixture {}", handle);
        let teardown = self.cluster.delete_fixture(&handle).await;

        let outcome = settle(result, teardown)?;
        info!(
            "{}: {} successful probes, {} failures",
            NAME, outcome.succeeded, outcome.failed
        );

        Ok(RunOutcome {
            scenario: NAME,
            succeeded: outcome.succeeded,
            failed: outcome.failed,
            duration: start.elapsed(),
        })
    }

    async fn cleanup(&self) -> Result<(), ScenarioError> {
        let handle = FixtureHandle::for_spec(&self.config.fixture_spec());
        match self.cluster.delete_fixture(&handle).await {
            Ok(()) => {
                info!("Deleted fixture {}", handle);
                Ok(())
            }
            Err(ClusterError::NotFound(_)) => {
                info!("Fixture {} not present, nothing to clean up", handle);
                Ok(())
            }
            Err(source) => Err(ScenarioError::Fixture {
                action: "delete",
                source,
            }),
        }
    }
}

/// Combine the run result with the fixture teardown result.
///
/// The earlier error wins; a teardown error is only surfaced on its own.
fn settle(
    result: Result<AggregateOutcome, ScenarioError>,
    teardown: Result<(), ClusterError>,
) -> Result<AggregateOutcome, ScenarioError> {
    match (result, teardown) {
        (Ok(outcome), Ok(())) => Ok(outcome),
        (Ok(_), Err(source)) => Err(ScenarioError::Fixture {
            action: "delete",
            source,
        }),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(teardown)) => {
            error!("Failed to delete fixture after failed run: {}", teardown);
            Err(e)
        }
    }
}

/// Shared per-run state of the tunnel workers
struct TunnelWorker {
    cluster: Arc<dyn ClusterClient>,
    http: reqwest::Client,
    selector: TargetSelector,
    config: PortForwardsConfig,
}

impl TunnelWorker {
    async fn run(&self, ctx: WorkerContext) -> Result<(), ScenarioError> {
        let port = self.config.local_port(ctx.index());

        let targets = self.cluster.list_targets(&self.selector).await?;
        let target = targets
            .choose(&mut rand::rng())
            .cloned()
            .ok_or_else(|| ScenarioError::NoTargets(self.selector.clone()))?;
        debug!(
            "Worker {} forwarding 127.0.0.1:{} to {}:{}",
            ctx.index(),
            port,
            target,
            self.config.remote_port
        );

        let tunnel_stop = StopSignal::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let request = TunnelRequest {
            target,
            local_port: port,
            remote_port: self.config.remote_port,
            stop: tunnel_stop.clone(),
            ready: ready_tx,
        };
        let cluster = Arc::clone(&self.cluster);
        let mut tunnel: TunnelTask =
            tokio::spawn(async move { cluster.open_tunnel(request).await });

        let mut tunnel_done = false;
        let result = self
            .hold(&ctx, port, ready_rx, &mut tunnel, &mut tunnel_done)
            .await;

        tunnel_stop.trigger();
        if !tunnel_done {
            match tunnel.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Tunnel on port {} closed with error: {}", port, e),
                Err(e) => warn!("Tunnel task on port {} failed: {}", port, e),
            }
        }
        debug!("Worker {} released port {}", ctx.index(), port);

        result
    }

    /// Wait for the tunnel, then probe it until the hold time is over.
    ///
    /// Sets `tunnel_done` once the tunnel task has been awaited here.
    async fn hold(
        &self,
        ctx: &WorkerContext,
        port: u16,
        ready: oneshot::Receiver<()>,
        tunnel: &mut TunnelTask,
        tunnel_done: &mut bool,
    ) -> Result<(), ScenarioError> {
        tokio::select! {
            ready = ready => {
                if ready.is_err() {
                    // Tunnel gave up before listening
                    *tunnel_done = true;
                    return Err(tunnel_ended(port, tunnel.await));
                }
            }
            joined = &mut *tunnel => {
                *tunnel_done = true;
                return Err(tunnel_ended(port, joined));
            }
            _ = ctx.cancelled() => return Ok(()),
            _ = tokio::time::sleep(TUNNEL_READY_TIMEOUT) => {
                return Err(ScenarioError::TunnelNotReady {
                    port,
                    after: TUNNEL_READY_TIMEOUT,
                });
            }
        }

        let interval = self.config.probe_interval();
        let hold_end = Instant::now() + self.config.hold_duration();
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Each tick sends one request to completion; the hold ends between ticks
        loop {
            tokio::select! {
                biased;

                _ = ctx.cancelled() => return Ok(()),
                joined = &mut *tunnel => {
                    *tunnel_done = true;
                    return Err(tunnel_ended(port, joined));
                }
                _ = ticker.tick() => {}
            }

            let started = Instant::now();
            tokio::select! {
                biased;

                _ = ctx.cancelled() => return Ok(()),
                probed = self.probe(port) => {
                    probed?;
                    histogram!("konnload_probe_duration_seconds").record(started.elapsed());
                    counter!("konnload_probes_total").increment(1);
                    ctx.succeeded();
                }
            }

            if Instant::now() >= hold_end {
                return Ok(());
            }
        }
    }

    /// One HTTP request through the tunnel, body discarded
    async fn probe(&self, port: u16) -> Result<(), ScenarioError> {
        let url = format!("http://127.0.0.1:{}/", port);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|source| ScenarioError::Probe { port, source })?;
        response
            .bytes()
            .await
            .map_err(|source| ScenarioError::Probe { port, source })?;
        Ok(())
    }
}

/// Error for a tunnel task that returned while it was still needed
fn tunnel_ended(port: u16, joined: Result<Result<(), ClusterError>, JoinError>) -> ScenarioError {
    match joined {
        Ok(Err(e)) => ScenarioError::Cluster(e),
        Ok(Ok(())) => ScenarioError::TunnelClosed { port },
        Err(e) => {
            warn!("Tunnel task on port {} failed: {}", port, e);
            ScenarioError::TunnelClosed { port }
        }
    }
}
