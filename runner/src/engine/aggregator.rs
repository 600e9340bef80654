//! Completion and error aggregation for worker pools
//!
//! Workers report through a `ReportSink`, which never blocks: reports go into
//! an unbounded queue. The `ErrorAggregator` owns the receiving end and decides
//! when the run is over according to its `AggregationPolicy`.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::scenario::ScenarioError;

use super::signal::StopSignal;

/// How failures affect the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationPolicy {
    /// Count every failure and wait for all workers to finish
    Tolerant,
    /// Stop the run on the first failure
    FailFast,
}

/// A single report from a worker
#[derive(Debug)]
pub enum WorkerReport {
    /// One operation completed
    Succeeded,
    /// One operation (or the whole worker) failed
    Failed { worker: usize, error: ScenarioError },
    /// The worker returned
    Finished { worker: usize },
}

/// Non-blocking reporting handle shared by workers
#[derive(Debug, Clone)]
pub struct ReportSink {
    tx: mpsc::UnboundedSender<WorkerReport>,
    stop: StopSignal,
    policy: AggregationPolicy,
}

impl ReportSink {
    pub fn succeeded(&self) {
        self.send(WorkerReport::Succeeded);
    }

    /// Report a failure. Under fail-fast this also stops every sibling.
    pub fn fail(&self, worker: usize, error: ScenarioError) {
        self.send(WorkerReport::Failed { worker, error });
        if self.policy == AggregationPolicy::FailFast && self.stop.trigger() {
            debug!("Worker {} failure triggered run cancellation", worker);
        }
    }

    pub fn finished(&self, worker: usize) {
        self.send(WorkerReport::Finished { worker });
    }

    /// Run-wide stop signal
    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    fn send(&self, report: WorkerReport) {
        // The aggregator may already have returned; late reports are dropped
        let _ = self.tx.send(report);
    }
}

/// Result of waiting on an aggregator
#[derive(Debug, Default)]
pub struct AggregateOutcome {
    pub succeeded: u64,
    pub failed: u64,
    pub workers_finished: usize,
    /// First failure under fail-fast
    pub first_error: Option<ScenarioError>,
    /// Stop was triggered without a failure being reported
    pub cancelled: bool,
}

/// Collects worker reports until the run is done
pub struct ErrorAggregator {
    policy: AggregationPolicy,
    expected: usize,
    rx: mpsc::UnboundedReceiver<WorkerReport>,
    stop: StopSignal,
}

impl ErrorAggregator {
    /// Create an aggregator expecting `expected` workers, and the sink they
    /// report through.
    pub fn new(policy: AggregationPolicy, expected: usize) -> (Self, ReportSink) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = StopSignal::new();
        let sink = ReportSink {
            tx,
            stop: stop.clone(),
            policy,
        };
        let aggregator = Self {
            policy,
            expected,
            rx,
            stop,
        };
        (aggregator, sink)
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    /// Wait until every worker finished, or the policy ends the run early.
    ///
    /// Also returns once every sink is dropped, so a worker that disappears
    /// without reporting cannot hang the run.
    pub async fn wait(mut self) -> AggregateOutcome {
        let mut outcome = AggregateOutcome::default();
        if self.expected == 0 {
            return outcome;
        }

        loop {
            tokio::select! {
                // Reports queued before a stop must be seen first
                biased;

                report = self.rx.recv() => match report {
                    Some(WorkerReport::Succeeded) => outcome.succeeded += 1,
                    Some(WorkerReport::Failed { worker, error }) => {
                        outcome.failed += 1;
                        match self.policy {
                            AggregationPolicy::Tolerant => {
                                warn!("Worker {}: {}", worker, error);
                            }
                            AggregationPolicy::FailFast => {
                                warn!("Worker {} failed, stopping run: {}", worker, error);
                                self.stop.trigger();
                                outcome.first_error = Some(error);
                                break;
                            }
                        }
                    }
                    Some(WorkerReport::Finished { worker }) => {
                        outcome.workers_finished += 1;
                        debug!(
                            "Worker {} finished ({}/{})",
                            worker, outcome.workers_finished, self.expected
                        );
                        if outcome.workers_finished >= self.expected {
                            break;
                        }
                    }
                    None => {
                        debug!("All report sinks dropped");
                        break;
                    }
                },
                _ = self.stop.triggered() => {
                    outcome.cancelled = true;
                    break;
                }
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::TargetSelector;
    use std::time::Duration;

    fn no_targets() -> ScenarioError {
        ScenarioError::NoTargets(TargetSelector::all())
    }

    #[tokio::test]
    async fn test_tolerant_counts_all_failures() {
        let (aggregator, sink) = ErrorAggregator::new(AggregationPolicy::Tolerant, 2);

        sink.succeeded();
        sink.fail(0, no_targets());
        sink.fail(1, no_targets());
        sink.finished(0);
        sink.succeeded();
        sink.finished(1);

        let outcome = aggregator.wait().await;
        assert_eq!(outcome.succeeded, 2);
        assert_eq!(outcome.failed, 2);
        assert_eq!(outcome.workers_finished, 2);
        assert!(outcome.first_error.is_none());
        assert!(!sink.stop_signal().is_triggered());
    }

    #[tokio::test]
    async fn test_fail_fast_returns_first_error_and_stops() {
        let (aggregator, sink) = ErrorAggregator::new(AggregationPolicy::FailFast, 3);

        sink.succeeded();
        sink.fail(2, ScenarioError::Interrupted);
        sink.fail(1, no_targets());

        assert!(sink.stop_signal().is_triggered());

        let outcome = aggregator.wait().await;
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(outcome.failed, 1);
        assert!(matches!(outcome.first_error, Some(ScenarioError::Interrupted)));
        assert!(!outcome.cancelled);
    }

    #[tokio::test]
    async fn test_zero_workers_returns_immediately() {
        let (aggregator, _sink) = ErrorAggregator::new(AggregationPolicy::FailFast, 0);
        let outcome = tokio::time::timeout(Duration::from_millis(100), aggregator.wait())
            .await
            .expect("wait should not block");
        assert_eq!(outcome.workers_finished, 0);
    }

    #[tokio::test]
    async fn test_dropped_sinks_end_wait() {
        let (aggregator, sink) = ErrorAggregator::new(AggregationPolicy::Tolerant, 4);
        sink.finished(0);
        drop(sink);

        let outcome = tokio::time::timeout(Duration::from_millis(100), aggregator.wait())
            .await
            .expect("wait should end once all sinks are gone");
        assert_eq!(outcome.workers_finished, 1);
    }

    #[tokio::test]
    async fn test_external_stop_cancels_wait() {
        let (aggregator, sink) = ErrorAggregator::new(AggregationPolicy::FailFast, 2);
        let stop = aggregator.stop_signal().clone();

        let waiter = tokio::spawn(aggregator.wait());
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.trigger();

        let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait should observe stop")
            .unwrap();
        assert!(outcome.cancelled);
        assert!(outcome.first_error.is_none());
        drop(sink);
    }

    #[tokio::test]
    async fn test_sink_never_blocks_without_listener() {
        let (aggregator, sink) = ErrorAggregator::new(AggregationPolicy::Tolerant, 1);

        // Far more reports than workers, with nobody receiving yet
        for _ in 0..10_000 {
            sink.fail(0, no_targets());
        }
        sink.finished(0);

        let outcome = aggregator.wait().await;
        assert_eq!(outcome.failed, 10_000);
    }

    #[tokio::test]
    async fn test_reports_after_wait_are_dropped() {
        let (aggregator, sink) = ErrorAggregator::new(AggregationPolicy::FailFast, 1);
        sink.finished(0);
        aggregator.wait().await;

        // Receiver is gone; must not panic or block
        sink.succeeded();
        sink.fail(0, ScenarioError::Interrupted);
    }
}
