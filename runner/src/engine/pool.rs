//! Fixed-size worker pool

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::task::JoinSet;
use tracing::error;

use crate::scenario::ScenarioError;

use super::aggregator::ReportSink;

/// Everything a worker gets to do its job
#[derive(Debug, Clone)]
pub struct WorkerContext {
    index: usize,
    sink: ReportSink,
}

impl WorkerContext {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Report one successful operation
    pub fn succeeded(&self) {
        self.sink.succeeded();
    }

    /// Report a failed operation without ending the worker
    pub fn fail(&self, error: ScenarioError) {
        self.sink.fail(self.index, error);
    }

    /// Wait until the run is cancelled
    pub async fn cancelled(&self) {
        self.sink.stop_signal().triggered().await;
    }
}

/// A fixed set of concurrently running workers
pub struct WorkerPool {
    tasks: JoinSet<()>,
}

impl WorkerPool {
    /// Start exactly `size` workers running `task`.
    ///
    /// The pool reports on behalf of each worker: an `Err` return becomes a
    /// failure, a panic becomes `WorkerPanicked`, and every worker reports
    /// `Finished` exactly once.
    pub fn spawn<F, Fut>(size: usize, sink: ReportSink, task: F) -> Self
    where
        F: Fn(WorkerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ScenarioError>> + Send + 'static,
    {
        let task = Arc::new(task);
        let mut tasks = JoinSet::new();

        for index in 0..size {
            let ctx = WorkerContext {
                index,
                sink: sink.clone(),
            };
            let task = Arc::clone(&task);

            tasks.spawn(async move {
                let result = AssertUnwindSafe(task(ctx.clone())).catch_unwind().await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => ctx.fail(e),
                    Err(_) => ctx.fail(ScenarioError::WorkerPanicked { worker: index }),
                }
                ctx.sink.finished(index);
            });
        }

        Self { tasks }
    }

    /// Wait for every worker to return
    pub async fn join(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!("Worker task failed to join: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::aggregator::{AggregationPolicy, ErrorAggregator};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_spawns_exactly_n_workers() {
        let (aggregator, sink) = ErrorAggregator::new(AggregationPolicy::Tolerant, 4);
        let started = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&started);
        let pool = WorkerPool::spawn(4, sink, move |ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                ctx.succeeded();
                Ok(())
            }
        });

        let outcome = aggregator.wait().await;
        pool.join().await;

        assert_eq!(started.load(Ordering::SeqCst), 4);
        assert_eq!(outcome.succeeded, 4);
        assert_eq!(outcome.workers_finished, 4);
    }

    #[tokio::test]
    async fn test_worker_error_becomes_failure() {
        let (aggregator, sink) = ErrorAggregator::new(AggregationPolicy::Tolerant, 2);

        let pool = WorkerPool::spawn(2, sink, |ctx| async move {
            if ctx.index() == 1 {
                return Err(ScenarioError::Interrupted);
            }
            Ok(())
        });

        let outcome = aggregator.wait().await;
        pool.join().await;
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.workers_finished, 2);
    }

    #[tokio::test]
    async fn test_panicking_worker_is_reported() {
        let (aggregator, sink) = ErrorAggregator::new(AggregationPolicy::FailFast, 2);

        let pool = WorkerPool::spawn(2, sink, |ctx| async move {
            if ctx.index() == 0 {
                panic!("worker blew up");
            }
            ctx.cancelled().await;
            Ok(())
        });

        let outcome = tokio::time::timeout(Duration::from_secs(1), aggregator.wait())
            .await
            .expect("panic must not hang the run");
        pool.join().await;

        assert!(matches!(
            outcome.first_error,
            Some(ScenarioError::WorkerPanicked { worker: 0 })
        ));
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_siblings() {
        let (aggregator, sink) = ErrorAggregator::new(AggregationPolicy::FailFast, 3);

        let pool = WorkerPool::spawn(3, sink, |ctx| async move {
            if ctx.index() == 2 {
                tokio::time::sleep(Duration::from_millis(20)).await;
                return Err(ScenarioError::Interrupted);
            }
            // Would run for a minute unless cancelled
            tokio::select! {
                _ = ctx.cancelled() => Ok(()),
                _ = tokio::time::sleep(Duration::from_secs(60)) => Ok(()),
            }
        });

        let outcome = aggregator.wait().await;
        tokio::time::timeout(Duration::from_secs(1), pool.join())
            .await
            .expect("siblings should stop once cancelled");

        assert!(matches!(outcome.first_error, Some(ScenarioError::Interrupted)));
    }
}
