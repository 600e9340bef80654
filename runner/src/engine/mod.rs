//! Concurrency primitives shared by scenarios
//!
//! This module provides:
//! - `WorkerPool` running a fixed number of workers
//! - `ErrorAggregator` collecting their reports under a tolerant or fail-fast policy
//! - `StopSignal` for cooperative cancellation and interrupt handling

mod aggregator;
mod pool;
mod signal;

pub use aggregator::{
    AggregateOutcome, AggregationPolicy, ErrorAggregator, ReportSink, WorkerReport,
};
pub use pool::{WorkerContext, WorkerPool};
pub use signal::{StopSignal, install_interrupt_handler, shutdown_signal};
