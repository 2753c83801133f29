//! Worker statistics.
//!
//! Workers report their lifecycle through the [`WorkerStats`] trait. The
//! default implementation only tracks the Running / Waiting / Stopped state
//! used by the health monitor and performs no timing calls, keeping the hot
//! path free of clock reads. The opt-in [`CollectingExecutorStats`] wraps
//! it and times every select / execute / mark-finished operation, reporting
//! averages across completed workers when the executor stops.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::info;

/// Executor-wide stats sink. Implementations must be thread safe.
pub(crate) trait ExecutorStats: Send + Sync {
    /// Registers a new worker and returns its per-worker stats recorder.
    fn start_worker(&self) -> Box<dyn WorkerStats>;

    /// Emits the final report, if any.
    fn report(&self);
}

/// Per-worker lifecycle and timing callbacks.
///
/// Used only by the owning worker thread; implementations need not be
/// thread safe beyond `Send`.
pub(crate) trait WorkerStats: Send {
    /// The worker is about to park waiting for work.
    fn start_waiting_for_next_item(&mut self);

    /// The worker resumed a scheduling attempt.
    fn finish_waiting_for_next_item(&mut self);

    fn start_select(&mut self);
    fn finish_select(&mut self);

    fn start_execute(&mut self);
    fn finish_execute(&mut self);

    fn start_mark_finished(&mut self);
    fn finish_mark_finished(&mut self);

    /// The worker's loop has ended.
    fn finish(&mut self);
}

/// Timing totals for one completed worker.
#[derive(Clone, Copy, Debug, Default)]
struct WorkerTimings {
    total_select: Duration,
    total_execute: Duration,
    total_mark_finished: Duration,
}

/// Collecting stats sink, enabled via
/// [`ExecutorConfig::collect_stats`](super::config::ExecutorConfig).
pub(crate) struct CollectingExecutorStats {
    delegate: Arc<dyn ExecutorStats>,
    completed_workers: Arc<Mutex<Vec<WorkerTimings>>>,
}

impl CollectingExecutorStats {
    pub(crate) fn new(delegate: Arc<dyn ExecutorStats>) -> Self {
        Self {
            delegate,
            completed_workers: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl ExecutorStats for CollectingExecutorStats {
    fn start_worker(&self) -> Box<dyn WorkerStats> {
        Box::new(CollectingWorkerStats {
            delegate: self.delegate.start_worker(),
            completed_workers: self.completed_workers.clone(),
            operation_started: Instant::now(),
            timings: WorkerTimings::default(),
        })
    }

    fn report(&self) {
        let mut completed = self
            .completed_workers
            .lock()
            .expect("stats state poisoned");
        let worker_count = completed.len();
        info!(worker_count, "worker thread statistics");
        if worker_count > 0 {
            info!(
                average_select_ms = average_ms(&completed, |t| t.total_select),
                average_execute_ms = average_ms(&completed, |t| t.total_execute),
                average_finish_ms = average_ms(&completed, |t| t.total_mark_finished),
                "average worker operation times"
            );
        }
        completed.clear();
    }
}

fn average_ms(timings: &[WorkerTimings], field: impl Fn(&WorkerTimings) -> Duration) -> u64 {
    let total: Duration = timings.iter().map(field).sum();
    (total.as_millis() as u64) / (timings.len() as u64)
}

/// Per-worker timing recorder wrapping the state-tracking delegate.
struct CollectingWorkerStats {
    delegate: Box<dyn WorkerStats>,
    completed_workers: Arc<Mutex<Vec<WorkerTimings>>>,
    operation_started: Instant,
    timings: WorkerTimings,
}

impl WorkerStats for CollectingWorkerStats {
    fn start_waiting_for_next_item(&mut self) {
        self.delegate.start_waiting_for_next_item();
    }

    fn finish_waiting_for_next_item(&mut self) {
        self.delegate.finish_waiting_for_next_item();
    }

    fn start_select(&mut self) {
        self.operation_started = Instant::now();
    }

    fn finish_select(&mut self) {
        self.timings.total_select += self.operation_started.elapsed();
    }

    fn start_execute(&mut self) {
        self.operation_started = Instant::now();
    }

    fn finish_execute(&mut self) {
        self.timings.total_execute += self.operation_started.elapsed();
    }

    fn start_mark_finished(&mut self) {
        self.operation_started = Instant::now();
    }

    fn finish_mark_finished(&mut self) {
        self.timings.total_mark_finished += self.operation_started.elapsed();
    }

    fn finish(&mut self) {
        self.delegate.finish();
        self.completed_workers
            .lock()
            .expect("stats state poisoned")
            .push(self.timings);
    }
}
