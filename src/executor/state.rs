//! Executor state and health monitoring.
//!
//! Tracks every worker's lifecycle state and implements the liveness
//! check: when work is queued but every worker is waiting or stopped, the
//! graph cannot make progress (an unreachable dependency or a stuck lock)
//! and the build is aborted with a diagnostic rather than hanging forever.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tracing::error;

use super::error::ExecutorError;
use super::queue::MergedQueue;
use super::stats::{ExecutorStats, WorkerStats};
use crate::diagnostics::TreeFormatter;

/// Lifecycle state of one worker thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ExecutionState {
    /// Selecting or executing a node.
    Running,
    /// Parked waiting for work to become ready.
    Waiting,
    /// The worker's loop has ended.
    Stopped,
}

const STATE_RUNNING: u8 = 0;
const STATE_WAITING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Per-worker state record, shared between the worker thread (which
/// transitions it) and the health monitor (which reads it).
#[derive(Debug)]
pub(crate) struct WorkerRecord {
    state: AtomicU8,
}

impl WorkerRecord {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(STATE_RUNNING),
        })
    }

    pub(crate) fn execution_state(&self) -> ExecutionState {
        match self.state.load(Ordering::SeqCst) {
            STATE_RUNNING => ExecutionState::Running,
            STATE_WAITING => ExecutionState::Waiting,
            _ => ExecutionState::Stopped,
        }
    }

    fn start_waiting(&self) {
        let previous = self.state.compare_exchange(
            STATE_RUNNING,
            STATE_WAITING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        assert!(previous.is_ok(), "unexpected state for worker");
    }

    fn finish_waiting(&self) {
        assert_ne!(
            self.state.load(Ordering::SeqCst),
            STATE_STOPPED,
            "unexpected state for worker"
        );
        self.state.store(STATE_RUNNING, Ordering::SeqCst);
    }

    fn finish(&self) {
        self.state.store(STATE_STOPPED, Ordering::SeqCst);
    }
}

/// Registry of worker records plus the one-shot pool starter.
pub(crate) struct ExecutorState {
    /// `None` until the pool has been started; workers register here.
    workers: Mutex<Option<Vec<Arc<WorkerRecord>>>>,
}

impl ExecutorState {
    pub(crate) fn new() -> Self {
        Self {
            workers: Mutex::new(None),
        }
    }

    /// Runs `start` exactly once across all callers.
    ///
    /// The first caller initializes the worker list and spins up the pool;
    /// later callers return immediately, possibly while the pool is still
    /// starting.
    pub(crate) fn maybe_start_workers(&self, start: impl FnOnce()) {
        {
            let mut workers = self.workers.lock().expect("worker list poisoned");
            if workers.is_some() {
                return;
            }
            *workers = Some(Vec::new());
        }
        start();
    }

    /// The liveness check. Must be called with the coordination lock held.
    ///
    /// Execution is healthy when there is no work queued (running nodes are
    /// assumed to finish), when the pool has not started yet, or when at
    /// least one worker is running. Otherwise every queued source's
    /// diagnostics are rendered, the report is logged, and every live
    /// source is aborted with the liveness failure.
    pub(crate) fn assert_healthy(&self, queue: &MergedQueue) -> Result<(), ExecutorError> {
        if queue.nothing_queued() {
            return Ok(());
        }

        let workers = {
            let guard = self.workers.lock().expect("worker list poisoned");
            match guard.as_ref() {
                Some(workers) if !workers.is_empty() => workers.clone(),
                // Workers have not been started yet; assume they will be.
                _ => return Ok(()),
            }
        };

        let mut waiting_workers = 0;
        let mut stopped_workers = 0;
        for worker in &workers {
            match worker.execution_state() {
                ExecutionState::Running => return Ok(()),
                ExecutionState::Waiting => waiting_workers += 1,
                ExecutionState::Stopped => stopped_workers += 1,
            }
        }

        // No worker is doing anything. Log the details here as well as
        // failing the build: an executor in this state may not shut down
        // cleanly enough to report the failure through normal channels.
        let mut formatter = TreeFormatter::new();
        formatter.node(
            "Unable to make progress running work. The following items are queued \
             for execution but none of them can be started:",
        );
        formatter.start_children();
        queue.append_health_diagnostics(&mut formatter);
        formatter.node(format!("Workers waiting for work: {waiting_workers}"));
        formatter.node(format!("Stopped workers: {stopped_workers}"));
        formatter.end_children();
        let report = formatter.to_string();
        error!(waiting_workers, stopped_workers, "{report}");

        queue.abort_all_and_fail(Arc::new(ExecutorError::NoProgress {
            report: report.clone(),
        }));
        Err(ExecutorError::NoProgress { report })
    }
}

impl ExecutorStats for ExecutorState {
    fn start_worker(&self) -> Box<dyn WorkerStats> {
        let record = WorkerRecord::new();
        self.workers
            .lock()
            .expect("worker list poisoned")
            .as_mut()
            .expect("maybe_start_workers must run before workers register")
            .push(record.clone());
        Box::new(RecordStats { record })
    }

    fn report(&self) {}
}

/// The no-op stats recorder: state transitions only, no timing.
struct RecordStats {
    record: Arc<WorkerRecord>,
}

impl WorkerStats for RecordStats {
    fn start_waiting_for_next_item(&mut self) {
        self.record.start_waiting();
    }

    fn finish_waiting_for_next_item(&mut self) {
        self.record.finish_waiting();
    }

    fn start_select(&mut self) {}
    fn finish_select(&mut self) {}
    fn start_execute(&mut self) {}
    fn finish_execute(&mut self) {}
    fn start_mark_finished(&mut self) {}
    fn finish_mark_finished(&mut self) {}

    fn finish(&mut self) {
        self.record.finish();
    }
}
