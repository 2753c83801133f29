//! Plan executor facade.
//!
//! [`PlanExecutor`] is the public entry point. `process` submits a plan to
//! the shared merged queue, lazily starts the worker pool, then enrolls the
//! calling thread as a worker over a private queue holding only that plan.
//! The caller is blocked waiting for its own plan anyway; working a queue
//! that contains nothing else lets it participate without stealing work it
//! does not care about, and the private queue's auto-finish flag lets it
//! stop as soon as its plan has drained.

use std::sync::{Arc, Mutex};
use std::thread;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::config::ExecutorConfig;
use super::coordination::{Disposition, StateCoordinator};
use super::error::ExecutorError;
use super::lease::{WorkerLease, WorkerLeaseRegistry};
use super::queue::{MergedQueue, PlanDetails};
use super::resource_lock::ResourceLock;
use super::source::{NodeAction, WorkFailure, WorkSource};
use super::state::ExecutorState;
use super::stats::{CollectingExecutorStats, ExecutorStats};
use super::worker::ExecutorWorker;

/// Outcome of processing one plan.
///
/// Failures from node actions, cascaded cancellations, and aborts are
/// collected here rather than propagated as errors; an empty list means
/// every node completed successfully.
#[derive(Clone, Debug, Default)]
pub struct ExecutionResult {
    failures: Vec<WorkFailure>,
}

impl ExecutionResult {
    /// Wraps collected failures; empty means success.
    pub fn from_failures(failures: Vec<WorkFailure>) -> Self {
        Self { failures }
    }

    /// Returns true if the plan completed without failures.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// The collected failures, in the order they were reported.
    pub fn failures(&self) -> &[WorkFailure] {
        &self.failures
    }

    /// Consumes the result, returning the collected failures.
    pub fn into_failures(self) -> Vec<WorkFailure> {
        self.failures
    }
}

/// Drives work plans to completion across a bounded pool of worker
/// threads.
///
/// One executor exists per build. Its collaborators are explicit
/// constructor arguments, constructed at build start and torn down at
/// build end; the executor owns the shared merged queue and the pool
/// threads, and is told about cancellation through the token it is given.
pub struct PlanExecutor {
    executor_count: usize,
    leases: Arc<WorkerLeaseRegistry>,
    cancellation: CancellationToken,
    coordinator: Arc<StateCoordinator>,
    queue: Arc<MergedQueue>,
    state: Arc<ExecutorState>,
    stats: Arc<dyn ExecutorStats>,
    pool: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl PlanExecutor {
    /// Creates an executor.
    ///
    /// Fails with [`ExecutorError::InvalidParallelism`] when the configured
    /// worker count is not at least 1.
    pub fn new(
        config: ExecutorConfig,
        coordinator: Arc<StateCoordinator>,
        leases: Arc<WorkerLeaseRegistry>,
        cancellation: CancellationToken,
    ) -> Result<Self, ExecutorError> {
        if config.max_worker_count < 1 {
            return Err(ExecutorError::InvalidParallelism(config.max_worker_count));
        }

        let state = Arc::new(ExecutorState::new());
        let stats: Arc<dyn ExecutorStats> = if config.collect_stats {
            Arc::new(CollectingExecutorStats::new(state.clone()))
        } else {
            state.clone()
        };

        Ok(Self {
            executor_count: config.max_worker_count,
            leases,
            cancellation,
            queue: Arc::new(MergedQueue::new(coordinator.clone(), false)),
            coordinator,
            state,
            stats,
            pool: Mutex::new(Vec::new()),
        })
    }

    /// Processes a plan, blocking until every node has completed, failed,
    /// or been skipped.
    ///
    /// The calling thread participates as a worker while it waits, reusing
    /// any worker lease it already holds; a plan submitted from inside a
    /// node action therefore runs without consuming a second lease.
    pub fn process(
        &self,
        source: Arc<dyn WorkSource>,
        action: NodeAction,
    ) -> Result<ExecutionResult, ExecutorError> {
        let plan = PlanDetails::new(source.clone(), action);
        self.queue.add(plan.clone())?;

        self.maybe_start_workers();

        // Run work from this plan on the current thread as well, given
        // that it would be blocked waiting for the plan to complete anyway.
        let lease = self.leases.worker_lease();
        let this_plan_only = Arc::new(MergedQueue::new(self.coordinator.clone(), true));
        this_plan_only.add(plan)?;
        ExecutorWorker::new(
            this_plan_only,
            Some(lease.clone()),
            self.cancellation.clone(),
            self.coordinator.clone(),
            self.leases.clone(),
            self.stats.start_worker(),
        )
        .run();

        let mut failures = Vec::new();
        self.await_completion(source.as_ref(), &lease, &mut failures);
        Ok(ExecutionResult::from_failures(failures))
    }

    /// Checks the liveness invariant.
    ///
    /// Healthy means either nothing is queued or some worker is running.
    /// Otherwise the diagnostic report is logged, every live source is
    /// aborted, and the report is returned as an error.
    pub fn assert_healthy(&self) -> Result<(), ExecutorError> {
        self.coordinator
            .run_with_state_lock(|| self.state.assert_healthy(&self.queue))
    }

    /// Stops the executor: closes the shared queue, joins the pool
    /// threads, and emits the stats report. Safe to call more than once.
    pub fn stop(&self) -> Result<(), ExecutorError> {
        let close_result = self.queue.close();
        let handles: Vec<_> = {
            let mut pool = self.pool.lock().expect("worker pool poisoned");
            pool.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
        self.stats.report();
        close_result
    }

    /// Blocks until every node in `source` has been processed.
    fn await_completion(
        &self,
        source: &dyn WorkSource,
        lease: &Arc<WorkerLease>,
        failures: &mut Vec<WorkFailure>,
    ) {
        self.coordinator.with_state_lock(|_| {
            if source.all_execution_complete() {
                // A worker lease is needed to finish up.
                if !lease.is_locked_by_current_thread() && !lease.try_lock() {
                    return Disposition::Retry;
                }
                source.collect_failures(failures);
                self.queue.remove_finished_plans();
                Disposition::Finished
            } else {
                // Release the lease (if held) while waiting for the
                // remaining nodes to complete.
                lease.unlock();
                Disposition::Retry
            }
        });
    }

    /// Spins up the pool of N - 1 worker threads on first use; the
    /// submitting thread plays the role of the Nth worker.
    fn maybe_start_workers(&self) {
        self.state.maybe_start_workers(|| {
            debug!(
                worker_count = self.executor_count,
                "starting execution worker threads"
            );
            let mut pool = self.pool.lock().expect("worker pool poisoned");
            for index in 1..self.executor_count {
                let worker = ExecutorWorker::new(
                    self.queue.clone(),
                    None,
                    self.cancellation.clone(),
                    self.coordinator.clone(),
                    self.leases.clone(),
                    self.stats.start_worker(),
                );
                let handle = thread::Builder::new()
                    .name(format!("execution-worker-{index}"))
                    .spawn(move || worker.run())
                    .expect("failed to spawn execution worker thread");
                pool.push(handle);
            }
        });
    }
}

impl std::fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("executor_count", &self.executor_count)
            .finish_non_exhaustive()
    }
}
