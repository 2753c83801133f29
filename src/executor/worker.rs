//! The per-thread worker loop.
//!
//! Each worker repeats select → execute → mark-finished until its queue
//! reports no more work. Selection happens under the coordination lock;
//! the node's action runs outside it and may block arbitrarily. Completion
//! re-acquires the lock, reports the outcome to the node's source, and
//! wakes the other workers, since finishing a node may unblock its
//! dependents or be the last node in the queue.
//!
//! A failure from the action (or a panic in it) never escapes the worker;
//! it is reported through `finished_executing` and surfaces in the plan's
//! collected failures. A failure from the source itself aborts every live
//! source in the queue.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::coordination::{Disposition, StateCoordinator};
use super::lease::{WorkerLease, WorkerLeaseRegistry};
use super::queue::{MergedQueue, WorkItem};
use super::resource_lock::ResourceLock;
use super::source::{node_failure, Selection, SourceState, WorkFailure};
use super::stats::WorkerStats;

/// One worker's loop over a merged queue.
pub(crate) struct ExecutorWorker {
    queue: Arc<MergedQueue>,
    /// The lease to reuse; `None` makes the worker allocate its own and
    /// release it on exit.
    lease: Option<Arc<WorkerLease>>,
    cancellation: CancellationToken,
    coordinator: Arc<StateCoordinator>,
    leases: Arc<WorkerLeaseRegistry>,
    stats: Box<dyn WorkerStats>,
}

impl ExecutorWorker {
    pub(crate) fn new(
        queue: Arc<MergedQueue>,
        lease: Option<Arc<WorkerLease>>,
        cancellation: CancellationToken,
        coordinator: Arc<StateCoordinator>,
        leases: Arc<WorkerLeaseRegistry>,
        stats: Box<dyn WorkerStats>,
    ) -> Self {
        Self {
            queue,
            lease,
            cancellation,
            coordinator,
            leases,
            stats,
        }
    }

    /// Runs the loop to completion.
    pub(crate) fn run(mut self) {
        let (lease, release_lease_on_completion) = match self.lease.take() {
            Some(lease) => (lease, false),
            None => (self.leases.new_worker_lease(), true),
        };

        while let Some(item) = self.next_item(&lease) {
            info!(
                node = %item.node.display_name(),
                worker = ?thread::current().name(),
                "node started"
            );
            self.execute(item);
        }

        if release_lease_on_completion {
            self.coordinator.run_with_state_lock(|| lease.unlock());
        }
        self.stats.finish();
    }

    /// Selects a node that is ready to execute, parking until one is or
    /// the queue reports no more work.
    ///
    /// Returns `None` when the loop should end.
    fn next_item(&mut self, lease: &Arc<WorkerLease>) -> Option<WorkItem> {
        let mut selected = None;
        self.stats.start_select();
        {
            let queue = &self.queue;
            let cancellation = &self.cancellation;
            let stats = &mut self.stats;
            let selected = &mut selected;
            self.coordinator.with_state_lock(|lock_state| {
                stats.finish_waiting_for_next_item();
                if cancellation.is_cancelled() {
                    queue.cancel_execution();
                }

                match queue.execution_state() {
                    SourceState::NoMoreWorkToStart => return Disposition::Finished,
                    SourceState::NoWorkReadyToStart => {
                        stats.start_waiting_for_next_item();
                        // Release the worker lease while parked.
                        lease.unlock();
                        return Disposition::Retry;
                    }
                    SourceState::MaybeWorkReadyToStart => {}
                }

                // Work may be ready; a lease is needed to run it. On
                // failure the worker stays Running rather than Waiting:
                // work is available, another worker is progressing it.
                if !lease.try_lock() {
                    return Disposition::Retry;
                }

                let selection = match queue.select_next() {
                    Ok(selection) => selection,
                    Err(failure) => {
                        lock_state.release_locks();
                        queue.abort_all_and_fail(failure);
                        return Disposition::Finished;
                    }
                };
                match selection {
                    Selection::NoMoreWorkToStart => Disposition::Finished,
                    Selection::NoWorkReadyToStart => {
                        stats.start_waiting_for_next_item();
                        // Release the worker lease while parked.
                        lease.unlock();
                        Disposition::Retry
                    }
                    Selection::Item(item) => {
                        *selected = Some(item);
                        Disposition::Finished
                    }
                }
            });
        }
        self.stats.finish_select();
        selected
    }

    /// Runs the action outside the coordination lock and reports the
    /// outcome.
    fn execute(&mut self, item: WorkItem) {
        self.stats.start_execute();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (item.action)(item.node.as_ref())));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(failure)) => Some(failure),
            Err(payload) => Some(panic_failure(payload)),
        };
        self.stats.finish_execute();
        self.mark_finished(item, failure);
    }

    fn mark_finished(&mut self, item: WorkItem, failure: Option<WorkFailure>) {
        self.stats.start_mark_finished();
        self.coordinator.run_with_state_lock(|| {
            if let Err(source_failure) = item.plan.finished_executing(item.node.clone(), failure) {
                self.queue.abort_all_and_fail(source_failure);
            }
            // Finishing a node may unblock further work, or this may have
            // been the last node in the queue.
            self.coordinator.notify_state_change();
        });
        self.stats.finish_mark_finished();
    }
}

/// Converts a caught panic payload into a reportable failure.
fn panic_failure(payload: Box<dyn std::any::Any + Send>) -> WorkFailure {
    if let Some(text) = payload.downcast_ref::<&str>() {
        node_failure(format!("node action panicked: {text}"))
    } else if let Some(text) = payload.downcast_ref::<String>() {
        node_failure(format!("node action panicked: {text}"))
    } else {
        node_failure("node action panicked")
    }
}
