//! Global state coordination.
//!
//! All scheduling state transitions in the executor happen under a single
//! re-entrant lock owned by the [`StateCoordinator`]. Workers that cannot
//! make progress park on the coordinator's condition variable and are woken
//! by [`notify_state_change`](StateCoordinator::notify_state_change) when a
//! peer finishes a node, adds a plan, or releases a lock.
//!
//! The central operation is [`with_state_lock`](StateCoordinator::with_state_lock):
//! the body runs under the lock and returns a [`Disposition`]. `Finished`
//! releases the lock and returns; `Retry` rolls back any resource locks the
//! attempt acquired, fully releases the lock, waits for the next state
//! change, and re-runs the body.
//!
//! Resource locks ([`WorkerLease`](super::lease::WorkerLease),
//! [`SharedResourceLock`](super::resource_lock::SharedResourceLock))
//! register themselves with the coordinator on a successful `try_lock`, so
//! a `Retry` can undo a partially completed scheduling attempt.

use dashmap::DashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};

use super::resource_lock::ResourceLock;

/// Outcome of a state-lock transform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// The transform completed; release the lock and return.
    Finished,
    /// The transform could not make progress; roll back locks acquired
    /// during the attempt, wait for a state change, and re-run it.
    Retry,
}

/// Handle passed to state-lock transforms.
///
/// Exposes the rollback set of the current attempt so a transform can
/// release the locks it has acquired before bailing out on an error path.
pub struct LockState<'a> {
    coordinator: &'a StateCoordinator,
}

impl LockState<'_> {
    /// Releases every resource lock acquired during the current attempt.
    pub fn release_locks(&self) {
        self.coordinator.release_current_frame();
    }
}

#[derive(Debug)]
struct Monitor {
    owner: Option<ThreadId>,
    depth: usize,
    /// Bumped by `notify_state_change`; Retry waiters sleep until it moves.
    epoch: u64,
}

/// Re-entrant lock plus broadcast wakeup over the executor's shared state.
///
/// One coordinator exists per build. Queues, leases, and resource locks all
/// take it as an explicit constructor argument rather than reaching for a
/// global.
pub struct StateCoordinator {
    monitor: Mutex<Monitor>,
    cond: Condvar,
    /// Per-thread stack of rollback frames, one frame per in-flight
    /// `with_state_lock` attempt on that thread.
    frames: DashMap<ThreadId, Vec<Vec<Arc<dyn ResourceLock>>>>,
}

impl Default for StateCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCoordinator {
    /// Creates a new coordinator.
    pub fn new() -> Self {
        Self {
            monitor: Mutex::new(Monitor {
                owner: None,
                depth: 0,
                epoch: 0,
            }),
            cond: Condvar::new(),
            frames: DashMap::new(),
        }
    }

    /// Runs `transform` under the state lock, retrying on [`Disposition::Retry`].
    ///
    /// Each attempt gets a fresh rollback frame; locks acquired during an
    /// attempt that ends in `Retry` are released before the thread parks.
    /// Re-entrant: a thread already holding the lock may call this again.
    pub fn with_state_lock<F>(&self, mut transform: F)
    where
        F: FnMut(&LockState<'_>) -> Disposition,
    {
        self.enter();
        loop {
            self.push_frame();
            let disposition = transform(&LockState { coordinator: self });
            match disposition {
                Disposition::Finished => {
                    self.pop_frame(false);
                    break;
                }
                Disposition::Retry => {
                    self.pop_frame(true);
                    self.wait_for_state_change();
                }
            }
        }
        self.exit();
    }

    /// Runs `action` once under the state lock and returns its result.
    ///
    /// Convenience for transforms that never retry.
    pub fn run_with_state_lock<T>(&self, action: impl FnOnce() -> T) -> T {
        self.enter();
        self.push_frame();
        let result = action();
        self.pop_frame(false);
        self.exit();
        result
    }

    /// Wakes every thread parked in a `Retry` wait.
    ///
    /// Must be called while holding the state lock so that the state the
    /// waiters re-inspect cannot change between the notification and the
    /// caller releasing the lock.
    pub fn notify_state_change(&self) {
        let mut monitor = self.monitor.lock().expect("state monitor poisoned");
        assert_eq!(
            monitor.owner,
            Some(thread::current().id()),
            "notify_state_change called without the state lock"
        );
        monitor.epoch = monitor.epoch.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Returns true if the calling thread holds the state lock.
    pub fn has_state_lock(&self) -> bool {
        let monitor = self.monitor.lock().expect("state monitor poisoned");
        monitor.owner == Some(thread::current().id())
    }

    /// Panics unless the calling thread holds the state lock.
    ///
    /// Used as a contract check on every queue and lock operation.
    pub fn assert_has_state_lock(&self) {
        assert!(
            self.has_state_lock(),
            "current thread does not hold the state lock"
        );
    }

    /// Registers a lock acquired during the current attempt for rollback.
    ///
    /// Called by lock implementations from a successful `try_lock`. Outside
    /// of any attempt the registration is dropped; the lock is then owned
    /// unconditionally.
    pub(crate) fn register_locked(&self, lock: Arc<dyn ResourceLock>) {
        let thread_id = thread::current().id();
        if let Some(mut frames) = self.frames.get_mut(&thread_id) {
            if let Some(frame) = frames.last_mut() {
                frame.push(lock);
            }
        }
    }

    fn enter(&self) {
        let thread_id = thread::current().id();
        let mut monitor = self.monitor.lock().expect("state monitor poisoned");
        if monitor.owner == Some(thread_id) {
            monitor.depth += 1;
            return;
        }
        while monitor.owner.is_some() {
            monitor = self.cond.wait(monitor).expect("state monitor poisoned");
        }
        monitor.owner = Some(thread_id);
        monitor.depth = 1;
    }

    fn exit(&self) {
        let mut monitor = self.monitor.lock().expect("state monitor poisoned");
        debug_assert_eq!(monitor.owner, Some(thread::current().id()));
        monitor.depth -= 1;
        if monitor.depth == 0 {
            monitor.owner = None;
            self.cond.notify_all();
        }
    }

    /// Releases the monitor entirely (all holds), waits for the epoch to
    /// move, then re-acquires it at the saved depth.
    fn wait_for_state_change(&self) {
        let thread_id = thread::current().id();
        let mut monitor = self.monitor.lock().expect("state monitor poisoned");
        debug_assert_eq!(monitor.owner, Some(thread_id));
        let saved_depth = monitor.depth;
        let seen_epoch = monitor.epoch;
        monitor.owner = None;
        monitor.depth = 0;
        self.cond.notify_all();

        while monitor.epoch == seen_epoch || monitor.owner.is_some() {
            monitor = self.cond.wait(monitor).expect("state monitor poisoned");
        }
        monitor.owner = Some(thread_id);
        monitor.depth = saved_depth;
    }

    fn push_frame(&self) {
        let thread_id = thread::current().id();
        self.frames.entry(thread_id).or_default().push(Vec::new());
    }

    fn pop_frame(&self, release: bool) {
        let thread_id = thread::current().id();
        let frame = {
            let mut frames = match self.frames.get_mut(&thread_id) {
                Some(frames) => frames,
                None => return,
            };
            frames.pop()
        };
        if release {
            if let Some(frame) = frame {
                for lock in frame.iter().rev() {
                    lock.unlock();
                }
            }
        }
    }

    fn release_current_frame(&self) {
        let thread_id = thread::current().id();
        let locks = {
            let mut frames = match self.frames.get_mut(&thread_id) {
                Some(frames) => frames,
                None => return,
            };
            match frames.last_mut() {
                Some(frame) => std::mem::take(frame),
                None => return,
            }
        };
        for lock in locks.iter().rev() {
            lock.unlock();
        }
    }
}

impl std::fmt::Debug for StateCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCoordinator").finish_non_exhaustive()
    }
}
