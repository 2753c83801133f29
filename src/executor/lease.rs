//! Worker leases.
//!
//! A worker lease is a token drawn from a global pool of size N (the
//! configured worker count). A thread must hold a lease to execute a node;
//! at most N leases are outstanding at any instant, which is what bounds
//! the executor's parallelism.
//!
//! Each thread owns at most one lease handle. A worker acquires its lease
//! only once it has a candidate node to run and releases it before parking,
//! so an idle worker never starves a busy one. `try_lock` on a lease the
//! calling thread already holds succeeds without consuming a second slot;
//! this is what lets a node action submit a nested plan and work on it with
//! the lease it already has.

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::{self, ThreadId};

use super::coordination::StateCoordinator;
use super::resource_lock::ResourceLock;

/// Shared lease pool accounting.
#[derive(Debug)]
struct LeasePool {
    max_workers: usize,
    in_use: AtomicUsize,
}

/// Registry handing out worker leases, one per thread.
pub struct WorkerLeaseRegistry {
    coordinator: Arc<StateCoordinator>,
    pool: Arc<LeasePool>,
    leases: DashMap<ThreadId, Arc<WorkerLease>>,
}

impl WorkerLeaseRegistry {
    /// Creates a registry with the given maximum concurrent workers.
    ///
    /// # Panics
    ///
    /// Panics if `max_workers` is zero.
    pub fn new(coordinator: Arc<StateCoordinator>, max_workers: usize) -> Self {
        assert!(max_workers > 0, "max_workers must be > 0");
        Self {
            coordinator,
            pool: Arc::new(LeasePool {
                max_workers,
                in_use: AtomicUsize::new(0),
            }),
            leases: DashMap::new(),
        }
    }

    /// Returns the maximum number of leases that may be locked at once.
    pub fn max_workers(&self) -> usize {
        self.pool.max_workers
    }

    /// Returns the number of leases currently locked.
    pub fn leases_in_use(&self) -> usize {
        self.pool.in_use.load(Ordering::Relaxed)
    }

    /// Creates an unlocked lease handle tied to the calling thread.
    ///
    /// Replaces any handle the thread previously registered.
    pub fn new_worker_lease(&self) -> Arc<WorkerLease> {
        let lease = WorkerLease::new(self.coordinator.clone(), self.pool.clone());
        self.leases.insert(thread::current().id(), lease.clone());
        lease
    }

    /// Returns the lease handle the calling thread already owns, if any.
    pub fn current_worker_lease(&self) -> Option<Arc<WorkerLease>> {
        self.leases
            .get(&thread::current().id())
            .map(|entry| entry.clone())
    }

    /// Returns the calling thread's lease handle, registering a fresh
    /// unlocked one if the thread has none yet.
    pub fn worker_lease(&self) -> Arc<WorkerLease> {
        match self.current_worker_lease() {
            Some(lease) => lease,
            None => self.new_worker_lease(),
        }
    }
}

impl std::fmt::Debug for WorkerLeaseRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLeaseRegistry")
            .field("max_workers", &self.pool.max_workers)
            .field("in_use", &self.leases_in_use())
            .finish()
    }
}

/// A single worker lease handle.
///
/// Lock state only changes under the coordination lock. Unlocking
/// broadcasts a state change so a parked worker can take the freed slot.
pub struct WorkerLease {
    coordinator: Arc<StateCoordinator>,
    pool: Arc<LeasePool>,
    holder: Mutex<Option<ThreadId>>,
    self_ref: OnceLock<Weak<WorkerLease>>,
}

impl WorkerLease {
    fn new(coordinator: Arc<StateCoordinator>, pool: Arc<LeasePool>) -> Arc<Self> {
        let lease = Arc::new(Self {
            coordinator,
            pool,
            holder: Mutex::new(None),
            self_ref: OnceLock::new(),
        });
        let _ = lease.self_ref.set(Arc::downgrade(&lease));
        lease
    }

    fn register_for_rollback(&self) {
        if let Some(weak) = self.self_ref.get() {
            if let Some(lease) = weak.upgrade() {
                self.coordinator.register_locked(lease);
            }
        }
    }
}

impl ResourceLock for WorkerLease {
    fn display_name(&self) -> &str {
        "worker lease"
    }

    fn is_locked(&self) -> bool {
        self.coordinator.assert_has_state_lock();
        self.holder.lock().expect("lease state poisoned").is_some()
    }

    fn is_locked_by_current_thread(&self) -> bool {
        self.coordinator.assert_has_state_lock();
        *self.holder.lock().expect("lease state poisoned") == Some(thread::current().id())
    }

    fn try_lock(&self) -> bool {
        self.coordinator.assert_has_state_lock();
        let thread_id = thread::current().id();
        let mut holder = self.holder.lock().expect("lease state poisoned");
        if *holder == Some(thread_id) {
            return true;
        }
        if self.pool.in_use.load(Ordering::Relaxed) < self.pool.max_workers {
            self.pool.in_use.fetch_add(1, Ordering::Relaxed);
            *holder = Some(thread_id);
            drop(holder);
            self.register_for_rollback();
            true
        } else {
            false
        }
    }

    fn unlock(&self) {
        self.coordinator.assert_has_state_lock();
        let thread_id = thread::current().id();
        let mut holder = self.holder.lock().expect("lease state poisoned");
        if *holder == Some(thread_id) {
            *holder = None;
            self.pool.in_use.fetch_sub(1, Ordering::Relaxed);
            drop(holder);
            self.coordinator.notify_state_change();
        }
    }
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease").finish_non_exhaustive()
    }
}
