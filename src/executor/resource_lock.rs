//! Shared resource locks.
//!
//! Nodes may declare coarse-grained resources they need for the lifetime of
//! their action: a per-project mutex and any number of named shared
//! resources with a declared maximum concurrency. Work sources honor these
//! declarations at `select_next` time; a node whose locks cannot all be
//! acquired stays in the ready set.
//!
//! Lock state only changes under the coordination lock. A successful
//! `try_lock` registers the lock with the coordinator so a `Retry` rolls it
//! back; `unlock` broadcasts a state change so parked workers re-check
//! whether the freed capacity makes a node schedulable.

use dashmap::DashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::{self, ThreadId};

use super::coordination::StateCoordinator;

/// A lock participating in coordinated scheduling.
///
/// `try_lock` and `unlock` must be called with the coordination lock held.
/// `try_lock` succeeds immediately when the calling thread already holds
/// the lock, so re-entrant acquisition never consumes a second slot.
pub trait ResourceLock: Send + Sync {
    /// Human-readable name for logging and diagnostics.
    fn display_name(&self) -> &str;

    /// Returns true if any thread holds the lock.
    fn is_locked(&self) -> bool;

    /// Returns true if the calling thread holds the lock.
    fn is_locked_by_current_thread(&self) -> bool;

    /// Non-blocking acquire. Returns false when the lock is at capacity.
    fn try_lock(&self) -> bool;

    /// Releases the calling thread's hold, if any, and broadcasts a state
    /// change. A no-op when the calling thread holds nothing.
    fn unlock(&self);
}

/// A named resource with a declared maximum concurrency.
///
/// A project lock is the concurrency-1 case. Each thread may hold at most
/// one slot; holding is re-entrant per thread.
pub struct SharedResourceLock {
    name: String,
    max_concurrency: usize,
    coordinator: Arc<StateCoordinator>,
    holders: Mutex<Vec<ThreadId>>,
    self_ref: OnceLock<Weak<SharedResourceLock>>,
}

impl SharedResourceLock {
    fn new(name: String, max_concurrency: usize, coordinator: Arc<StateCoordinator>) -> Arc<Self> {
        assert!(max_concurrency > 0, "max_concurrency must be > 0");
        let lock = Arc::new(Self {
            name,
            max_concurrency,
            coordinator,
            holders: Mutex::new(Vec::new()),
            self_ref: OnceLock::new(),
        });
        let _ = lock.self_ref.set(Arc::downgrade(&lock));
        lock
    }

    /// Returns the declared maximum concurrency.
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Returns the number of threads currently holding a slot.
    pub fn holder_count(&self) -> usize {
        self.holders.lock().expect("lock state poisoned").len()
    }

    fn register_for_rollback(&self) {
        if let Some(weak) = self.self_ref.get() {
            if let Some(lock) = weak.upgrade() {
                self.coordinator.register_locked(lock);
            }
        }
    }
}

impl ResourceLock for SharedResourceLock {
    fn display_name(&self) -> &str {
        &self.name
    }

    fn is_locked(&self) -> bool {
        self.coordinator.assert_has_state_lock();
        !self.holders.lock().expect("lock state poisoned").is_empty()
    }

    fn is_locked_by_current_thread(&self) -> bool {
        self.coordinator.assert_has_state_lock();
        let thread_id = thread::current().id();
        self.holders
            .lock()
            .expect("lock state poisoned")
            .contains(&thread_id)
    }

    fn try_lock(&self) -> bool {
        self.coordinator.assert_has_state_lock();
        let thread_id = thread::current().id();
        let mut holders = self.holders.lock().expect("lock state poisoned");
        if holders.contains(&thread_id) {
            return true;
        }
        if holders.len() < self.max_concurrency {
            holders.push(thread_id);
            drop(holders);
            self.register_for_rollback();
            true
        } else {
            false
        }
    }

    fn unlock(&self) {
        self.coordinator.assert_has_state_lock();
        let thread_id = thread::current().id();
        let mut holders = self.holders.lock().expect("lock state poisoned");
        if let Some(position) = holders.iter().position(|id| *id == thread_id) {
            holders.remove(position);
            drop(holders);
            self.coordinator.notify_state_change();
        }
    }
}

impl std::fmt::Debug for SharedResourceLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedResourceLock")
            .field("name", &self.name)
            .field("max_concurrency", &self.max_concurrency)
            .finish()
    }
}

/// Registry of shared resource locks and project locks for one build.
///
/// Locks are created on first use and shared by name, so two sources that
/// declare the same resource contend on the same lock.
pub struct SharedResourceRegistry {
    coordinator: Arc<StateCoordinator>,
    resources: DashMap<String, Arc<SharedResourceLock>>,
    project_locks: DashMap<String, Arc<SharedResourceLock>>,
}

impl SharedResourceRegistry {
    /// Creates an empty registry.
    pub fn new(coordinator: Arc<StateCoordinator>) -> Self {
        Self {
            coordinator,
            resources: DashMap::new(),
            project_locks: DashMap::new(),
        }
    }

    /// Returns the named shared resource, creating it with the given
    /// concurrency on first use.
    ///
    /// The declared concurrency is fixed by the first caller; later callers
    /// receive the existing lock regardless of the value they pass.
    pub fn resource(&self, name: &str, max_concurrency: usize) -> Arc<SharedResourceLock> {
        self.resources
            .entry(name.to_string())
            .or_insert_with(|| {
                SharedResourceLock::new(
                    name.to_string(),
                    max_concurrency,
                    self.coordinator.clone(),
                )
            })
            .clone()
    }

    /// Returns the mutex for the given project, creating it on first use.
    pub fn project_lock(&self, project_path: &str) -> Arc<SharedResourceLock> {
        self.project_locks
            .entry(project_path.to_string())
            .or_insert_with(|| {
                SharedResourceLock::new(
                    format!("project {project_path}"),
                    1,
                    self.coordinator.clone(),
                )
            })
            .clone()
    }
}

impl std::fmt::Debug for SharedResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedResourceRegistry")
            .field("resources", &self.resources.len())
            .field("project_locks", &self.project_locks.len())
            .finish()
    }
}
