//! Parallel Work-Plan Executor
//!
//! This module drives one or more dynamically growing work graphs
//! ("plans") to completion across a bounded pool of worker threads.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      PlanExecutor                            │
//! │  process(source, action): submit, wait, collect failures    │
//! ├─────────────────────────────────────────────────────────────┤
//! │                      ExecutorWorker (× N)                    │
//! │  Loop: select under lock → run action outside → mark done   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐  ┌──────────────┐  ┌───────────────────┐   │
//! │  │ Merged      │  │ Worker-Lease │  │ State             │   │
//! │  │ Queue       │  │ Registry     │  │ Coordinator       │   │
//! │  └─────────────┘  └──────────────┘  └───────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Core Concepts
//!
//! - **Plan / work source**: a graph of nodes with scheduling state,
//!   driven through the [`WorkSource`] trait. Concrete graphs live outside
//!   this crate.
//!
//! - **Worker lease**: a token from a pool of size N that a thread must
//!   hold to execute a node. At most N leases are outstanding, bounding
//!   parallelism.
//!
//! - **Coordination lock**: one re-entrant lock serializing every
//!   scheduling transition. Actions run outside it; idle workers park on
//!   its condition variable.
//!
//! - **Merged queue**: the ordered list of live plans presented to workers
//!   as one virtual queue. The submitting thread works a private queue
//!   holding only its own plan.
//!
//! - **Liveness**: when work is queued but every worker is waiting or
//!   stopped, [`PlanExecutor::assert_healthy`] aborts the build with a
//!   diagnostic instead of hanging.
//!
//! # Example
//!
//! ```ignore
//! use gantry::executor::{
//!     ExecutorConfig, PlanExecutor, StateCoordinator, WorkerLeaseRegistry,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = ExecutorConfig::new(4);
//! let coordinator = Arc::new(StateCoordinator::new());
//! let leases = Arc::new(WorkerLeaseRegistry::new(coordinator.clone(), 4));
//! let executor = PlanExecutor::new(config, coordinator, leases, CancellationToken::new())?;
//!
//! let result = executor.process(plan, Arc::new(|node| {
//!     // run the node's work
//!     Ok(())
//! }))?;
//!
//! assert!(result.is_success());
//! executor.stop()?;
//! ```

mod config;
mod coordination;
mod core;
mod error;
mod lease;
mod queue;
mod resource_lock;
mod source;
mod state;
mod stats;
mod worker;

// Configuration
pub use config::{ExecutorConfig, FALLBACK_WORKER_COUNT, STATS_ENV_VAR};

// Coordination
pub use coordination::{Disposition, LockState, StateCoordinator};

// Errors
pub use error::ExecutorError;

// Worker leases
pub use lease::{WorkerLease, WorkerLeaseRegistry};

// Shared resource locks
pub use resource_lock::{ResourceLock, SharedResourceLock, SharedResourceRegistry};

// The work-source contract
pub use source::{
    node_failure, NodeAction, NodeFailure, Selection, SourceDiagnostics, SourceState, WorkFailure,
    WorkNode, WorkSource,
};

// Merged queue
pub use queue::{MergedQueue, PlanDetails};

// Facade
pub use self::core::{ExecutionResult, PlanExecutor};
