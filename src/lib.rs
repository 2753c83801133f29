//! Gantry - Parallel work-plan execution for build pipelines
//!
//! This library drives one or more dynamically growing work graphs
//! ("plans") to completion across a bounded pool of worker threads,
//! respecting dependency order, resource locks, cancellation requests,
//! and liveness invariants.
//!
//! # High-Level API
//!
//! The [`executor`] module provides the public entry point:
//!
//! ```ignore
//! use gantry::executor::{
//!     ExecutorConfig, PlanExecutor, StateCoordinator, WorkerLeaseRegistry,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = ExecutorConfig::default();
//! let coordinator = Arc::new(StateCoordinator::new());
//! let leases = Arc::new(WorkerLeaseRegistry::new(
//!     coordinator.clone(),
//!     config.max_worker_count,
//! ));
//! let executor = PlanExecutor::new(config, coordinator, leases, CancellationToken::new())?;
//!
//! // Submit a plan; the calling thread participates as a worker until
//! // the plan has drained.
//! let result = executor.process(plan, action)?;
//! ```

pub mod diagnostics;
pub mod executor;

/// Version of the Gantry library.
///
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
