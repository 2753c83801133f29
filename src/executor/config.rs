//! Executor configuration.
//!
//! This module contains the [`ExecutorConfig`] struct and related constants
//! for configuring the plan executor.

// =============================================================================
// Configuration Constants
// =============================================================================

/// Environment variable that enables worker statistics collection.
///
/// When set to `true` (case-insensitive), the executor times every select /
/// execute / mark-finished operation and reports averages on `stop()`. Off
/// by default; the disabled path performs no timing calls.
pub const STATS_ENV_VAR: &str = "GANTRY_EXECUTOR_STATS";

/// Fallback worker count when the available parallelism cannot be queried.
pub const FALLBACK_WORKER_COUNT: usize = 4;

// =============================================================================
// Executor Configuration
// =============================================================================

/// Configuration for the plan executor.
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Maximum number of concurrent workers, including the submitting
    /// thread. Must be at least 1.
    pub max_worker_count: usize,

    /// Whether to collect per-worker operation timings.
    pub collect_stats: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(FALLBACK_WORKER_COUNT);

        Self {
            max_worker_count: workers,
            collect_stats: stats_enabled_from_env(),
        }
    }
}

impl ExecutorConfig {
    /// Creates a configuration with the given worker count.
    ///
    /// Stats collection follows the [`STATS_ENV_VAR`] environment variable.
    pub fn new(max_worker_count: usize) -> Self {
        Self {
            max_worker_count,
            collect_stats: stats_enabled_from_env(),
        }
    }

    /// Sets the worker count.
    pub fn with_max_worker_count(mut self, max_worker_count: usize) -> Self {
        self.max_worker_count = max_worker_count;
        self
    }

    /// Enables or disables stats collection, overriding the environment.
    pub fn with_collect_stats(mut self, collect_stats: bool) -> Self {
        self.collect_stats = collect_stats;
        self
    }
}

/// Reads the stats opt-in from the environment.
fn stats_enabled_from_env() -> bool {
    std::env::var(STATS_ENV_VAR)
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
