//! Executor error types.

use thiserror::Error;

/// Errors surfaced by the plan executor and its merged queues.
///
/// Failures produced by node actions or work sources do not use this type;
/// they flow through [`WorkFailure`](super::source::WorkFailure) and are
/// collected into the [`ExecutionResult`](super::ExecutionResult) returned
/// from `process`.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The configured worker count is not a positive number.
    #[error("not a valid number of parallel executors: {0}")]
    InvalidParallelism(usize),

    /// A plan was added to a merged queue that has been closed.
    #[error("this queue has been closed")]
    QueueClosed,

    /// A merged queue was closed while plans were still live.
    #[error("not all work has completed")]
    QueueNotDrained,

    /// Work is queued but no worker can start any of it.
    ///
    /// The report carries the full diagnostic tree: each queued source's
    /// own diagnostics plus waiting and stopped worker counts.
    #[error("{report}")]
    NoProgress {
        /// Rendered diagnostic tree; begins with
        /// `"Unable to make progress running work"`.
        report: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_parallelism_message() {
        let err = ExecutorError::InvalidParallelism(0);
        assert_eq!(
            err.to_string(),
            "not a valid number of parallel executors: 0"
        );
    }

    #[test]
    fn test_no_progress_message_keeps_report() {
        let err = ExecutorError::NoProgress {
            report: "Unable to make progress running work. Details follow.".to_string(),
        };
        assert!(err
            .to_string()
            .starts_with("Unable to make progress running work"));
    }
}
