//! The work-source contract.
//!
//! A work source is one plan: a graph of nodes with scheduling state. The
//! executor core never reaches inside a source; it drives it entirely
//! through the [`WorkSource`] trait. Concrete graph implementations (task
//! graphs, work queues, composites) live outside this crate.
//!
//! Every method on [`WorkSource`] is invoked with the coordination lock
//! held. The source is responsible for honoring the resource locks its
//! nodes declare (project lock, named shared resources) at `select_next`
//! time; a node whose locks cannot all be acquired stays in the ready set.

use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

use super::resource_lock::SharedResourceLock;
use crate::diagnostics::TreeFormatter;

/// A failure flowing through the executor.
///
/// Shared so a single cause can be fanned out to every source aborted by
/// it and collected into several failure lists without copying.
pub type WorkFailure = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// An opaque failure with a message.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct NodeFailure {
    message: String,
}

/// Creates a [`WorkFailure`] from a message.
pub fn node_failure(message: impl Into<String>) -> WorkFailure {
    Arc::new(NodeFailure {
        message: message.into(),
    })
}

/// A unit of work produced by a source.
///
/// The core treats nodes as opaque values: it selects them, hands them to
/// the plan's action, and reports them finished. Actions that need the
/// concrete type downcast through [`as_any`](WorkNode::as_any).
pub trait WorkNode: Send + Sync {
    /// Human-readable name for logging and diagnostics.
    fn display_name(&self) -> String;

    /// The per-project mutex this node requires, if any.
    ///
    /// Enforced by the owning source at `select_next` time, together with
    /// [`resources_to_lock`](Self::resources_to_lock) and the worker lease.
    fn project_to_lock(&self) -> Option<Arc<SharedResourceLock>> {
        None
    }

    /// The named shared resources this node requires.
    fn resources_to_lock(&self) -> Vec<Arc<SharedResourceLock>> {
        Vec::new()
    }

    /// An isolated node declares no project lock.
    fn is_isolated(&self) -> bool {
        self.project_to_lock().is_none()
    }

    /// Access to the concrete node type.
    fn as_any(&self) -> &dyn Any;
}

/// The action run against each selected node, outside the coordination
/// lock. A returned error (or a panic) is captured and reported to the
/// node's source via `finished_executing`.
pub type NodeAction = Arc<dyn Fn(&dyn WorkNode) -> Result<(), WorkFailure> + Send + Sync>;

/// Scheduling state of a source, without selecting anything.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceState {
    /// The source may have a node ready to start.
    MaybeWorkReadyToStart,
    /// Nodes remain, but none can start right now.
    NoWorkReadyToStart,
    /// The source will never release another node.
    NoMoreWorkToStart,
}

/// Outcome of asking a source (or the merged queue) for the next node.
#[derive(Clone, Debug)]
pub enum Selection<T> {
    /// A node ready to execute. Ownership of the node's scheduling state
    /// has already transferred to the caller.
    Item(T),
    /// Nodes remain, but none can start right now.
    NoWorkReadyToStart,
    /// The source will never release another node.
    NoMoreWorkToStart,
}

impl<T> Selection<T> {
    /// Returns true for the `NoWorkReadyToStart` case.
    pub fn is_no_work_ready(&self) -> bool {
        matches!(self, Selection::NoWorkReadyToStart)
    }

    /// Returns true for the `NoMoreWorkToStart` case.
    pub fn is_no_more_work(&self) -> bool {
        matches!(self, Selection::NoMoreWorkToStart)
    }
}

/// Health diagnostics reported by a source for the liveness report.
#[derive(Clone, Debug)]
pub struct SourceDiagnostics {
    /// The source's display name, with a short queue summary.
    pub display_name: String,
    /// One line per queued item that cannot be started.
    pub items: Vec<String>,
}

impl SourceDiagnostics {
    /// Creates diagnostics with no item detail.
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            items: Vec::new(),
        }
    }

    /// Adds per-item detail lines.
    pub fn with_items(mut self, items: Vec<String>) -> Self {
        self.items = items;
        self
    }

    /// Renders this source's entry into the liveness report.
    pub fn describe_to(&self, formatter: &mut TreeFormatter) {
        formatter.node(self.display_name.clone());
        if !self.items.is_empty() {
            formatter.start_children();
            for item in &self.items {
                formatter.node(item.clone());
            }
            formatter.end_children();
        }
    }
}

/// One plan: a graph of nodes with scheduling state.
///
/// All methods are invoked with the coordination lock held; implementations
/// must not block. `select_next` and `finished_executing` return an error
/// to signal that the source itself is broken; the executor responds by
/// aborting every live source in the merged queue.
pub trait WorkSource: Send + Sync {
    /// Display name for logging and diagnostics.
    fn display_name(&self) -> String;

    /// Current scheduling state, without selecting anything.
    fn execution_state(&self) -> SourceState;

    /// Selects the next ready node, atomically moving it out of the ready
    /// set so no other worker can select it.
    fn select_next(&self) -> Result<Selection<Arc<dyn WorkNode>>, WorkFailure>;

    /// Returns true once every node has reached a terminal state.
    fn all_execution_complete(&self) -> bool;

    /// Reports the outcome of a selected node. May cascade cancellations
    /// inside the source; a failure becomes part of the source's collected
    /// failures.
    fn finished_executing(
        &self,
        node: Arc<dyn WorkNode>,
        failure: Option<WorkFailure>,
    ) -> Result<(), WorkFailure>;

    /// Appends the source's collected failures to `sink`.
    fn collect_failures(&self, sink: &mut Vec<WorkFailure>);

    /// Begins a graceful stop: no further nodes are released; nodes already
    /// executing complete normally.
    fn cancel_execution(&self);

    /// Hard stop: fails every unstarted node with `cause`.
    fn abort_all_and_fail(&self, cause: WorkFailure);

    /// Diagnostics for the liveness report.
    fn health_diagnostics(&self) -> SourceDiagnostics;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_failure_message() {
        let failure = node_failure("boom");
        assert_eq!(failure.to_string(), "boom");
    }

    #[test]
    fn test_selection_predicates() {
        assert!(Selection::<u32>::NoWorkReadyToStart.is_no_work_ready());
        assert!(Selection::<u32>::NoMoreWorkToStart.is_no_more_work());
        assert!(!Selection::Item(1).is_no_work_ready());
        assert!(!Selection::Item(1).is_no_more_work());
    }

    #[test]
    fn test_diagnostics_render_items_as_children() {
        let mut formatter = TreeFormatter::new();
        SourceDiagnostics::new("plan 'build': 2 nodes queued")
            .with_items(vec!["compile".to_string(), "link".to_string()])
            .describe_to(&mut formatter);

        assert_eq!(
            formatter.to_string(),
            "plan 'build': 2 nodes queued\n  - compile\n  - link"
        );
    }

    #[test]
    fn test_isolated_node_has_no_project_lock() {
        struct Isolated;
        impl WorkNode for Isolated {
            fn display_name(&self) -> String {
                "isolated".to_string()
            }
            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
        }

        let node = Isolated;
        assert!(node.is_isolated());
        assert!(node.resources_to_lock().is_empty());
    }
}
