//! The merged queue of live plans.
//!
//! Workers never talk to an individual plan; they see one virtual queue
//! over the ordered list of live plans. A scan visits plans head-first and
//! garbage-collects plans whose every node has completed. Newly submitted
//! plans are prepended, on the assumption that work already running depends
//! on them; this biases scheduling toward the most recently added plan and
//! is deliberately not starvation-free.
//!
//! Two queues exist per build: the shared queue serving the worker pool,
//! and a private `auto_finish` queue per `process` call holding only that
//! call's plan, so the submitting thread can participate as a worker and
//! stop as soon as its own plan has drained.

use std::sync::{Arc, Mutex};

use super::coordination::StateCoordinator;
use super::error::ExecutorError;
use super::source::{NodeAction, Selection, SourceState, WorkFailure, WorkNode, WorkSource};
use crate::diagnostics::TreeFormatter;

/// A submitted plan: its source and the action to run against each node.
#[derive(Clone)]
pub struct PlanDetails {
    pub(crate) source: Arc<dyn WorkSource>,
    pub(crate) action: NodeAction,
}

impl PlanDetails {
    /// Pairs a source with its node action.
    pub fn new(source: Arc<dyn WorkSource>, action: NodeAction) -> Self {
        Self { source, action }
    }
}

impl std::fmt::Debug for PlanDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanDetails")
            .field("source", &self.source.display_name())
            .finish_non_exhaustive()
    }
}

/// A selected node, bound to its plan and action.
///
/// Lives only from selection until the action returns and the node has
/// been marked finished.
pub(crate) struct WorkItem {
    pub(crate) node: Arc<dyn WorkNode>,
    pub(crate) plan: Arc<dyn WorkSource>,
    pub(crate) action: NodeAction,
}

#[derive(Default)]
struct QueueState {
    finished: bool,
    plans: Vec<PlanDetails>,
}

impl QueueState {
    fn nothing_more_to_start(&self, auto_finish: bool) -> bool {
        self.finished || (auto_finish && self.plans.is_empty())
    }
}

/// Ordered collection of live plans presented to workers as one queue.
///
/// Every method must be called with the coordination lock held, except
/// [`add`](Self::add) and [`close`](Self::close) which take it themselves.
pub struct MergedQueue {
    coordinator: Arc<StateCoordinator>,
    auto_finish: bool,
    state: Mutex<QueueState>,
}

impl MergedQueue {
    /// Creates an empty queue.
    ///
    /// An `auto_finish` queue reports `NoMoreWorkToStart` as soon as it is
    /// empty; the shared queue instead stays open until closed.
    pub fn new(coordinator: Arc<StateCoordinator>, auto_finish: bool) -> Self {
        Self {
            coordinator,
            auto_finish,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Scheduling state across all live plans.
    ///
    /// Plans that have announced no-more-work and completed execution are
    /// removed mid-scan; plans that have announced no-more-work but still
    /// have nodes running remain so that their failures stay observable.
    pub fn execution_state(&self) -> SourceState {
        self.coordinator.assert_has_state_lock();
        let mut state = self.state.lock().expect("queue state poisoned");
        let mut index = 0;
        while index < state.plans.len() {
            let source = state.plans[index].source.clone();
            match source.execution_state() {
                SourceState::NoMoreWorkToStart => {
                    if source.all_execution_complete() {
                        state.plans.remove(index);
                        continue;
                    }
                }
                SourceState::MaybeWorkReadyToStart => {
                    return SourceState::MaybeWorkReadyToStart;
                }
                SourceState::NoWorkReadyToStart => {}
            }
            index += 1;
        }
        if state.nothing_more_to_start(self.auto_finish) {
            SourceState::NoMoreWorkToStart
        } else {
            SourceState::NoWorkReadyToStart
        }
    }

    /// Selects the next ready node across all live plans.
    ///
    /// The first plan with a ready node wins. An error from a source's
    /// `select_next` propagates to the worker, which aborts the whole
    /// queue.
    pub(crate) fn select_next(&self) -> Result<Selection<WorkItem>, WorkFailure> {
        self.coordinator.assert_has_state_lock();
        let mut state = self.state.lock().expect("queue state poisoned");
        let mut index = 0;
        while index < state.plans.len() {
            let details = state.plans[index].clone();
            match details.source.select_next()? {
                Selection::NoMoreWorkToStart => {
                    if details.source.all_execution_complete() {
                        state.plans.remove(index);
                        continue;
                    }
                }
                Selection::NoWorkReadyToStart => {}
                Selection::Item(node) => {
                    return Ok(Selection::Item(WorkItem {
                        node,
                        plan: details.source.clone(),
                        action: details.action.clone(),
                    }));
                }
            }
            index += 1;
        }
        if state.nothing_more_to_start(self.auto_finish) {
            Ok(Selection::NoMoreWorkToStart)
        } else {
            Ok(Selection::NoWorkReadyToStart)
        }
    }

    /// Adds a plan to the head of the queue and wakes the workers.
    ///
    /// Fails once the queue has been closed.
    pub fn add(&self, plan: PlanDetails) -> Result<(), ExecutorError> {
        self.coordinator.run_with_state_lock(|| {
            let mut state = self.state.lock().expect("queue state poisoned");
            if state.finished {
                return Err(ExecutorError::QueueClosed);
            }
            // Work already running is assumed to depend on the new plan.
            state.plans.insert(0, plan);
            drop(state);
            self.coordinator.notify_state_change();
            Ok(())
        })
    }

    /// Removes every plan whose execution has completed.
    pub fn remove_finished_plans(&self) {
        self.coordinator.assert_has_state_lock();
        let mut state = self.state.lock().expect("queue state poisoned");
        state
            .plans
            .retain(|details| !details.source.all_execution_complete());
    }

    /// Marks the queue finished and wakes the workers.
    ///
    /// Fails if any plan is still live; the queue is closed regardless so
    /// workers drain out.
    pub fn close(&self) -> Result<(), ExecutorError> {
        self.coordinator.run_with_state_lock(|| {
            let mut state = self.state.lock().expect("queue state poisoned");
            state.finished = true;
            let drained = state.plans.is_empty();
            drop(state);
            self.coordinator.notify_state_change();
            if drained {
                Ok(())
            } else {
                Err(ExecutorError::QueueNotDrained)
            }
        })
    }

    /// Requests a graceful stop from every live source.
    pub fn cancel_execution(&self) {
        self.coordinator.assert_has_state_lock();
        let plans = self.live_plans();
        for details in plans {
            details.source.cancel_execution();
        }
    }

    /// Fails every live source's unstarted work with `cause` and wakes the
    /// workers.
    pub fn abort_all_and_fail(&self, cause: WorkFailure) {
        self.coordinator.assert_has_state_lock();
        let plans = self.live_plans();
        for details in &plans {
            details.source.abort_all_and_fail(cause.clone());
        }
        self.coordinator.notify_state_change();
    }

    /// Returns true when every live source reports `NoMoreWorkToStart`.
    pub fn nothing_queued(&self) -> bool {
        self.coordinator.assert_has_state_lock();
        let plans = self.live_plans();
        plans
            .iter()
            .all(|details| details.source.execution_state() == SourceState::NoMoreWorkToStart)
    }

    /// Renders every live source's diagnostics into the liveness report.
    pub fn append_health_diagnostics(&self, formatter: &mut TreeFormatter) {
        self.coordinator.assert_has_state_lock();
        let plans = self.live_plans();
        let diagnostics: Vec<_> = plans
            .iter()
            .map(|details| details.source.health_diagnostics())
            .collect();
        for entry in diagnostics {
            entry.describe_to(formatter);
        }
    }

    /// Snapshot of the live plans, so source callbacks run without the
    /// queue state borrowed.
    fn live_plans(&self) -> Vec<PlanDetails> {
        self.state
            .lock()
            .expect("queue state poisoned")
            .plans
            .clone()
    }
}

impl std::fmt::Debug for MergedQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("queue state poisoned");
        f.debug_struct("MergedQueue")
            .field("auto_finish", &self.auto_finish)
            .field("finished", &state.finished)
            .field("plans", &state.plans.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::source::SourceDiagnostics;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// A scripted source for exercising queue scans.
    struct StubSource {
        name: String,
        state: StdMutex<StubState>,
        cancelled: AtomicUsize,
    }

    struct StubState {
        remaining: Vec<&'static str>,
        running: usize,
        failures: Vec<WorkFailure>,
    }

    struct StubNode(String);

    impl WorkNode for StubNode {
        fn display_name(&self) -> String {
            self.0.clone()
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    impl StubSource {
        fn new(name: &str, nodes: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                state: StdMutex::new(StubState {
                    remaining: nodes,
                    running: 0,
                    failures: Vec::new(),
                }),
                cancelled: AtomicUsize::new(0),
            })
        }
    }

    impl WorkSource for StubSource {
        fn display_name(&self) -> String {
            self.name.clone()
        }

        fn execution_state(&self) -> SourceState {
            let state = self.state.lock().unwrap();
            if !state.remaining.is_empty() {
                SourceState::MaybeWorkReadyToStart
            } else {
                SourceState::NoMoreWorkToStart
            }
        }

        fn select_next(&self) -> Result<Selection<Arc<dyn WorkNode>>, WorkFailure> {
            let mut state = self.state.lock().unwrap();
            match state.remaining.pop() {
                Some(name) => {
                    state.running += 1;
                    Ok(Selection::Item(Arc::new(StubNode(name.to_string()))))
                }
                None => Ok(Selection::NoMoreWorkToStart),
            }
        }

        fn all_execution_complete(&self) -> bool {
            let state = self.state.lock().unwrap();
            state.remaining.is_empty() && state.running == 0
        }

        fn finished_executing(
            &self,
            _node: Arc<dyn WorkNode>,
            failure: Option<WorkFailure>,
        ) -> Result<(), WorkFailure> {
            let mut state = self.state.lock().unwrap();
            state.running -= 1;
            if let Some(failure) = failure {
                state.failures.push(failure);
            }
            Ok(())
        }

        fn collect_failures(&self, sink: &mut Vec<WorkFailure>) {
            sink.extend(self.state.lock().unwrap().failures.iter().cloned());
        }

        fn cancel_execution(&self) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }

        fn abort_all_and_fail(&self, cause: WorkFailure) {
            let mut state = self.state.lock().unwrap();
            state.remaining.clear();
            state.failures.push(cause);
        }

        fn health_diagnostics(&self) -> SourceDiagnostics {
            SourceDiagnostics::new(self.name.clone())
        }
    }

    fn noop_action() -> NodeAction {
        Arc::new(|_node| Ok(()))
    }

    fn queue(auto_finish: bool) -> (Arc<StateCoordinator>, MergedQueue) {
        let coordinator = Arc::new(StateCoordinator::new());
        let queue = MergedQueue::new(coordinator.clone(), auto_finish);
        (coordinator, queue)
    }

    #[test]
    fn test_empty_shared_queue_has_no_ready_work() {
        let (coordinator, queue) = queue(false);
        let state = coordinator.run_with_state_lock(|| queue.execution_state());
        assert_eq!(state, SourceState::NoWorkReadyToStart);
    }

    #[test]
    fn test_empty_auto_finish_queue_reports_no_more_work() {
        let (coordinator, queue) = queue(true);
        let state = coordinator.run_with_state_lock(|| queue.execution_state());
        assert_eq!(state, SourceState::NoMoreWorkToStart);
    }

    #[test]
    fn test_add_prepends_new_plans() {
        let (coordinator, queue) = queue(false);
        let first = StubSource::new("first", vec!["a"]);
        let second = StubSource::new("second", vec!["b"]);
        queue.add(PlanDetails::new(first, noop_action())).unwrap();
        queue
            .add(PlanDetails::new(second.clone(), noop_action()))
            .unwrap();

        // The newest plan is scanned first.
        let selection = coordinator.run_with_state_lock(|| queue.select_next().unwrap());
        match selection {
            Selection::Item(item) => assert_eq!(item.node.display_name(), "b"),
            _ => panic!("expected a selected node"),
        }
    }

    #[test]
    fn test_add_to_closed_queue_fails() {
        let (_coordinator, queue) = queue(false);
        queue.close().unwrap();
        let source = StubSource::new("late", vec![]);
        let result = queue.add(PlanDetails::new(source, noop_action()));
        assert!(matches!(result, Err(ExecutorError::QueueClosed)));
    }

    #[test]
    fn test_close_with_live_plans_fails() {
        let (_coordinator, queue) = queue(false);
        let source = StubSource::new("live", vec!["a"]);
        queue.add(PlanDetails::new(source, noop_action())).unwrap();
        assert!(matches!(queue.close(), Err(ExecutorError::QueueNotDrained)));
    }

    #[test]
    fn test_scan_removes_completed_plans() {
        let (coordinator, queue) = queue(false);
        let done = StubSource::new("done", vec![]);
        queue
            .add(PlanDetails::new(done.clone(), noop_action()))
            .unwrap();

        let state = coordinator.run_with_state_lock(|| queue.execution_state());
        assert_eq!(state, SourceState::NoWorkReadyToStart);
        // The completed plan was garbage-collected, so closing succeeds.
        queue.close().unwrap();
    }

    #[test]
    fn test_closed_queue_reports_no_more_work() {
        let (coordinator, queue) = queue(false);
        queue.close().unwrap();
        let state = coordinator.run_with_state_lock(|| queue.execution_state());
        assert_eq!(state, SourceState::NoMoreWorkToStart);
    }

    #[test]
    fn test_cancel_forwards_to_every_live_source() {
        let (coordinator, queue) = queue(false);
        let first = StubSource::new("first", vec!["a"]);
        let second = StubSource::new("second", vec!["b"]);
        queue
            .add(PlanDetails::new(first.clone(), noop_action()))
            .unwrap();
        queue
            .add(PlanDetails::new(second.clone(), noop_action()))
            .unwrap();

        coordinator.run_with_state_lock(|| queue.cancel_execution());
        assert_eq!(first.cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(second.cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_abort_fans_out_one_cause() {
        let (coordinator, queue) = queue(false);
        let first = StubSource::new("first", vec!["a"]);
        let second = StubSource::new("second", vec!["b"]);
        queue
            .add(PlanDetails::new(first.clone(), noop_action()))
            .unwrap();
        queue
            .add(PlanDetails::new(second.clone(), noop_action()))
            .unwrap();

        coordinator.run_with_state_lock(|| {
            queue.abort_all_and_fail(super::super::source::node_failure("stop"))
        });

        let mut failures = Vec::new();
        first.collect_failures(&mut failures);
        second.collect_failures(&mut failures);
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|f| f.to_string() == "stop"));
    }

    #[test]
    fn test_nothing_queued() {
        let (coordinator, queue) = queue(false);
        assert!(coordinator.run_with_state_lock(|| queue.nothing_queued()));

        let source = StubSource::new("busy", vec!["a"]);
        queue
            .add(PlanDetails::new(source.clone(), noop_action()))
            .unwrap();
        assert!(!coordinator.run_with_state_lock(|| queue.nothing_queued()));
    }

    #[test]
    fn test_select_drains_plan_then_reports_no_more_work() {
        let (coordinator, queue) = queue(true);
        let source = StubSource::new("single", vec!["only"]);
        queue
            .add(PlanDetails::new(source.clone(), noop_action()))
            .unwrap();

        coordinator.run_with_state_lock(|| {
            let first = queue.select_next().unwrap();
            let item = match first {
                Selection::Item(item) => item,
                _ => panic!("expected a selected node"),
            };
            // Node still running: the plan stays live.
            assert!(!matches!(
                queue.select_next().unwrap(),
                Selection::NoMoreWorkToStart
            ));
            item.plan.finished_executing(item.node.clone(), None).unwrap();
            // Drained and auto_finish: the queue is done.
            assert!(matches!(
                queue.select_next().unwrap(),
                Selection::NoMoreWorkToStart
            ));
        });
    }
}
