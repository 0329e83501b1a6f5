use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{FrozenError, OutputError, RunError, RunFault, ThawError};
use crate::freshness;
use crate::frozen::FrozenExecution;
use crate::graph::Graph;
use crate::remover::{OutputRemover, RemovalReason};
use crate::scheduler::{TaskFailure, TaskScheduler, TaskToken};
use crate::target::Target;
use crate::task::Task;

/// The state of a node within a particular execution.
///
/// Possible transitions:
///
/// ```text
/// NotReady  -> Ready
/// Ready     -> Scheduled      (task nodes)
/// Ready     -> Succeeded      (structure nodes; there is nothing to run)
/// Scheduled -> Succeeded
/// Scheduled -> Failed
/// ```
///
/// `Irrelevant` and the terminal states have no outgoing transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// The node is not part of the execution plan.
    Irrelevant,
    /// One or more dependencies have not finished executing.
    NotReady,
    /// Every dependency is satisfied; the node may be dispatched.
    Ready,
    /// The node's task has been handed to the scheduler.
    Scheduled,
    /// The node's task finished successfully (or the node had no task).
    Succeeded,
    /// The node's task failed.
    Failed,
}

impl NodeState {
    /// Whether a node in this state lets its dependents proceed.
    pub fn satisfies_dependency(self) -> bool {
        matches!(self, NodeState::Irrelevant | NodeState::Succeeded)
    }
}

/// The status of a node: its state, plus the scheduler-issued token while a
/// task instance is in flight.
///
/// Only task nodes ever carry a token. A `Scheduled` status without a token
/// means the driver was preempted between submitting the task and stamping
/// the token; snapshots downgrade it to `Ready`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Bare(NodeState),
    Scheduled(TaskToken),
}

impl NodeStatus {
    pub fn state(&self) -> NodeState {
        match self {
            NodeStatus::Bare(state) => *state,
            NodeStatus::Scheduled(_) => NodeState::Scheduled,
        }
    }

    pub fn token(&self) -> Option<&TaskToken> {
        match self {
            NodeStatus::Bare(_) => None,
            NodeStatus::Scheduled(token) => Some(token),
        }
    }

    pub(crate) fn is_scheduled(&self) -> bool {
        self.state() == NodeState::Scheduled
    }
}

/// The state of an execution driver.
///
/// `Idle -> Running -> (Idle | Shutdown) -> Idle`. `Shutdown` means no new
/// tasks are dispatched; already scheduled ones run to completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionState {
    Idle,
    Running,
    Shutdown,
}

struct Shared {
    statuses: Vec<NodeStatus>,
    ready: VecDeque<NodeIndex>,
    structures: VecDeque<NodeIndex>,
    completions: VecDeque<(NodeIndex, Option<TaskFailure>)>,
    faults: Vec<RunFault>,
    state: ExecutionState,
    /// Count of nodes currently in `Scheduled`.
    in_flight: usize,
    shutdown_on_failure: bool,
    interrupted: bool,
    driver_active: bool,
}

pub(crate) struct ExecInner<T: Task> {
    graph: Arc<Graph<T>>,
    shared: Mutex<Shared>,
    signal: Condvar,
}

/// Completion callback handed to a [`TaskScheduler`].
///
/// Holds only a weak reference to the execution, so a scheduler retaining
/// callbacks cannot keep a dropped execution alive; reports against a dead
/// execution are no-ops. The first report wins, any further reports for the
/// same task instance are ignored.
pub struct CompletionCallback<T: Task> {
    inner: Weak<ExecInner<T>>,
    node: NodeIndex,
}

impl<T: Task> Clone for CompletionCallback<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            node: self.node,
        }
    }
}

impl<T: Task> fmt::Debug for CompletionCallback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompletionCallback(#{})", self.node.index())
    }
}

impl<T: Task> CompletionCallback<T> {
    /// Reports that the task finished successfully.
    pub fn report_success(&self) {
        self.report(None);
    }

    /// Reports that the task failed.
    pub fn report_failure(&self, failure: impl Into<TaskFailure>) {
        self.report(Some(failure.into()));
    }

    fn report(&self, failure: Option<TaskFailure>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut shared = inner.shared.lock().unwrap();
        if !shared.statuses[self.node.index()].is_scheduled() {
            // Already reported, or the snapshot this callback belongs to has
            // moved on.
            return;
        }
        let next = if failure.is_some() {
            NodeState::Failed
        } else {
            NodeState::Succeeded
        };
        shared.statuses[self.node.index()] = NodeStatus::Bare(next);
        shared.in_flight -= 1;
        shared.completions.push_back((self.node, failure));
        drop(shared);
        inner.signal.notify_all();
    }
}

/// A single execution of a workflow: tracks per-node status, dispatches ready
/// nodes to the scheduler, and consumes completions until the run settles.
///
/// An execution is created over a [`Target`] (run everything, or skip nodes
/// whose outputs are fresh) or thawed from a [`FrozenExecution`]. The
/// [`run`](Execution::run) call drives it; [`shutdown`](Execution::shutdown)
/// and [`interrupt`](Execution::interrupt) may be invoked concurrently from
/// other threads through a shared reference.
pub struct Execution<T: Task> {
    inner: Arc<ExecInner<T>>,
    scheduler: Arc<dyn TaskScheduler<T>>,
    remover: OutputRemover,
}

impl<T: Task> Execution<T> {
    /// An execution that runs every node in `target`.
    ///
    /// In-target nodes with no in-target dependencies start `Ready`, the
    /// rest `NotReady`; nodes outside the target are `Irrelevant`.
    pub fn new(
        target: &Target<T>,
        scheduler: Arc<dyn TaskScheduler<T>>,
        remover: OutputRemover,
    ) -> Self {
        let graph = Arc::clone(target.graph());
        let to_run: HashSet<NodeIndex> = target.indices().collect();
        let statuses = initial_statuses(&graph, &to_run);
        Self::from_parts(graph, statuses, scheduler, remover)
    }

    /// An execution that picks up where output on disk (or wherever the
    /// outputs live) says the last one stopped.
    ///
    /// Runs the freshness analyzer, then marks for execution the in-target
    /// dependency closure of every target-tail node whose output is missing
    /// or out of date; everything else in the target is `Irrelevant`.
    pub fn from_existing_output(
        target: &Target<T>,
        scheduler: Arc<dyn TaskScheduler<T>>,
        remover: OutputRemover,
    ) -> Result<Self, OutputError> {
        let analysis = freshness::analyze(target)?;
        let graph = Arc::clone(target.graph());

        let seeds: Vec<NodeIndex> = target
            .indices()
            .filter(|&index| !graph.dependents(index).any(|dep| target.contains(dep)))
            .filter(|&index| analysis.needs_run(index))
            .collect();

        let mut to_run: HashSet<NodeIndex> = HashSet::new();
        let mut stack = seeds;
        while let Some(index) = stack.pop() {
            if to_run.insert(index) {
                for dep in graph.dependencies(index) {
                    if target.contains(dep) && analysis.needs_run(dep) && !to_run.contains(&dep) {
                        stack.push(dep);
                    }
                }
            }
        }

        debug!(
            target = target.len(),
            to_run = to_run.len(),
            "planned incremental execution"
        );

        let statuses = initial_statuses(&graph, &to_run);
        Ok(Self::from_parts(graph, statuses, scheduler, remover))
    }

    /// Rebuilds an execution from a snapshot.
    ///
    /// Statuses are adopted verbatim, except that `NotReady` nodes whose
    /// dependencies are all satisfied are promoted to `Ready`. For every
    /// in-flight node the snapshot's token is re-registered with `scheduler`;
    /// a rejected token fails construction.
    pub fn thaw(
        frozen: &FrozenExecution<T>,
        scheduler: Arc<dyn TaskScheduler<T>>,
        remover: OutputRemover,
    ) -> Result<Self, ThawError> {
        let graph = Arc::clone(frozen.graph());
        let mut statuses = frozen.status_slice().to_vec();

        for index in graph.indices() {
            if statuses[index.index()].state() == NodeState::NotReady
                && graph
                    .dependencies(index)
                    .all(|dep| statuses[dep.index()].state().satisfies_dependency())
            {
                statuses[index.index()] = NodeStatus::Bare(NodeState::Ready);
            }
        }

        let execution = Self::from_parts(graph, statuses, scheduler, remover);

        for index in execution.inner.graph.indices() {
            let token = {
                let shared = execution.inner.shared.lock().unwrap();
                shared.statuses[index.index()].token().cloned()
            };
            if let Some(token) = token {
                let callback = execution.callback(index);
                execution
                    .scheduler
                    .register_callback(&token, callback)
                    .map_err(|source| ThawError::TokenRejected {
                        key: execution.inner.graph.node(index).key().into(),
                        source,
                    })?;
            }
        }

        Ok(execution)
    }

    fn from_parts(
        graph: Arc<Graph<T>>,
        statuses: Vec<NodeStatus>,
        scheduler: Arc<dyn TaskScheduler<T>>,
        remover: OutputRemover,
    ) -> Self {
        let in_flight = statuses.iter().filter(|status| status.is_scheduled()).count();
        let inner = Arc::new(ExecInner {
            graph,
            shared: Mutex::new(Shared {
                statuses,
                ready: VecDeque::new(),
                structures: VecDeque::new(),
                completions: VecDeque::new(),
                faults: Vec::new(),
                state: ExecutionState::Idle,
                in_flight,
                shutdown_on_failure: true,
                interrupted: false,
                driver_active: false,
            }),
            signal: Condvar::new(),
        });
        Self {
            inner,
            scheduler,
            remover,
        }
    }

    fn callback(&self, node: NodeIndex) -> CompletionCallback<T> {
        CompletionCallback {
            inner: Arc::downgrade(&self.inner),
            node,
        }
    }

    /// The current driver state.
    pub fn state(&self) -> ExecutionState {
        self.inner.shared.lock().unwrap().state
    }

    /// A snapshot of every node's status, keyed by node key.
    pub fn statuses(&self) -> BTreeMap<String, NodeStatus> {
        let shared = self.inner.shared.lock().unwrap();
        self.inner
            .graph
            .indices()
            .map(|index| {
                (
                    self.inner.graph.node(index).key().to_string(),
                    shared.statuses[index.index()].clone(),
                )
            })
            .collect()
    }

    /// The status of a single node.
    pub fn status(&self, key: &str) -> Option<NodeStatus> {
        let index = self.inner.graph.index_of(key)?;
        let shared = self.inner.shared.lock().unwrap();
        Some(shared.statuses[index.index()].clone())
    }

    /// Whether a single task failure stops the dispatch of further work.
    /// Defaults to `true`; may be flipped at any time, including mid-run.
    pub fn set_shutdown_on_failure(&self, value: bool) {
        self.inner.shared.lock().unwrap().shutdown_on_failure = value;
    }

    pub fn shutdown_on_failure(&self) -> bool {
        self.inner.shared.lock().unwrap().shutdown_on_failure
    }

    /// Asks a running driver to stop dispatching new work. Tasks already
    /// handed to the scheduler run to completion.
    pub fn shutdown(&self) {
        let mut shared = self.inner.shared.lock().unwrap();
        if shared.state == ExecutionState::Running {
            shared.state = ExecutionState::Shutdown;
            debug!("shutdown requested");
        }
    }

    /// Asks a running driver to exit immediately, abandoning in-flight tasks.
    /// The corresponding [`run`](Execution::run) call reports an interrupted
    /// error once it observes the request.
    pub fn interrupt(&self) {
        let mut shared = self.inner.shared.lock().unwrap();
        shared.interrupted = true;
        drop(shared);
        self.inner.signal.notify_all();
    }

    /// A consistent snapshot of this execution.
    ///
    /// Fails while the driver is running. Task nodes recorded as `Scheduled`
    /// without a token are downgraded to `Ready` in the snapshot.
    pub fn freeze(&self) -> Result<FrozenExecution<T>, FrozenError> {
        let shared = self.inner.shared.lock().unwrap();
        if shared.driver_active {
            return Err(FrozenError::Running);
        }
        FrozenExecution::of(Arc::clone(&self.inner.graph), shared.statuses.clone())
    }

    /// Dispatches ready nodes and consumes completions until every node with
    /// satisfied dependencies has run, a failure shuts the driver down, or
    /// the driver is interrupted.
    ///
    /// Not re-entrant: a second concurrent call fails immediately.
    pub fn run(&self) -> Result<(), RunError> {
        {
            let mut shared = self.inner.shared.lock().unwrap();
            if shared.driver_active {
                return Err(RunError::single(RunFault::Unexpected(
                    "run() called while the driver is already active".into(),
                )));
            }
            shared.driver_active = true;
            shared.faults.clear();
            shared.interrupted = false;
            shared.state = ExecutionState::Running;
            shared.ready.clear();
            let ready: Vec<NodeIndex> = self
                .inner
                .graph
                .indices()
                .filter(|index| {
                    shared.statuses[index.index()] == NodeStatus::Bare(NodeState::Ready)
                })
                .collect();
            shared.ready.extend(ready);
        }

        let result = self.drive();

        let mut shared = self.inner.shared.lock().unwrap();
        shared.state = ExecutionState::Idle;
        shared.driver_active = false;
        drop(shared);

        result
    }

    fn drive(&self) -> Result<(), RunError> {
        let mut shared = self.inner.shared.lock().unwrap();
        shared = self.dispatch_ready(shared);

        loop {
            let settled = shared.in_flight == 0
                && shared.structures.is_empty()
                && shared.completions.is_empty();
            if settled {
                break;
            }

            if let Some(index) = shared.structures.pop_front() {
                // Structure nodes were marked Succeeded at dispatch; all that
                // is left is moving execution past them.
                self.propagate_readiness(&mut shared, index);
                shared = self.dispatch_ready(shared);
                continue;
            }

            if let Some((index, failure)) = shared.completions.pop_front() {
                match failure {
                    None => {
                        debug!(node = self.inner.graph.node(index).key(), "task succeeded");
                        self.propagate_readiness(&mut shared, index);
                        shared = self.dispatch_ready(shared);
                    }
                    Some(failure) => {
                        let key: Box<str> = self.inner.graph.node(index).key().into();
                        warn!(node = %key, error = %failure, "task failed");
                        shared.faults.push(RunFault::Task {
                            key: key.clone(),
                            failure,
                        });
                        if shared.shutdown_on_failure && shared.state == ExecutionState::Running {
                            shared.state = ExecutionState::Shutdown;
                        }
                        let errors = self.remover.remove_nodes(
                            &self.inner.graph,
                            &[index],
                            RemovalReason::ExecutionFailed,
                        );
                        shared
                            .faults
                            .extend(errors.into_iter().map(|OutputError { key, source }| {
                                RunFault::OutputIo { key, source }
                            }));
                    }
                }
                continue;
            }

            if shared.interrupted {
                shared.faults.push(RunFault::Interrupted);
                break;
            }
            shared = self.inner.signal.wait(shared).unwrap();
        }

        let faults = std::mem::take(&mut shared.faults);
        drop(shared);

        match RunError::from_faults(faults) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Pops ready nodes and dispatches them while the driver is `Running`.
    ///
    /// Task submission happens with the lock released: a synchronous
    /// scheduler may invoke the completion callback inside `submit`, and the
    /// callback needs the lock. On reacquisition the token is stamped only if
    /// the callback has not already moved the node on.
    fn dispatch_ready<'a>(
        &'a self,
        mut shared: MutexGuard<'a, Shared>,
    ) -> MutexGuard<'a, Shared> {
        while shared.state == ExecutionState::Running {
            let Some(index) = shared.ready.pop_front() else {
                break;
            };
            let node = self.inner.graph.node(index);
            match node.task() {
                None => {
                    shared.statuses[index.index()] = NodeStatus::Bare(NodeState::Succeeded);
                    shared.structures.push_back(index);
                    debug!(node = node.key(), "structure node passed");
                }
                Some(task) => {
                    shared.statuses[index.index()] = NodeStatus::Bare(NodeState::Scheduled);
                    shared.in_flight += 1;
                    let task = Arc::clone(task);
                    let callback = self.callback(index);
                    debug!(node = node.key(), "submitting task");

                    drop(shared);
                    let token = self.scheduler.submit(task, callback);
                    shared = self.inner.shared.lock().unwrap();

                    if let Some(token) = token
                        && shared.statuses[index.index()]
                            == NodeStatus::Bare(NodeState::Scheduled)
                    {
                        shared.statuses[index.index()] = NodeStatus::Scheduled(token);
                    }
                }
            }
        }
        shared
    }

    /// Marks dependents of a freshly satisfied node ready when the rest of
    /// their dependencies are satisfied too.
    fn propagate_readiness(&self, shared: &mut Shared, completed: NodeIndex) {
        let graph = &self.inner.graph;
        for dependent in graph.dependents(completed) {
            if shared.statuses[dependent.index()] == NodeStatus::Bare(NodeState::NotReady)
                && graph
                    .dependencies(dependent)
                    .all(|dep| shared.statuses[dep.index()].state().satisfies_dependency())
            {
                shared.statuses[dependent.index()] = NodeStatus::Bare(NodeState::Ready);
                shared.ready.push_back(dependent);
            }
        }
    }
}

fn initial_statuses<T: Task>(graph: &Graph<T>, to_run: &HashSet<NodeIndex>) -> Vec<NodeStatus> {
    graph
        .indices()
        .map(|index| {
            let state = if !to_run.contains(&index) {
                NodeState::Irrelevant
            } else if graph.dependencies(index).any(|dep| to_run.contains(&dep)) {
                NodeState::NotReady
            } else {
                NodeState::Ready
            };
            NodeStatus::Bare(state)
        })
        .collect()
}

#[cfg(test)]
pub(crate) fn callback_for<T: Task>(execution: &Execution<T>, key: &str) -> CompletionCallback<T> {
    let index = execution.inner.graph.index_of(key).expect("unknown key");
    execution.callback(index)
}
