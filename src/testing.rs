//! Shared test fixtures: a logical clock, in-memory outputs, a controllable
//! task, a synchronous scheduler, and the canonical test graphs.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::InvalidTokenError;
use crate::execution::CompletionCallback;
use crate::graph::Graph;
use crate::node::Blueprint;
use crate::scheduler::{TaskFailure, TaskScheduler, TaskToken};
use crate::task::{Output, Task};

/// Monotonic logical clock. Real wall-clock resolution is too coarse to
/// order back-to-back task completions deterministically.
pub(crate) fn tick() -> SystemTime {
    static CLOCK: AtomicU64 = AtomicU64::new(1);
    UNIX_EPOCH + Duration::from_micros(CLOCK.fetch_add(1, Ordering::Relaxed))
}

/// An output living entirely in memory.
pub(crate) struct MemoryOutput {
    stamp: Mutex<Option<SystemTime>>,
    fail_delete: bool,
}

impl MemoryOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            stamp: Mutex::new(None),
            fail_delete: false,
        })
    }

    /// An output whose deletion fails while it exists.
    pub fn failing_delete() -> Arc<Self> {
        Arc::new(Self {
            stamp: Mutex::new(None),
            fail_delete: true,
        })
    }

    pub fn stamp_now(&self) {
        *self.stamp.lock().unwrap() = Some(tick());
    }

    pub fn clear(&self) {
        *self.stamp.lock().unwrap() = None;
    }
}

impl Output for MemoryOutput {
    fn timestamp(&self) -> io::Result<Option<SystemTime>> {
        Ok(*self.stamp.lock().unwrap())
    }

    fn delete(&self) -> io::Result<()> {
        let mut stamp = self.stamp.lock().unwrap();
        if self.fail_delete && stamp.is_some() {
            return Err(io::Error::other("output refuses deletion"));
        }
        *stamp = None;
        Ok(())
    }
}

/// A task with distinct start and finish outputs, stamped when it runs.
///
/// The gap between the two stamps is what makes dependency-ordering
/// assertions possible: a correctly ordered execution never starts a node
/// before the finish stamp of each of its dependencies.
pub(crate) struct TestTask {
    start: Arc<MemoryOutput>,
    finish: Arc<MemoryOutput>,
    fail_on_run: bool,
    gate: Option<Arc<Barrier>>,
}

impl TestTask {
    pub fn succeeding() -> Self {
        Self {
            start: MemoryOutput::new(),
            finish: MemoryOutput::new(),
            fail_on_run: false,
            gate: None,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_on_run: true,
            ..Self::succeeding()
        }
    }

    /// Fails on run, and its outputs refuse deletion while they exist.
    pub fn failing_delete() -> Self {
        Self {
            start: MemoryOutput::failing_delete(),
            finish: MemoryOutput::failing_delete(),
            fail_on_run: false,
            gate: None,
        }
    }

    /// Fails on run; only the start output (the one that exists by then)
    /// refuses deletion.
    pub fn failing_with_stuck_output() -> Self {
        Self {
            start: MemoryOutput::failing_delete(),
            finish: MemoryOutput::failing_delete(),
            fail_on_run: true,
            gate: None,
        }
    }

    /// Blocks on the barrier before finishing.
    pub fn blocking_on(gate: Arc<Barrier>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::succeeding()
        }
    }

    pub fn run(&self) -> anyhow::Result<()> {
        self.start.stamp_now();
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        if self.fail_on_run {
            anyhow::bail!("task exploded");
        }
        self.finish.stamp_now();
        Ok(())
    }

    pub fn stamp_outputs(&self) {
        self.start.stamp_now();
        self.finish.stamp_now();
    }

    pub fn clear_outputs(&self) {
        self.start.clear();
        self.finish.clear();
    }

    pub fn start_stamp(&self) -> Option<SystemTime> {
        self.start.timestamp().unwrap()
    }

    pub fn finish_stamp(&self) -> Option<SystemTime> {
        self.finish.timestamp().unwrap()
    }

    pub fn has_output(&self) -> bool {
        self.start_stamp().is_some() || self.finish_stamp().is_some()
    }
}

impl Task for TestTask {
    fn outputs(&self) -> Vec<Arc<dyn Output>> {
        vec![self.start.clone(), self.finish.clone()]
    }
}

/// A serializable task with no outputs, for persistence tests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SerTask {
    pub name: String,
}

impl SerTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Task for SerTask {
    fn outputs(&self) -> Vec<Arc<dyn Output>> {
        Vec::new()
    }
}

/// A scheduler that runs the task inline, invoking the callback before
/// `submit` returns and returning no token. Exercises the synchronous
/// completion path through the driver's lock release.
pub(crate) struct DirectScheduler;

impl TaskScheduler<TestTask> for DirectScheduler {
    fn submit(
        &self,
        task: Arc<TestTask>,
        callback: CompletionCallback<TestTask>,
    ) -> Option<TaskToken> {
        match task.run() {
            Ok(()) => callback.report_success(),
            Err(error) => callback.report_failure(TaskFailure::from(error)),
        }
        None
    }

    fn register_callback(
        &self,
        token: &TaskToken,
        _callback: CompletionCallback<TestTask>,
    ) -> Result<(), InvalidTokenError> {
        Err(InvalidTokenError {
            token: token.clone(),
        })
    }
}

/// The canonical eight-node graph:
///
/// ```text
/// 0-1-2-3-4
///    \ /
///   5-6-7
/// ```
///
/// Node 3 depends on 2 and 6; node 6 depends on 1 and 5.
pub(crate) fn canonical_graph(make: impl Fn(usize) -> TestTask) -> Arc<Graph<TestTask>> {
    let mut blueprint = Blueprint::new();
    let nodes: Vec<_> = (0..8)
        .map(|i| blueprint.task_keyed(i.to_string(), make(i)))
        .collect();
    blueprint.depends_on(nodes[1], [nodes[0]]);
    blueprint.depends_on(nodes[2], [nodes[1]]);
    blueprint.depends_on(nodes[3], [nodes[2], nodes[6]]);
    blueprint.depends_on(nodes[4], [nodes[3]]);
    blueprint.depends_on(nodes[6], [nodes[1], nodes[5]]);
    blueprint.depends_on(nodes[7], [nodes[6]]);
    Arc::new(Graph::create(blueprint).unwrap())
}

/// A linear chain `a0 <- a1 <- ... <- a{n-1}`.
pub(crate) fn chain_graph(length: usize) -> Arc<Graph<TestTask>> {
    let mut blueprint = Blueprint::new();
    let mut previous = None;
    for i in 0..length {
        let node = blueprint.task_keyed(format!("a{i}"), TestTask::succeeding());
        if let Some(previous) = previous {
            blueprint.depends_on(node, [previous]);
        }
        previous = Some(node);
    }
    Arc::new(Graph::create(blueprint).unwrap())
}

/// Stamps of every output of every task in the graph, keyed by node key.
pub(crate) fn all_stamps(graph: &Graph<TestTask>) -> HashMap<String, Vec<Option<SystemTime>>> {
    graph
        .nodes()
        .filter_map(|node| {
            node.task().map(|task| {
                (
                    node.key().to_string(),
                    vec![task.start_stamp(), task.finish_stamp()],
                )
            })
        })
        .collect()
}
