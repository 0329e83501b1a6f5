use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::SystemTime;

use petgraph::graph::NodeIndex;
use tracing::debug;

use crate::error::OutputError;
use crate::target::Target;
use crate::task::{Output, Task};

/// Validated timestamp of a single output.
///
/// `Missing` stands in for outputs that do not exist or whose producing node
/// was invalidated; it orders *after* every concrete timestamp, so a missing
/// output is treated as newer than anything that depends on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum OutputStamp {
    At(SystemTime),
    Missing,
}

impl OutputStamp {
    pub fn is_missing(self) -> bool {
        matches!(self, OutputStamp::Missing)
    }
}

/// Result of a freshness pass over a target.
///
/// Holds the set of invalid nodes (nodes whose oldest output predates the
/// newest output among their in-target dependencies, direct or transitive)
/// and the validated per-output stamps. Stamps of invalid nodes are rewritten
/// to [`OutputStamp::Missing`] so the invalidation is visible downstream.
pub struct Analysis<T> {
    target: Target<T>,
    invalid: HashSet<NodeIndex>,
    stamps: HashMap<NodeIndex, Vec<OutputStamp>>,
    outputs: HashMap<NodeIndex, Vec<Arc<dyn Output>>>,
}

impl<T: Task> Analysis<T> {
    /// Whether the node with the given key had out-of-date output.
    pub fn is_invalid(&self, key: &str) -> bool {
        self.target
            .index_of(key)
            .is_some_and(|index| self.invalid.contains(&index))
    }

    /// Keys of invalid nodes, in topological order.
    pub fn invalid_keys(&self) -> impl Iterator<Item = &str> {
        self.target
            .indices()
            .filter(|index| self.invalid.contains(index))
            .map(|index| self.target.graph().node(index).key())
    }

    /// Validated stamps for the outputs of a node, in the order the node's
    /// task reported them.
    pub fn stamps(&self, key: &str) -> Option<&[OutputStamp]> {
        let index = self.target.index_of(key)?;
        self.stamps.get(&index).map(Vec::as_slice)
    }

    pub(crate) fn invalid_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.target
            .indices()
            .filter(|index| self.invalid.contains(index))
    }

    /// Whether a node must run again: it has no outputs at all, or any of its
    /// outputs is missing or was invalidated.
    pub(crate) fn needs_run(&self, index: NodeIndex) -> bool {
        let outputs = &self.outputs[&index];
        outputs.is_empty() || self.stamps[&index].iter().any(|stamp| stamp.is_missing())
    }
}

/// Reads output timestamps across `target` and computes which nodes are out
/// of date relative to their in-target dependencies.
///
/// Missing outputs are recorded as [`OutputStamp::Missing`], which both
/// forces the owning node to rerun (see
/// [`Execution::from_existing_output`](crate::Execution::from_existing_output))
/// and invalidates everything downstream of it.
pub fn analyze<T: Task>(target: &Target<T>) -> Result<Analysis<T>, OutputError> {
    let graph = target.graph();

    // Cache outputs once per node; the Output contract only promises that
    // repeated `outputs()` calls describe the same data, not that they return
    // identical handles.
    let mut outputs: HashMap<NodeIndex, Vec<Arc<dyn Output>>> = HashMap::new();
    let mut stamps: HashMap<NodeIndex, Vec<OutputStamp>> = HashMap::new();
    for index in target.indices() {
        let node = graph.node(index);
        let node_outputs = node.task().map(|task| task.outputs()).unwrap_or_default();
        let mut node_stamps = Vec::with_capacity(node_outputs.len());
        for output in &node_outputs {
            let stamp = output
                .timestamp()
                .map_err(|source| OutputError {
                    key: node.key().into(),
                    source,
                })?
                .map_or(OutputStamp::Missing, OutputStamp::At);
            node_stamps.push(stamp);
        }
        outputs.insert(index, node_outputs);
        stamps.insert(index, node_stamps);
    }

    // Fold in topological order: the newest stamp seen anywhere among a
    // node's direct and transitive in-target dependencies.
    let mut newest_upstream: HashMap<NodeIndex, Option<OutputStamp>> = HashMap::new();
    let mut invalid = HashSet::new();

    for index in target.indices() {
        let mut upstream: Option<OutputStamp> = None;
        for dep in graph.dependencies(index) {
            if !target.contains(dep) {
                continue;
            }
            for &stamp in &stamps[&dep] {
                upstream = upstream.max(Some(stamp));
            }
            upstream = upstream.max(newest_upstream[&dep]);
        }
        newest_upstream.insert(index, upstream);

        let oldest_own = stamps[&index]
            .iter()
            .copied()
            .min()
            .unwrap_or(OutputStamp::Missing);

        if graph.node(index).has_task() && upstream.is_some_and(|up| up > oldest_own) {
            invalid.insert(index);
            // Poison this node's stamps so the invalidation cascades.
            for stamp in stamps.get_mut(&index).unwrap() {
                *stamp = OutputStamp::Missing;
            }
        }
    }

    debug!(
        nodes = target.len(),
        invalid = invalid.len(),
        "freshness analysis finished"
    );

    Ok(Analysis {
        target: target.clone(),
        invalid,
        stamps,
        outputs,
    })
}
