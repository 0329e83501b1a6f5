use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, SerializeStruct, Serializer};

use crate::error::FrozenError;
use crate::execution::{NodeState, NodeStatus};
use crate::graph::Graph;
use crate::task::Task;

/// An immutable, serializable snapshot of an
/// [`Execution`](crate::Execution).
///
/// A snapshot pairs the graph with one status per node and can be thawed into
/// a fresh execution elsewhere (see [`Execution::thaw`](crate::Execution::thaw)).
/// Structure nodes are never `Scheduled` in a snapshot, and a task node
/// captured as `Scheduled` without a token is downgraded to `Ready`: the
/// driver may have been stopped between submitting the task and learning its
/// token, in which case the task will simply be dispatched again after a
/// thaw. Tasks must therefore be idempotent under re-dispatch.
pub struct FrozenExecution<T: Task> {
    graph: Arc<Graph<T>>,
    statuses: Vec<NodeStatus>,
}

impl<T: Task> FrozenExecution<T> {
    /// Builds a snapshot from a status-per-index vector, applying the
    /// `Scheduled`-without-token downgrade and checking the structure-node
    /// invariant.
    pub(crate) fn of(
        graph: Arc<Graph<T>>,
        mut statuses: Vec<NodeStatus>,
    ) -> Result<Self, FrozenError> {
        debug_assert_eq!(graph.len(), statuses.len());

        for index in graph.indices() {
            let node = graph.node(index);
            let status = &mut statuses[index.index()];
            if status.state() == NodeState::Scheduled {
                if !node.has_task() {
                    return Err(FrozenError::ScheduledStructureNode(node.key().into()));
                }
                if status.token().is_none() {
                    *status = NodeStatus::Bare(NodeState::Ready);
                }
            }
        }

        Ok(Self { graph, statuses })
    }

    /// Builds a snapshot from a status map keyed by node key.
    ///
    /// The map must cover the graph exactly: every node key once, no foreign
    /// keys.
    pub fn new(
        graph: Arc<Graph<T>>,
        statuses: BTreeMap<String, NodeStatus>,
    ) -> Result<Self, FrozenError> {
        let mut slots: Vec<Option<NodeStatus>> = vec![None; graph.len()];
        for (key, status) in statuses {
            let index = graph
                .index_of(&key)
                .ok_or_else(|| FrozenError::UnknownKey(key.clone().into_boxed_str()))?;
            slots[index.index()] = Some(status);
        }
        let statuses = graph
            .indices()
            .map(|index| {
                slots[index.index()]
                    .take()
                    .ok_or_else(|| FrozenError::MissingStatus(graph.node(index).key().into()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::of(graph, statuses)
    }

    pub fn graph(&self) -> &Arc<Graph<T>> {
        &self.graph
    }

    /// The captured statuses, keyed by node key.
    pub fn statuses(&self) -> BTreeMap<String, NodeStatus> {
        self.graph
            .indices()
            .map(|index| {
                (
                    self.graph.node(index).key().to_string(),
                    self.statuses[index.index()].clone(),
                )
            })
            .collect()
    }

    pub fn status(&self, key: &str) -> Option<&NodeStatus> {
        let index = self.graph.index_of(key)?;
        Some(&self.statuses[index.index()])
    }

    pub(crate) fn status_slice(&self) -> &[NodeStatus] {
        &self.statuses
    }
}

impl<T: Task> fmt::Debug for FrozenExecution<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrozenExecution")
            .field("nodes", &self.statuses.len())
            .finish()
    }
}

impl<T: Task + Serialize> Serialize for FrozenExecution<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("FrozenExecution", 2)?;
        state.serialize_field("graph", &*self.graph)?;
        let statuses: BTreeMap<&str, &NodeStatus> = self
            .graph
            .indices()
            .map(|index| {
                (
                    self.graph.node(index).key(),
                    &self.statuses[index.index()],
                )
            })
            .collect();
        state.serialize_field("statuses", &statuses)?;
        state.end()
    }
}

impl<'de, T: Task + Deserialize<'de>> Deserialize<'de> for FrozenExecution<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(serde::Deserialize)]
        #[serde(bound(deserialize = "T: crate::Task + serde::Deserialize<'de>"))]
        struct Repr<T: Task> {
            graph: Graph<T>,
            statuses: BTreeMap<String, NodeStatus>,
        }

        let repr = Repr::deserialize(deserializer)?;
        FrozenExecution::new(Arc::new(repr.graph), repr.statuses).map_err(de::Error::custom)
    }
}
