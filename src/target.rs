use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use petgraph::Direction;
use petgraph::graph::NodeIndex;

use crate::error::TargetError;
use crate::graph::Graph;
use crate::node::Node;
use crate::task::Task;

/// A non-empty subset of the nodes in a [`Graph`], used as the scope for
/// execution and output operations.
///
/// The whole graph is itself a target; smaller targets are derived with
/// [`subset`](Target::subset), [`starting_from`](Target::starting_from) and
/// [`stopping_after`](Target::stopping_after). Derivations are defined over
/// the subgraph induced by the parent target: a neighbor outside the parent
/// is not crossed, even if the underlying graph connects through it.
///
/// Targets are cheap to clone; the graph is shared.
pub struct Target<T> {
    graph: Arc<Graph<T>>,
    subset: Option<Arc<Subset>>,
}

struct Subset {
    members: HashSet<NodeIndex>,
    by_key: BTreeMap<Box<str>, NodeIndex>,
}

impl<T> Clone for Target<T> {
    fn clone(&self) -> Self {
        Self {
            graph: Arc::clone(&self.graph),
            subset: self.subset.clone(),
        }
    }
}

impl<T: Task> Target<T> {
    /// The target covering every node of `graph`.
    pub fn whole(graph: &Arc<Graph<T>>) -> Self {
        Self {
            graph: Arc::clone(graph),
            subset: None,
        }
    }

    /// A target consisting of exactly the given keys.
    pub fn subset<I, S>(graph: &Arc<Graph<T>>, keys: I) -> Result<Self, TargetError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let whole = Self::whole(graph);
        let indices = whole.resolve_keys(keys)?;
        Ok(whole.from_members(indices.into_iter().collect()))
    }

    pub fn graph(&self) -> &Arc<Graph<T>> {
        &self.graph
    }

    /// Number of nodes in this target. Never zero.
    pub fn len(&self) -> usize {
        match &self.subset {
            None => self.graph.len(),
            Some(subset) => subset.members.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this target covers its entire graph.
    pub fn is_whole(&self) -> bool {
        self.subset.is_none()
    }

    /// Constant-time membership test.
    pub fn contains(&self, index: NodeIndex) -> bool {
        match &self.subset {
            None => self.graph.inner.node_weight(index).is_some(),
            Some(subset) => subset.members.contains(&index),
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index_of(key).is_some()
    }

    /// Index of the node with the given key, if it is in this target.
    pub fn index_of(&self, key: &str) -> Option<NodeIndex> {
        match &self.subset {
            None => self.graph.index_of(key),
            Some(subset) => subset.by_key.get(key).copied(),
        }
    }

    /// Member indices in topological order.
    pub fn indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph
            .topo()
            .iter()
            .copied()
            .filter(move |&index| self.contains(index))
    }

    /// Member keys in topological order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.indices().map(|index| self.graph.node(index).key())
    }

    /// Member nodes in topological order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node<T>> {
        self.indices().map(|index| self.graph.node(index))
    }

    /// A target of the given member nodes plus all their transitive
    /// dependents within this target.
    pub fn starting_from(
        &self,
        nodes: impl IntoIterator<Item = NodeIndex>,
    ) -> Result<Self, TargetError> {
        let starts = self.resolve_indices(nodes)?;
        Ok(self.closure(starts, Direction::Outgoing))
    }

    /// Key-based form of [`starting_from`](Target::starting_from).
    pub fn starting_from_keys<I, S>(&self, keys: I) -> Result<Self, TargetError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let starts = self.resolve_keys(keys)?;
        Ok(self.closure(starts, Direction::Outgoing))
    }

    /// A target of the given member nodes plus all their transitive
    /// dependencies within this target.
    pub fn stopping_after(
        &self,
        nodes: impl IntoIterator<Item = NodeIndex>,
    ) -> Result<Self, TargetError> {
        let starts = self.resolve_indices(nodes)?;
        Ok(self.closure(starts, Direction::Incoming))
    }

    /// Key-based form of [`stopping_after`](Target::stopping_after).
    pub fn stopping_after_keys<I, S>(&self, keys: I) -> Result<Self, TargetError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let starts = self.resolve_keys(keys)?;
        Ok(self.closure(starts, Direction::Incoming))
    }

    fn resolve_keys<I, S>(&self, keys: I) -> Result<Vec<NodeIndex>, TargetError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut indices = Vec::new();
        for key in keys {
            let key = key.as_ref();
            let index = self
                .index_of(key)
                .ok_or_else(|| TargetError::NotInTarget(key.into()))?;
            indices.push(index);
        }
        if indices.is_empty() {
            return Err(TargetError::Empty);
        }
        Ok(indices)
    }

    fn resolve_indices(
        &self,
        nodes: impl IntoIterator<Item = NodeIndex>,
    ) -> Result<Vec<NodeIndex>, TargetError> {
        let mut indices = Vec::new();
        for index in nodes {
            if self.graph.inner.node_weight(index).is_none() {
                return Err(TargetError::UnknownIndex(index.index()));
            }
            if !self.contains(index) {
                return Err(TargetError::NotInTarget(
                    self.graph.node(index).key().into(),
                ));
            }
            indices.push(index);
        }
        if indices.is_empty() {
            return Err(TargetError::Empty);
        }
        Ok(indices)
    }

    /// Iterative depth-first closure over neighbors in `direction`.
    ///
    /// Neighbors are restricted to this target *before* they are expanded;
    /// traversing first and filtering afterwards would leak nodes reachable
    /// only through non-members.
    fn closure(&self, starts: Vec<NodeIndex>, direction: Direction) -> Self {
        let mut seen: HashSet<NodeIndex> = HashSet::new();
        let mut stack = starts;

        while let Some(index) = stack.pop() {
            if seen.insert(index) {
                for neighbor in self.graph.inner.neighbors_directed(index, direction) {
                    if self.contains(neighbor) && !seen.contains(&neighbor) {
                        stack.push(neighbor);
                    }
                }
            }
        }

        if seen.len() == self.len() {
            // The closure covers the parent; reuse it.
            return self.clone();
        }
        self.from_members(seen)
    }

    fn from_members(&self, members: HashSet<NodeIndex>) -> Self {
        let by_key = members
            .iter()
            .map(|&index| (self.graph.node(index).key().into(), index))
            .collect();
        Self {
            graph: Arc::clone(&self.graph),
            subset: Some(Arc::new(Subset { members, by_key })),
        }
    }
}

impl<T: Task> fmt::Debug for Target<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subset {
            None => write!(f, "Target(whole, {} nodes)", self.graph.len()),
            Some(subset) => write!(f, "Target({} of {} nodes)", subset.members.len(), self.graph.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestTask, canonical_graph};

    fn keys_of(target: &Target<TestTask>) -> Vec<&str> {
        let mut keys: Vec<_> = target.keys().collect();
        keys.sort_unstable();
        keys
    }

    #[test]
    fn whole_graph_is_a_target() {
        let graph = canonical_graph(|_| TestTask::succeeding());
        let target = Target::whole(&graph);
        assert!(target.is_whole());
        assert_eq!(target.len(), 8);
        assert_eq!(keys_of(&target), ["0", "1", "2", "3", "4", "5", "6", "7"]);
    }

    #[test]
    fn stopping_after_collects_dependencies() {
        let graph = canonical_graph(|_| TestTask::succeeding());
        let target = Target::whole(&graph).stopping_after_keys(["2"]).unwrap();
        assert_eq!(keys_of(&target), ["0", "1", "2"]);

        // 3 depends on both chains through 2 and 6.
        let target = Target::whole(&graph).stopping_after_keys(["3"]).unwrap();
        assert_eq!(keys_of(&target), ["0", "1", "2", "3", "5", "6"]);
    }

    #[test]
    fn starting_from_collects_dependents() {
        let graph = canonical_graph(|_| TestTask::succeeding());
        let target = Target::whole(&graph).starting_from_keys(["6"]).unwrap();
        assert_eq!(keys_of(&target), ["3", "4", "6", "7"]);
    }

    #[test]
    fn closures_are_closed() {
        let graph = canonical_graph(|_| TestTask::succeeding());
        let forward = Target::whole(&graph).starting_from_keys(["1"]).unwrap();

        for index in forward.indices() {
            for dependent in graph.dependents(index) {
                assert!(
                    forward.contains(dependent),
                    "dependent of a member escaped the forward closure"
                );
            }
        }

        let backward = Target::whole(&graph).stopping_after_keys(["3"]).unwrap();
        for index in backward.indices() {
            for dep in graph.dependencies(index) {
                assert!(backward.contains(dep));
            }
        }
    }

    #[test]
    fn whole_closure_returns_parent() {
        let graph = canonical_graph(|_| TestTask::succeeding());
        let whole = Target::whole(&graph);
        let all = whole.stopping_after_keys(["4", "7"]).unwrap();
        assert!(all.is_whole());
    }

    #[test]
    fn rejects_keys_outside_the_parent() {
        let graph = canonical_graph(|_| TestTask::succeeding());
        let narrow = Target::whole(&graph).stopping_after_keys(["2"]).unwrap();

        assert!(matches!(
            narrow.starting_from_keys(["7"]),
            Err(TargetError::NotInTarget(key)) if &*key == "7"
        ));
        assert!(matches!(
            Target::whole(&graph).starting_from_keys(["missing"]),
            Err(TargetError::NotInTarget(_))
        ));
    }

    #[test]
    fn rejects_empty_selections() {
        let graph = canonical_graph(|_| TestTask::succeeding());
        let keys: [&str; 0] = [];
        assert!(matches!(
            Target::whole(&graph).starting_from_keys(keys),
            Err(TargetError::Empty)
        ));
    }

    #[test]
    fn discontinuous_target_does_not_cross_missing_nodes() {
        let graph = canonical_graph(|_| TestTask::succeeding());
        // 5 and 7 without the 6 that connects them.
        let sparse = Target::subset(&graph, ["5", "7"]).unwrap();
        let forward = sparse.starting_from_keys(["5"]).unwrap();

        // A traverse-then-filter closure would reach 7 through the absent 6.
        assert_eq!(keys_of(&forward), ["5"]);
    }

    #[test]
    fn target_iteration_is_topological() {
        let graph = canonical_graph(|_| TestTask::succeeding());
        let target = Target::whole(&graph).stopping_after_keys(["3"]).unwrap();
        let order: Vec<_> = target.indices().collect();

        for (at, &index) in order.iter().enumerate() {
            for dep in graph.dependencies(index) {
                if target.contains(dep) {
                    let dep_at = order.iter().position(|&other| other == dep).unwrap();
                    assert!(dep_at < at);
                }
            }
        }
    }
}
