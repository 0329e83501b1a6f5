use std::collections::{HashMap, HashSet};
use std::fmt;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, SerializeSeq, Serializer};

use crate::error::GraphError;
use crate::node::{Blueprint, Node, NodeKind, valid_key};
use crate::task::Task;

/// An immutable directed acyclic graph of [`Node`]s.
///
/// Edges run from a dependency to its dependent, so a node's dependencies are
/// its incoming neighbors and its dependents its outgoing ones. Construction
/// validates the whole structure once; afterwards the graph is freely
/// shareable (behind an [`Arc`]) across targets and executions.
pub struct Graph<T> {
    pub(crate) inner: DiGraph<Node<T>, ()>,
    by_key: HashMap<Box<str>, NodeIndex>,
    topo: Vec<NodeIndex>,
}

impl<T: Task> Graph<T> {
    /// Builds a graph from a blueprint.
    ///
    /// Nodes without a key are assigned successive fixed-width hex keys that
    /// do not collide with any caller-supplied key. Fails on an empty
    /// blueprint, a repeated or malformed key, a dependency handle that does
    /// not belong to the blueprint, or a cycle (self-dependencies included).
    pub fn create(blueprint: Blueprint<T>) -> Result<Self, GraphError> {
        let Blueprint { nodes, edges } = blueprint;

        if nodes.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut used: HashSet<Box<str>> = HashSet::with_capacity(nodes.len());
        for proto in &nodes {
            if let Some(key) = &proto.key {
                if !valid_key(key) {
                    return Err(GraphError::InvalidKey(key.clone()));
                }
                if !used.insert(key.clone()) {
                    return Err(GraphError::DuplicateKey(key.clone()));
                }
            }
        }

        // Generate keys for the remaining nodes: a fixed-width hex counter,
        // skipping values the caller happened to use.
        let mut counter = 0u64;
        let mut generate = move |used: &HashSet<Box<str>>| loop {
            let candidate = format!("{counter:08x}").into_boxed_str();
            counter += 1;
            if !used.contains(&candidate) {
                break candidate;
            }
        };

        let mut inner = DiGraph::with_capacity(nodes.len(), edges.len());
        let mut by_key = HashMap::with_capacity(nodes.len());
        for proto in nodes {
            let key = match proto.key {
                Some(key) => key,
                None => {
                    let key = generate(&used);
                    used.insert(key.clone());
                    key
                }
            };
            let kind = match proto.task {
                Some(task) => NodeKind::Task(task),
                None => NodeKind::Structure,
            };
            let index = inner.add_node(Node {
                key: key.clone(),
                kind,
            });
            by_key.insert(key, index);
        }

        let bound = inner.node_count();
        let mut seen_edges = HashSet::with_capacity(edges.len());
        for (node, dep) in edges {
            if node.0 >= bound {
                return Err(GraphError::UnknownDependency(node.0));
            }
            if dep.0 >= bound {
                return Err(GraphError::UnknownDependency(dep.0));
            }
            if seen_edges.insert((node.0, dep.0)) {
                // dependency -> dependent
                inner.add_edge(NodeIndex::new(dep.0), NodeIndex::new(node.0), ());
            }
        }

        let topo = toposort(&inner, None).map_err(|_| GraphError::Cycle)?;

        Ok(Self {
            inner,
            by_key,
            topo,
        })
    }

    pub fn len(&self) -> usize {
        self.inner.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.node_count() == 0
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }

    /// Index of the node with the given key.
    pub fn index_of(&self, key: &str) -> Option<NodeIndex> {
        self.by_key.get(key).copied()
    }

    /// The node with the given key.
    pub fn get(&self, key: &str) -> Option<&Node<T>> {
        self.index_of(key).map(|index| &self.inner[index])
    }

    /// The node at the given index.
    ///
    /// # Panics
    /// Panics if the index did not come from this graph.
    pub fn node(&self, index: NodeIndex) -> &Node<T> {
        &self.inner[index]
    }

    /// All node indices, in insertion order.
    pub fn indices(&self) -> impl Iterator<Item = NodeIndex> + use<T> {
        self.inner.node_indices()
    }

    /// All node keys.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.by_key.keys().map(AsRef::as_ref)
    }

    /// All nodes.
    pub fn nodes(&self) -> impl Iterator<Item = &Node<T>> {
        self.inner.node_weights()
    }

    /// Direct dependencies of the node at `index`.
    pub fn dependencies(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.inner.neighbors_directed(index, Direction::Incoming)
    }

    /// Direct dependents of the node at `index`.
    pub fn dependents(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.inner.neighbors_directed(index, Direction::Outgoing)
    }

    /// Node indices sorted topologically, dependency-free nodes first.
    pub(crate) fn topo(&self) -> &[NodeIndex] {
        &self.topo
    }
}

impl<T> fmt::Debug for Graph<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.inner.node_count())
            .field("edges", &self.inner.edge_count())
            .finish()
    }
}

// The serialized form is a list of nodes in topological order, each carrying
// its key, optional task, and dependency keys. Deserialization funnels back
// through `Graph::create` so every construction invariant is re-checked.

#[derive(serde::Serialize)]
struct NodeReprRef<'a, T> {
    key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    task: Option<&'a T>,
    dependencies: Vec<&'a str>,
}

#[derive(serde::Deserialize)]
#[serde(bound(deserialize = "T: serde::Deserialize<'de>"))]
struct NodeRepr<T> {
    key: Box<str>,
    #[serde(default)]
    task: Option<T>,
    #[serde(default)]
    dependencies: Vec<Box<str>>,
}

impl<T: Task + Serialize> Serialize for Graph<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.len()))?;
        for &index in self.topo() {
            let node = &self.inner[index];
            let mut dependencies: Vec<&str> = self
                .dependencies(index)
                .map(|dep| self.inner[dep].key())
                .collect();
            dependencies.sort_unstable();
            seq.serialize_element(&NodeReprRef {
                key: node.key(),
                task: node.task().map(|task| &**task),
                dependencies,
            })?;
        }
        seq.end()
    }
}

impl<'de, T: Task + Deserialize<'de>> Deserialize<'de> for Graph<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let reprs: Vec<NodeRepr<T>> = Vec::deserialize(deserializer)?;

        let mut blueprint = Blueprint::new();
        let mut handles = HashMap::with_capacity(reprs.len());
        let mut dependency_lists = Vec::with_capacity(reprs.len());
        for repr in reprs {
            let handle = match repr.task {
                Some(task) => blueprint.task_keyed(repr.key.clone(), task),
                None => blueprint.structure_keyed(repr.key.clone()),
            };
            handles.insert(repr.key, handle);
            dependency_lists.push((handle, repr.dependencies));
        }
        for (handle, dependencies) in dependency_lists {
            for dep in dependencies {
                let dep_handle = handles
                    .get(&dep)
                    .copied()
                    .ok_or_else(|| de::Error::custom(format!("unknown dependency key '{dep}'")))?;
                blueprint.depends_on(handle, [dep_handle]);
            }
        }

        Graph::create(blueprint).map_err(de::Error::custom)
    }
}
