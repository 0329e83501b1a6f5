use std::fmt;
use std::sync::Arc;

use crate::task::Task;

/// A node in a workflow graph, possibly carrying a task.
pub struct Node<T> {
    pub(crate) key: Box<str>,
    pub(crate) kind: NodeKind<T>,
}

/// The two node flavors.
///
/// Structure nodes carry no task; they exist purely to link other nodes and
/// keep the edge count of fan-in/fan-out patterns linear. They are never
/// handed to a scheduler.
pub enum NodeKind<T> {
    Task(Arc<T>),
    Structure,
}

impl<T> Node<T> {
    /// The key with which this node is associated.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn kind(&self) -> &NodeKind<T> {
        &self.kind
    }

    pub fn has_task(&self) -> bool {
        matches!(self.kind, NodeKind::Task(_))
    }

    /// The task associated with this node, if any.
    pub fn task(&self) -> Option<&Arc<T>> {
        match &self.kind {
            NodeKind::Task(task) => Some(task),
            NodeKind::Structure => None,
        }
    }
}

impl<T> fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            NodeKind::Task(_) => write!(f, "TaskNode({})", self.key),
            NodeKind::Structure => write!(f, "StructureNode({})", self.key),
        }
    }
}

/// Checks a node key against the allowed shape: 1-256 characters, ASCII
/// alphanumeric plus `-` and `_`, where the first and last character must be
/// alphanumeric.
pub(crate) fn valid_key(key: &str) -> bool {
    let bytes = key.as_bytes();
    if bytes.is_empty() || bytes.len() > 256 {
        return false;
    }
    let alnum = |b: u8| b.is_ascii_alphanumeric();
    let inner = |b: u8| b.is_ascii_alphanumeric() || b == b'-' || b == b'_';

    alnum(bytes[0])
        && alnum(bytes[bytes.len() - 1])
        && bytes.iter().all(|&b| inner(b))
}

/// A lightweight reference to a node added to a [`Blueprint`].
///
/// Handles are only meaningful for the blueprint that minted them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeHandle(pub(crate) usize);

pub(crate) struct ProtoNode<T> {
    pub key: Option<Box<str>>,
    pub task: Option<Arc<T>>,
}

/// A mutable collection of nodes, wired together through [`NodeHandle`]s and
/// finalized into an immutable [`Graph`](crate::Graph).
///
/// ```
/// use karakuri::{Blueprint, Graph, Output, Task};
/// use std::sync::Arc;
///
/// struct Noop;
/// impl Task for Noop {
///     fn outputs(&self) -> Vec<Arc<dyn Output>> {
///         Vec::new()
///     }
/// }
///
/// let mut blueprint = Blueprint::new();
/// let fetch = blueprint.task_keyed("fetch", Noop);
/// let render = blueprint.task_keyed("render", Noop);
/// blueprint.depends_on(render, [fetch]);
/// let graph = Graph::create(blueprint).unwrap();
/// assert_eq!(graph.len(), 2);
/// ```
pub struct Blueprint<T> {
    pub(crate) nodes: Vec<ProtoNode<T>>,
    pub(crate) edges: Vec<(NodeHandle, NodeHandle)>,
}

impl<T: Task> Blueprint<T> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Adds a task node without a key; a unique hex key is generated during
    /// graph construction.
    pub fn task(&mut self, task: T) -> NodeHandle {
        self.push(None, Some(Arc::new(task)))
    }

    /// Adds a task node under the given key.
    pub fn task_keyed(&mut self, key: impl Into<String>, task: T) -> NodeHandle {
        self.push(Some(key.into().into_boxed_str()), Some(Arc::new(task)))
    }

    /// Adds a task-less structure node without a key.
    pub fn structure(&mut self) -> NodeHandle {
        self.push(None, None)
    }

    /// Adds a task-less structure node under the given key.
    pub fn structure_keyed(&mut self, key: impl Into<String>) -> NodeHandle {
        self.push(Some(key.into().into_boxed_str()), None)
    }

    /// Declares that `node` depends on each of `dependencies`.
    ///
    /// Handle validity is checked when the graph is built.
    pub fn depends_on(
        &mut self,
        node: NodeHandle,
        dependencies: impl IntoIterator<Item = NodeHandle>,
    ) {
        self.edges
            .extend(dependencies.into_iter().map(|dep| (node, dep)));
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn push(&mut self, key: Option<Box<str>>, task: Option<Arc<T>>) -> NodeHandle {
        self.nodes.push(ProtoNode { key, task });
        NodeHandle(self.nodes.len() - 1)
    }
}

impl<T: Task> Default for Blueprint<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_shape() {
        assert!(valid_key("a"));
        assert!(valid_key("0"));
        assert!(valid_key("node-1"));
        assert!(valid_key("a_b-c"));
        assert!(valid_key(&"x".repeat(256)));

        assert!(!valid_key(""));
        assert!(!valid_key("-a"));
        assert!(!valid_key("a-"));
        assert!(!valid_key("_a"));
        assert!(!valid_key("a_"));
        assert!(!valid_key("a b"));
        assert!(!valid_key("naïve"));
        assert!(!valid_key(&"x".repeat(257)));
    }
}
