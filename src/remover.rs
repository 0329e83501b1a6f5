use std::collections::HashMap;
use std::sync::Arc;

use petgraph::graph::NodeIndex;
use tracing::{debug, warn};

use crate::error::OutputError;
use crate::freshness::{self, Analysis};
use crate::graph::Graph;
use crate::target::Target;
use crate::task::{Output, Task};

/// Why a batch of outputs is being removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemovalReason {
    /// The task that created the outputs failed to execute.
    ExecutionFailed,
    /// Removal was explicitly requested.
    RemovalRequested,
    /// The output of a direct or indirect dependency is more recent.
    PredatesDependency,
}

/// Logic for preserving outputs that would otherwise be removed.
///
/// The filter receives the whole batch, keyed by node, and drops entries for
/// outputs it wants to keep. It is called at most once per removal batch.
pub trait RemovalFilter: Send + Sync {
    fn filter(
        &self,
        outputs: &mut HashMap<Box<str>, Vec<Arc<dyn Output>>>,
        reason: RemovalReason,
    );
}

impl<F> RemovalFilter for F
where
    F: Fn(&mut HashMap<Box<str>, Vec<Arc<dyn Output>>>, RemovalReason) + Send + Sync,
{
    fn filter(
        &self,
        outputs: &mut HashMap<Box<str>, Vec<Arc<dyn Output>>>,
        reason: RemovalReason,
    ) {
        self(outputs, reason)
    }
}

/// Deletes task outputs, optionally consulting a [`RemovalFilter`].
///
/// A failed deletion never stops the rest of the batch: every remaining
/// output is still attempted, and the public entry points report the first
/// error after the whole batch has been walked.
#[derive(Clone, Default)]
pub struct OutputRemover {
    filter: Option<Arc<dyn RemovalFilter>>,
}

impl OutputRemover {
    /// A remover that deletes unconditionally.
    pub fn new() -> Self {
        Self::default()
    }

    /// A remover that runs every batch through the given filter first.
    pub fn with_filter(filter: impl RemovalFilter + 'static) -> Self {
        Self {
            filter: Some(Arc::new(filter)),
        }
    }

    /// Removes the outputs of every task in `target`.
    pub fn remove_output<T: Task>(&self, target: &Target<T>) -> Result<(), OutputError> {
        let nodes: Vec<NodeIndex> = target.indices().collect();
        let errors = self.remove_nodes(target.graph(), &nodes, RemovalReason::RemovalRequested);
        match errors.into_iter().next() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Analyzes `target` and removes the outputs of every node whose output
    /// predates that of a dependency. Returns the analysis.
    pub fn remove_invalid_output<T: Task>(
        &self,
        target: &Target<T>,
    ) -> Result<Analysis<T>, OutputError> {
        let analysis = freshness::analyze(target)?;
        let invalid: Vec<NodeIndex> = analysis.invalid_indices().collect();
        let errors = self.remove_nodes(target.graph(), &invalid, RemovalReason::PredatesDependency);
        match errors.into_iter().next() {
            Some(error) => Err(error),
            None => Ok(analysis),
        }
    }

    /// Removes the outputs of the given nodes, returning every deletion error
    /// encountered along the way.
    pub(crate) fn remove_nodes<T: Task>(
        &self,
        graph: &Graph<T>,
        nodes: &[NodeIndex],
        reason: RemovalReason,
    ) -> Vec<OutputError> {
        if nodes.is_empty() {
            return Vec::new();
        }

        let mut batch: HashMap<Box<str>, Vec<Arc<dyn Output>>> = HashMap::new();
        for &index in nodes {
            let node = graph.node(index);
            if let Some(task) = node.task() {
                batch.insert(node.key().into(), task.outputs());
            }
        }
        if batch.is_empty() {
            return Vec::new();
        }

        if let Some(filter) = &self.filter {
            filter.filter(&mut batch, reason);
        }

        let mut errors = Vec::new();
        for (key, outputs) in &batch {
            for output in outputs {
                if let Err(source) = output.delete() {
                    warn!(node = %key, error = %source, "failed to delete output");
                    errors.push(OutputError {
                        key: key.clone(),
                        source,
                    });
                }
            }
        }

        debug!(?reason, nodes = batch.len(), "removed outputs");
        errors
    }
}
