use std::fmt;
use std::io;

use thiserror::Error;

use crate::scheduler::{TaskFailure, TaskToken};

/// Errors raised while assembling a [`Graph`](crate::Graph) from a
/// [`Blueprint`](crate::Blueprint).
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("blueprint contains no nodes")]
    Empty,

    #[error("key '{0}' is assigned to more than one node")]
    DuplicateKey(Box<str>),

    #[error(
        "key '{0}' is invalid; keys are 1-256 alphanumeric, '-' or '_' characters \
         and may not start or end with '-' or '_'"
    )]
    InvalidKey(Box<str>),

    #[error("dependency handle #{0} does not belong to this blueprint")]
    UnknownDependency(usize),

    #[error("graph contains a cycle")]
    Cycle,
}

/// Errors raised while deriving a [`Target`](crate::Target).
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("selection contains no nodes")]
    Empty,

    #[error("node '{0}' is not part of the parent target")]
    NotInTarget(Box<str>),

    #[error("node index #{0} is not part of the parent graph")]
    UnknownIndex(usize),
}

/// An I/O failure while reading or deleting the output of a node.
#[derive(Debug, Error)]
#[error("output of node '{key}': {source}")]
pub struct OutputError {
    pub(crate) key: Box<str>,
    #[source]
    pub(crate) source: io::Error,
}

impl OutputError {
    /// Key of the node whose output failed.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Errors raised while snapshotting an execution or rebuilding a snapshot.
#[derive(Debug, Error)]
pub enum FrozenError {
    #[error("status map does not cover the graph: missing node '{0}'")]
    MissingStatus(Box<str>),

    #[error("status map contains a key '{0}' that is not in the graph")]
    UnknownKey(Box<str>),

    #[error("structure node '{0}' cannot be scheduled")]
    ScheduledStructureNode(Box<str>),

    #[error("cannot freeze an execution while its driver is running")]
    Running,
}

/// A token was not recognized by the scheduler it was presented to.
#[derive(Debug, Error)]
#[error("unrecognized task token '{token}'")]
pub struct InvalidTokenError {
    pub token: TaskToken,
}

/// Errors raised while thawing a [`FrozenExecution`](crate::FrozenExecution).
#[derive(Debug, Error)]
pub enum ThawError {
    #[error("scheduler rejected the token of node '{key}'")]
    TokenRejected {
        key: Box<str>,
        #[source]
        source: InvalidTokenError,
    },
}

/// A single fault recorded by the execution driver.
///
/// When several faults accumulate during one run, the most severe one becomes
/// the primary error of the [`RunError`] and the rest are kept as suppressed
/// faults.
#[derive(Debug, Error)]
pub enum RunFault {
    /// A broken invariant or misuse of the driver itself.
    #[error("unexpected driver fault: {0}")]
    Unexpected(String),

    /// A scheduled task reported failure.
    #[error("task '{key}' failed: {failure}")]
    Task { key: Box<str>, failure: TaskFailure },

    /// Output of a failed task could not be deleted.
    #[error("failed to delete output of task '{key}': {source}")]
    OutputIo {
        key: Box<str>,
        #[source]
        source: io::Error,
    },

    /// The driver was interrupted while waiting for completions.
    #[error("interrupted while waiting for task completions")]
    Interrupted,
}

impl RunFault {
    fn rank(&self) -> u8 {
        match self {
            RunFault::Unexpected(_) => 0,
            RunFault::Task { .. } => 1,
            RunFault::OutputIo { .. } => 2,
            RunFault::Interrupted => 3,
        }
    }
}

/// Everything that went wrong during a single [`Execution::run`] call.
///
/// The primary fault is the most severe one observed; any other faults from
/// the same run are retained in [`suppressed`](RunError::suppressed) in the
/// order they occurred.
///
/// [`Execution::run`]: crate::Execution::run
#[derive(Debug)]
pub struct RunError {
    primary: RunFault,
    suppressed: Vec<RunFault>,
}

impl RunError {
    /// Folds recorded faults into an error, or `None` if there were none.
    pub(crate) fn from_faults(mut faults: Vec<RunFault>) -> Option<Self> {
        if faults.is_empty() {
            return None;
        }
        // Stable sort: ties keep their order of occurrence.
        faults.sort_by_key(RunFault::rank);
        let primary = faults.remove(0);
        Some(RunError {
            primary,
            suppressed: faults,
        })
    }

    pub(crate) fn single(fault: RunFault) -> Self {
        RunError {
            primary: fault,
            suppressed: Vec::new(),
        }
    }

    /// The most severe fault of the run.
    pub fn primary(&self) -> &RunFault {
        &self.primary
    }

    /// Remaining faults of the run, in order of occurrence.
    pub fn suppressed(&self) -> &[RunFault] {
        &self.suppressed
    }

    /// Whether the run ended because the driver was interrupted.
    pub fn is_interrupted(&self) -> bool {
        matches!(self.primary, RunFault::Interrupted)
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.primary)?;
        if !self.suppressed.is_empty() {
            write!(f, " ({} suppressed)", self.suppressed.len())?;
        }
        Ok(())
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.primary)
    }
}
