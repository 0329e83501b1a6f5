use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::InvalidTokenError;
use crate::execution::CompletionCallback;
use crate::task::Task;

/// An opaque handle to a scheduled task instance.
///
/// Tokens are minted by a [`TaskScheduler`] on submission and can later be
/// used to attach additional completion callbacks, including from a thawed
/// execution. The engine never looks inside the payload; schedulers encode
/// whatever they need to recognize their own work. Tokens are scoped to the
/// scheduler that issued them unless that scheduler explicitly documents
/// otherwise.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskToken(Box<str>);

impl TaskToken {
    pub fn new(value: impl Into<Box<str>>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Details reported when a scheduled task fails.
///
/// Both the message and the cause are optional; a bare failure report is
/// valid. The cause is shared so that a scheduler can replay the same outcome
/// to callbacks registered after completion.
#[derive(Clone, Debug, Default)]
pub struct TaskFailure {
    message: Option<String>,
    cause: Option<Arc<anyhow::Error>>,
}

impl TaskFailure {
    /// A failure report with no further details.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            cause: None,
        }
    }

    pub fn with_cause(cause: anyhow::Error) -> Self {
        Self {
            message: None,
            cause: Some(Arc::new(cause)),
        }
    }

    pub fn with_message_and_cause(message: impl Into<String>, cause: anyhow::Error) -> Self {
        Self {
            message: Some(message.into()),
            cause: Some(Arc::new(cause)),
        }
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn cause(&self) -> Option<&anyhow::Error> {
        self.cause.as_deref()
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.message, &self.cause) {
            (Some(message), Some(cause)) => write!(f, "{message}: {cause:#}"),
            (Some(message), None) => f.write_str(message),
            (None, Some(cause)) => write!(f, "{cause:#}"),
            (None, None) => f.write_str("no details provided"),
        }
    }
}

impl From<anyhow::Error> for TaskFailure {
    fn from(cause: anyhow::Error) -> Self {
        Self::with_cause(cause)
    }
}

impl From<String> for TaskFailure {
    fn from(message: String) -> Self {
        Self::with_message(message)
    }
}

impl From<&str> for TaskFailure {
    fn from(message: &str) -> Self {
        Self::with_message(message)
    }
}

/// The collaborator that actually runs tasks.
///
/// The execution driver decides *when* a task may run; a scheduler decides
/// *where and how*. Implementations range from an in-process thread pool
/// ([`PoolScheduler`](crate::PoolScheduler)) to remote job systems.
///
/// Contract:
///
/// * The callback passed to [`submit`](TaskScheduler::submit) must be invoked
///   exactly once, with either success or failure. It may be invoked on any
///   thread, including synchronously inside `submit` itself.
/// * `submit` returns a [`TaskToken`] for the scheduled instance. The token
///   may only be `None` when the callback has already been invoked before
///   `submit` returned.
/// * [`register_callback`](TaskScheduler::register_callback) attaches another
///   callback to a previously issued token. If the task has already finished,
///   the callback must be invoked before the method returns.
pub trait TaskScheduler<T: Task>: Send + Sync {
    /// Schedules a task, registering a callback that signals its completion.
    fn submit(&self, task: Arc<T>, callback: CompletionCallback<T>) -> Option<TaskToken>;

    /// Attaches a callback to an already scheduled task instance.
    fn register_callback(
        &self,
        token: &TaskToken,
        callback: CompletionCallback<T>,
    ) -> Result<(), InvalidTokenError>;
}
