use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::InvalidTokenError;
use crate::execution::CompletionCallback;
use crate::scheduler::{TaskFailure, TaskScheduler, TaskToken};
use crate::task::Task;

enum Slot<T: Task> {
    /// Task still running; callbacks to invoke on completion.
    Pending(Vec<CompletionCallback<T>>),
    /// Task finished; outcome replayed to late registrations.
    Done(Option<TaskFailure>),
}

/// A [`TaskScheduler`] backed by an in-process worker pool.
///
/// Tasks are run by the closure given at construction, one call per
/// submission, on a dedicated rayon pool. Completion outcomes are retained
/// for the lifetime of the scheduler so that callbacks registered after a
/// task finished (for example from a thawed execution) still fire; tokens
/// from a different scheduler instance are rejected.
pub struct PoolScheduler<T, F>
where
    T: Task,
    F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
{
    pool: rayon::ThreadPool,
    run: Arc<F>,
    slots: Arc<Mutex<HashMap<TaskToken, Slot<T>>>>,
    counter: AtomicU64,
}

impl<T, F> PoolScheduler<T, F>
where
    T: Task,
    F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
{
    /// A scheduler running tasks through `run` on `threads` worker threads.
    pub fn new(threads: usize, run: F) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()?;
        Ok(Self {
            pool,
            run: Arc::new(run),
            slots: Arc::new(Mutex::new(HashMap::new())),
            counter: AtomicU64::new(0),
        })
    }

    fn complete(
        slots: &Mutex<HashMap<TaskToken, Slot<T>>>,
        token: &TaskToken,
        outcome: Option<TaskFailure>,
    ) {
        let waiters = {
            let mut slots = slots.lock().unwrap();
            match slots.insert(token.clone(), Slot::Done(outcome.clone())) {
                Some(Slot::Pending(waiters)) => waiters,
                _ => Vec::new(),
            }
        };
        // Callbacks take the execution lock; never invoke them while holding
        // the slot table.
        for callback in waiters {
            match &outcome {
                None => callback.report_success(),
                Some(failure) => callback.report_failure(failure.clone()),
            }
        }
    }
}

impl<T, F> TaskScheduler<T> for PoolScheduler<T, F>
where
    T: Task,
    F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn submit(&self, task: Arc<T>, callback: CompletionCallback<T>) -> Option<TaskToken> {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        let token = TaskToken::new(format!("{id:016x}"));

        self.slots
            .lock()
            .unwrap()
            .insert(token.clone(), Slot::Pending(vec![callback]));

        let run = Arc::clone(&self.run);
        let slots = Arc::clone(&self.slots);
        let worker_token = token.clone();
        self.pool.spawn(move || {
            let outcome = match run(&task) {
                Ok(()) => None,
                Err(error) => Some(TaskFailure::from(error)),
            };
            debug!(token = %worker_token, failed = outcome.is_some(), "task finished");
            Self::complete(&slots, &worker_token, outcome);
        });

        Some(token)
    }

    fn register_callback(
        &self,
        token: &TaskToken,
        callback: CompletionCallback<T>,
    ) -> Result<(), InvalidTokenError> {
        let mut slots = self.slots.lock().unwrap();
        match slots.get_mut(token) {
            None => Err(InvalidTokenError {
                token: token.clone(),
            }),
            Some(Slot::Pending(waiters)) => {
                waiters.push(callback);
                Ok(())
            }
            Some(Slot::Done(outcome)) => {
                let outcome = outcome.clone();
                drop(slots);
                match outcome {
                    None => callback.report_success(),
                    Some(failure) => callback.report_failure(failure),
                }
                Ok(())
            }
        }
    }
}
