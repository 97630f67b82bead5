//! An admission-controlled queue for asynchronous jobs.

use std::future::Future;

use futures::future::{self, BoxFuture};
use tokio::sync::{mpsc, oneshot};
use tracing::error;

pub use outcome::Outcome;

use worker::{Command, Completion, PendingJob, Worker};

mod outcome;
mod worker;

/// Admits queued jobs for execution while recent completions stay below a
/// configured ceiling.
///
/// Jobs are dispatched in FIFO order. Admission counts *completions* in the
/// trailing 60-second window: while fewer than `ceiling` jobs have completed
/// within the window, the whole backlog is eligible, so a burst of jobs
/// arriving under an unfilled window all start at once. The ceiling bounds
/// sustained throughput, not concurrency.
///
/// Cheaply cloneable. Dropping the last handle shuts the queue down: jobs
/// already dispatched run to completion and deliver their outcomes, while
/// jobs still queued resolve with [JobError::Shutdown].
#[derive(Debug, Clone)]
pub struct Queue {
    commands: mpsc::UnboundedSender<Command>,
    completions: mpsc::UnboundedSender<Completion>,
    ceiling: usize,
}

/// A snapshot of the state of the [Queue].
///
/// Consistent when the worker produced it, possibly stale by the time the
/// caller reads it.
#[derive(Debug, Clone, Copy)]
pub struct QueueState {
    pub(crate) backlog: usize,
    pub(crate) in_flight: usize,
    pub(crate) recent_completions: usize,
}

/// The queue was configured with a ceiling that can never admit a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("ceiling must admit at least one completion per window, got {0}")]
pub struct InvalidCeiling(pub usize);

/// Delivered through an [Outcome] when an enqueued job does not produce a
/// success.
#[derive(Debug, thiserror::Error)]
pub enum JobError<E> {
    /// The job ran and failed; its error is carried verbatim.
    #[error("job failed: {0}")]
    Failed(E),
    /// The job panicked while executing.
    #[error("job panicked while executing")]
    Panicked,
    /// The queue shut down before the job was dispatched.
    #[error("queue shut down before the job was dispatched")]
    Shutdown,
}

impl Queue {
    /// Create a queue admitting at most `ceiling` completions per 60-second
    /// window.
    ///
    /// Spawns the worker task, so this must be called within a tokio
    /// runtime.
    pub fn new(ceiling: usize) -> Result<Self, InvalidCeiling> {
        if ceiling == 0 {
            return Err(InvalidCeiling(ceiling));
        }
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (completions, completions_rx) = mpsc::unbounded_channel();
        Worker::spawn(ceiling, commands_rx, completions_rx);
        Ok(Self {
            commands,
            completions,
            ceiling,
        })
    }

    /// Queue a job for execution, returning immediately with its pending
    /// [Outcome].
    ///
    /// The job is dispatched once it reaches the front of the backlog and
    /// the window has admission capacity, which may be during this call's
    /// dispatch pass. Enqueueing itself never fails: every failure, the
    /// job's own included, surfaces through the returned outcome.
    pub fn enqueue<F, Fut, T, E>(&self, job: F) -> Outcome<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let (reply, receiver) = oneshot::channel();
        let completions = self.completions.clone();
        let erased: PendingJob = Box::new(move || -> BoxFuture<'static, ()> {
            Box::pin(async move {
                // The job runs on its own task so a panic is contained: the
                // outcome is still delivered and the completion still
                // recorded.
                let result = match tokio::spawn(async move { job().await }).await {
                    Ok(outcome) => outcome.map_err(JobError::Failed),
                    Err(join_error) => {
                        error!(error = %join_error, "queued job panicked");
                        Err(JobError::Panicked)
                    }
                };
                let deliver: Completion = Box::new(move || {
                    // The caller may have dropped its outcome handle.
                    let _ = reply.send(result);
                });
                if let Err(mpsc::error::SendError(deliver)) = completions.send(deliver) {
                    // The queue shut down while this job was in flight;
                    // deliver the result directly.
                    deliver();
                }
            })
        });
        // A failed send means the worker is gone; dropping the job here
        // resolves the outcome with `Shutdown`.
        let _ = self.commands.send(Command::Enqueue(erased));
        Outcome::new(receiver)
    }

    /// Queue every job in order and await all of their outcomes.
    ///
    /// Successes come back positionally, matching the input order regardless
    /// of completion order. The first failure rejects the aggregate with
    /// that failure; sibling jobs are unaffected and still run to
    /// completion, counting against the window as usual.
    pub async fn process_all<I, F, Fut, T, E>(&self, jobs: I) -> Result<Vec<T>, JobError<E>>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let outcomes: Vec<_> = jobs.into_iter().map(|job| self.enqueue(job)).collect();
        future::try_join_all(outcomes).await
    }

    /// The current state of the queue.
    pub async fn state(&self) -> QueueState {
        let (reply, receiver) = oneshot::channel();
        let _ = self.commands.send(Command::State(reply));
        receiver
            .await
            .expect("worker should be alive while a queue handle exists")
    }

    /// The configured ceiling: maximum completions counted per window before
    /// admission is withheld.
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }
}

impl QueueState {
    /// Jobs waiting to be dispatched.
    pub fn backlog(&self) -> usize {
        self.backlog
    }
    /// Jobs dispatched but not yet complete.
    ///
    /// Observability only; admission decisions never consult it.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }
    /// Completions counted in the trailing window, after pruning.
    pub fn recent_completions(&self) -> usize {
        self.recent_completions
    }
}
