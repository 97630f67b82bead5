use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::sync::oneshot;

use super::JobError;

/// The pending outcome of an enqueued job.
///
/// Resolves exactly once: with the job's own result or failure once it has
/// run, or with [JobError::Shutdown] if the queue was torn down before the
/// job was dispatched.
///
/// Dropping the handle does not cancel the job.
#[derive(Debug)]
pub struct Outcome<T, E> {
    receiver: oneshot::Receiver<Result<T, JobError<E>>>,
}

impl<T, E> Outcome<T, E> {
    pub(crate) fn new(receiver: oneshot::Receiver<Result<T, JobError<E>>>) -> Self {
        Self { receiver }
    }
}

impl<T, E> Future for Outcome<T, E> {
    type Output = Result<T, JobError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.as_mut().receiver).poll(cx).map(|result| {
            match result {
                Ok(outcome) => outcome,
                // The worker dropped the job without dispatching it.
                Err(_closed) => Err(JobError::Shutdown),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tokio::sync::oneshot;
    use tokio_test::{assert_pending, assert_ready, task};

    use crate::queue::JobError;

    use super::Outcome;

    #[test]
    fn resolves_with_the_delivered_result() {
        let (sender, receiver) = oneshot::channel::<Result<u32, JobError<&str>>>();
        let mut outcome = task::spawn(Outcome::new(receiver));

        assert_pending!(outcome.poll());

        sender.send(Ok(7)).expect("receiver is alive");
        assert_matches!(assert_ready!(outcome.poll()), Ok(7));
    }

    #[test]
    fn dropped_sender_means_shutdown() {
        let (sender, receiver) = oneshot::channel::<Result<u32, JobError<&str>>>();
        let mut outcome = task::spawn(Outcome::new(receiver));

        drop(sender);
        assert_matches!(assert_ready!(outcome.poll()), Err(JobError::Shutdown));
    }
}
