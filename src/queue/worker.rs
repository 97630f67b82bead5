use std::{collections::VecDeque, future, time::Duration};

use conv::ConvUtil;
use futures::future::BoxFuture;
use tokio::{
    sync::{mpsc, oneshot},
    time::{self, Instant},
};
use tracing::debug;

use super::QueueState;

/// How far back completions are counted for admission decisions.
pub(crate) const WINDOW: Duration = Duration::from_secs(60);

/// A queued job with its result type erased.
///
/// The typed result channel is captured inside the closure at enqueue time,
/// so the backlog stays homogeneous.
pub(crate) type PendingJob = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Resolves a finished job's outcome handle.
///
/// Run by the worker after the completion has been recorded, so a caller
/// observing its outcome knows the completion is already counted against the
/// window.
pub(crate) type Completion = Box<dyn FnOnce() + Send>;

/// Messages from [Queue](super::Queue) handles to the worker.
pub(crate) enum Command {
    Enqueue(PendingJob),
    State(oneshot::Sender<QueueState>),
}

/// Owns all mutable queue state.
///
/// Commands and completion notices are processed one at a time on a single
/// task, so no lock guards the backlog or the completion log.
pub(crate) struct Worker {
    ceiling: usize,
    commands: mpsc::UnboundedReceiver<Command>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    backlog: VecDeque<PendingJob>,
    /// Timestamps of completions within the trailing window, oldest first.
    ///
    /// Entries may be momentarily stale between prunes; always pruned before
    /// an admission decision or a state report.
    log: VecDeque<Instant>,
    in_flight: usize,
}

impl Worker {
    pub(crate) fn spawn(
        ceiling: usize,
        commands: mpsc::UnboundedReceiver<Command>,
        completions_rx: mpsc::UnboundedReceiver<Completion>,
    ) {
        let worker = Self {
            ceiling,
            commands,
            completions_rx,
            backlog: VecDeque::new(),
            log: VecDeque::new(),
            in_flight: 0,
        };
        tokio::spawn(worker.run());
    }

    async fn run(mut self) {
        let mut tick = time::interval_at(Instant::now() + WINDOW, WINDOW);
        loop {
            let wake = self.next_admission();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Enqueue(job)) => {
                        self.backlog.push_back(job);
                        self.dispatch_ready();
                    }
                    Some(Command::State(reply)) => {
                        self.dispatch_ready();
                        let _ = reply.send(self.snapshot());
                    }
                    // Every queue handle is gone.
                    None => break,
                },
                Some(deliver) = self.completions_rx.recv() => {
                    self.in_flight -= 1;
                    self.log.push_back(Instant::now());
                    deliver();
                    self.dispatch_ready();
                }
                _ = sleep_until_admission(wake) => self.dispatch_ready(),
                _ = tick.tick() => self.housekeeping(),
            }
        }
        self.shut_down();
    }

    /// Prune, then admit from the front of the backlog while the window has
    /// room.
    ///
    /// The completion log only changes when a completion notice is processed,
    /// so a single pass admits against one pre-pass count: a backlog arriving
    /// under an unfilled window is dispatched in its entirety. The ceiling
    /// bounds completions per window, not jobs in flight.
    ///
    /// Every select arm that prunes must do so through this pass: afterwards
    /// either the backlog is empty or the window is full, which is what keeps
    /// [next_admission](Self::next_admission) armed whenever work is waiting.
    fn dispatch_ready(&mut self) {
        self.prune(Instant::now());
        while self.log.len() < self.ceiling {
            let Some(job) = self.backlog.pop_front() else {
                break;
            };
            self.in_flight += 1;
            tokio::spawn(job());
        }
    }

    /// Drop log entries older than the window.
    fn prune(&mut self, now: Instant) {
        // `None` means the process is younger than the window: nothing can
        // have aged out yet.
        let Some(horizon) = now.checked_sub(WINDOW) else {
            return;
        };
        while self.log.front().is_some_and(|&completed| completed <= horizon) {
            self.log.pop_front();
        }
    }

    /// When the window next frees admission capacity, if currently throttled.
    ///
    /// With the window full, admission reopens once enough completions age
    /// out that fewer than `ceiling` remain: the entry at `len - ceiling` is
    /// the last one that must expire.
    fn next_admission(&self) -> Option<Instant> {
        if self.backlog.is_empty() || self.log.len() < self.ceiling {
            return None;
        }
        self.log
            .get(self.log.len() - self.ceiling)
            .map(|&completed| completed + WINDOW)
    }

    fn housekeeping(&mut self) {
        self.dispatch_ready();
        let backlog = self.backlog.len();
        let estimated_drain_secs = (backlog as f64 / self.ceiling as f64 * 60.0)
            .ceil()
            .approx_as::<u64>()
            .expect("drain estimate should be within u64 bounds");
        debug!(
            backlog,
            in_flight = self.in_flight,
            ceiling = self.ceiling,
            estimated_drain_secs,
            "queue depth"
        );
    }

    /// Resolve completions that raced shutdown, then discard the backlog.
    ///
    /// Once the channel is closed, a job finishing in flight delivers its
    /// outcome directly from its own task instead.
    fn shut_down(&mut self) {
        self.completions_rx.close();
        while let Ok(deliver) = self.completions_rx.try_recv() {
            deliver();
        }
        if !self.backlog.is_empty() {
            debug!(
                discarded = self.backlog.len(),
                "queue shut down with jobs still pending"
            );
        }
    }

    fn snapshot(&self) -> QueueState {
        QueueState {
            backlog: self.backlog.len(),
            in_flight: self.in_flight,
            recent_completions: self.log.len(),
        }
    }
}

async fn sleep_until_admission(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;

    fn worker(ceiling: usize) -> Worker {
        let (_commands_tx, commands) = mpsc::unbounded_channel();
        let (_completions_tx, completions_rx) = mpsc::unbounded_channel();
        Worker {
            ceiling,
            commands,
            completions_rx,
            backlog: VecDeque::new(),
            log: VecDeque::new(),
            in_flight: 0,
        }
    }

    fn noop_job() -> PendingJob {
        Box::new(|| async {}.boxed())
    }

    #[tokio::test(start_paused = true)]
    async fn prune_drops_entries_at_and_beyond_the_window() {
        let mut worker = worker(2);

        worker.log.push_back(Instant::now());
        time::sleep(Duration::from_secs(30)).await;
        worker.log.push_back(Instant::now());
        time::sleep(Duration::from_secs(30)).await;

        // The first entry is now exactly one window old.
        worker.prune(Instant::now());
        assert_eq!(worker.log.len(), 1);

        time::sleep(WINDOW).await;
        worker.prune(Instant::now());
        assert!(worker.log.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn next_admission_tracks_the_gating_entry() {
        let mut worker = worker(2);

        // Nothing queued: no wake-up needed.
        assert_eq!(worker.next_admission(), None);

        worker.backlog.push_back(noop_job());

        // Queued but the window still has room.
        assert_eq!(worker.next_admission(), None);

        let first = Instant::now();
        worker.log.push_back(first);
        time::sleep(Duration::from_secs(1)).await;
        let second = Instant::now();
        worker.log.push_back(second);

        // Window full: the oldest entry gates readmission.
        assert_eq!(worker.next_admission(), Some(first + WINDOW));

        time::sleep(Duration::from_secs(1)).await;
        worker.log.push_back(Instant::now());

        // Three recorded, ceiling two: capacity frees only once the second
        // entry expires as well.
        assert_eq!(worker.next_admission(), Some(second + WINDOW));
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_drains_the_backlog_against_one_count() {
        let mut worker = worker(2);
        for _ in 0..5 {
            worker.backlog.push_back(noop_job());
        }

        worker.dispatch_ready();

        // The log cannot grow mid-pass, so the whole backlog is admitted.
        assert!(worker.backlog.is_empty());
        assert_eq!(worker.in_flight, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_withholds_when_the_window_is_full() {
        let mut worker = worker(2);
        worker.log.push_back(Instant::now());
        worker.log.push_back(Instant::now());
        worker.backlog.push_back(noop_job());

        worker.dispatch_ready();

        assert_eq!(worker.backlog.len(), 1);
        assert_eq!(worker.in_flight, 0);
    }
}
