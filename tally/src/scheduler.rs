//! Background flush loop
//!
//! The [`Scheduler`] owns a single tokio task that calls a flush callback once
//! per refresh period. The task is stopped one of two ways:
//!
//! * cancellation, through the [`CancellationToken`] handed to
//!   [`Scheduler::new`]. The task exits at once and nothing more is flushed.
//! * [`Scheduler::stop`]. The task flushes one last time with [`Scope::All`],
//!   so the still-open window is included, then exits. `stop` returns only
//!   after the task is gone.
//!
//! The scheduler is `Idle` or `Running`. Starting a running scheduler and
//! stopping an idle one are both no-ops.

use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tally_signal::{Broadcaster, Completion, Watcher};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock::{Clock, TickInterval};

/// Errors produced by [`Scheduler`]
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The refresh period is zero.
    #[error("scheduler period must be greater than 0")]
    ZeroPeriod,
}

/// Which windows a flush should drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Only windows that have fully elapsed.
    Completed,
    /// Every window, including the one still open. Used by the final flush.
    All,
}

impl Scope {
    /// Whether the still-open window is drained.
    #[must_use]
    pub fn includes_current(self) -> bool {
        matches!(self, Scope::All)
    }
}

/// Events that drive the run loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    /// The refresh period elapsed
    Tick,
    /// The external cancellation token fired
    Cancelled,
    /// A graceful stop was requested
    StopRequested,
}

/// What the run loop does in response to an [`Event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    /// Flush with the given scope and keep looping
    Flush(Scope),
    /// Flush everything, then exit
    FlushAndExit,
    /// Exit without flushing
    Exit,
}

impl Event {
    pub(crate) fn operation(self) -> Operation {
        match self {
            Event::Tick => Operation::Flush(Scope::Completed),
            Event::Cancelled => Operation::Exit,
            Event::StopRequested => Operation::FlushAndExit,
        }
    }
}

#[derive(Debug)]
enum State {
    Idle,
    Running {
        /// Taken by the first `stop` caller.
        stop: Option<Broadcaster>,
        /// Resolves once the run loop has exited.
        exited: Completion,
    },
}

/// Periodically invokes a flush callback on a background task.
#[derive(Debug)]
pub struct Scheduler {
    period: Duration,
    cancellation: CancellationToken,
    state: Arc<Mutex<State>>,
}

impl Scheduler {
    /// Create a new, idle, [`Scheduler`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::ZeroPeriod`] if `period` is zero.
    pub fn new(period: Duration, cancellation: CancellationToken) -> Result<Self, Error> {
        if period.is_zero() {
            return Err(Error::ZeroPeriod);
        }
        Ok(Self {
            period,
            cancellation,
            state: Arc::new(Mutex::new(State::Idle)),
        })
    }

    /// The refresh period.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Whether the run loop is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            State::Running { .. }
        )
    }

    /// Start the run loop, calling `flush` every period.
    ///
    /// Returns false without doing anything if the loop is already running.
    /// Must be called from within a tokio runtime.
    pub fn start<C, F, Fut>(&self, clock: &C, flush: F) -> bool
    where
        C: Clock,
        F: FnMut(Scope) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let State::Running { .. } = *state {
            debug!("scheduler already running");
            return false;
        }

        let (watcher, broadcaster) = tally_signal::signal();
        *state = State::Running {
            exited: broadcaster.completion(),
            stop: Some(broadcaster),
        };
        drop(state);

        let run_loop = RunLoop {
            _guard: ExitGuard {
                state: Arc::clone(&self.state),
            },
            stop: watcher,
            interval: clock.interval(self.period),
            flush,
            cancellation: self.cancellation.clone(),
        };
        tokio::spawn(run_loop.run());
        info!(period = ?self.period, "scheduler started");
        true
    }

    /// Stop the run loop gracefully.
    ///
    /// The loop performs a final flush with [`Scope::All`] and exits; this
    /// call returns once it has. Concurrent callers all wait for the same
    /// exit. A no-op when idle.
    pub async fn stop(&self) {
        let (stop, exited) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match &mut *state {
                State::Idle => return,
                State::Running { stop, exited } => (stop.take(), exited.clone()),
            }
        };

        if let Some(broadcaster) = stop {
            info!("scheduler stop requested");
            broadcaster.signal();
        }
        exited.wait().await;
    }
}

/// Returns the scheduler to `Idle` when the run loop ends, panics included.
#[derive(Debug)]
struct ExitGuard {
    state: Arc<Mutex<State>>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = State::Idle;
    }
}

struct RunLoop<I, F> {
    // Fields drop in declaration order. The guard goes first so the scheduler
    // reads as idle before the watcher releases any `stop` caller.
    _guard: ExitGuard,
    stop: Watcher,
    interval: I,
    flush: F,
    cancellation: CancellationToken,
}

impl<I, F, Fut> RunLoop<I, F>
where
    I: TickInterval,
    F: FnMut(Scope) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn run(mut self) {
        loop {
            let event = tokio::select! {
                biased;

                () = self.cancellation.cancelled() => Event::Cancelled,
                () = self.stop.recv() => Event::StopRequested,
                () = self.interval.tick() => Event::Tick,
            };

            match event.operation() {
                Operation::Flush(scope) => (self.flush)(scope).await,
                Operation::FlushAndExit => {
                    debug!("final flush");
                    (self.flush)(Scope::All).await;
                    break;
                }
                Operation::Exit => {
                    info!("scheduler cancelled, skipping final flush");
                    break;
                }
            }
        }

        info!("scheduler exited");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future::{Ready, ready},
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use tokio::{sync::mpsc, time::timeout};
    use tokio_util::sync::CancellationToken;

    use super::{Error, Event, Operation, Scheduler, Scope};
    use crate::clock::ManualClock;

    const PERIOD: Duration = Duration::from_secs(60);
    const WAIT: Duration = Duration::from_secs(5);

    fn recording_flush(
        tx: mpsc::UnboundedSender<Scope>,
    ) -> impl FnMut(Scope) -> Ready<()> + Send + 'static {
        move |scope| {
            let _ = tx.send(scope);
            ready(())
        }
    }

    #[test]
    fn event_operation_table() {
        assert_eq!(Event::Tick.operation(), Operation::Flush(Scope::Completed));
        assert_eq!(Event::Cancelled.operation(), Operation::Exit);
        assert_eq!(Event::StopRequested.operation(), Operation::FlushAndExit);
        assert!(Scope::All.includes_current());
        assert!(!Scope::Completed.includes_current());
    }

    #[test]
    fn zero_period_is_rejected() {
        assert_eq!(
            Scheduler::new(Duration::ZERO, CancellationToken::new()).unwrap_err(),
            Error::ZeroPeriod
        );
    }

    #[tokio::test]
    async fn ticks_flush_completed_windows() {
        let clock = ManualClock::from_unix_seconds(0);
        let scheduler = Scheduler::new(PERIOD, CancellationToken::new()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert!(scheduler.start(&clock, recording_flush(tx)));
        assert!(scheduler.is_running());

        for _ in 0..3 {
            clock.advance(PERIOD);
            let scope = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            assert_eq!(scope, Scope::Completed);
        }

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn stop_flushes_exactly_once_more() {
        let clock = ManualClock::from_unix_seconds(0);
        let scheduler = Scheduler::new(PERIOD, CancellationToken::new()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        scheduler.start(&clock, recording_flush(tx));
        clock.advance(PERIOD);
        assert_eq!(
            timeout(WAIT, rx.recv()).await.unwrap(),
            Some(Scope::Completed)
        );

        scheduler.stop().await;
        assert!(!scheduler.is_running());
        assert_eq!(rx.try_recv().unwrap(), Scope::All);

        // The loop is gone: its sender dropped with it.
        assert!(rx.recv().await.is_none());

        // A second stop is a no-op.
        timeout(WAIT, scheduler.stop()).await.unwrap();
    }

    #[tokio::test]
    async fn second_start_is_a_no_op() {
        let clock = ManualClock::from_unix_seconds(0);
        let scheduler = Scheduler::new(PERIOD, CancellationToken::new()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert!(scheduler.start(&clock, recording_flush(tx.clone())));
        assert!(!scheduler.start(&clock, recording_flush(tx)));

        clock.advance(PERIOD);
        assert_eq!(
            timeout(WAIT, rx.recv()).await.unwrap(),
            Some(Scope::Completed)
        );
        scheduler.stop().await;
        assert_eq!(rx.try_recv().unwrap(), Scope::All);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_when_idle_returns() {
        let scheduler = Scheduler::new(PERIOD, CancellationToken::new()).unwrap();
        timeout(WAIT, scheduler.stop()).await.unwrap();
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn restart_after_stop() {
        let clock = ManualClock::from_unix_seconds(0);
        let scheduler = Scheduler::new(PERIOD, CancellationToken::new()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        scheduler.start(&clock, recording_flush(tx.clone()));
        scheduler.stop().await;
        assert_eq!(rx.try_recv().unwrap(), Scope::All);

        assert!(scheduler.start(&clock, recording_flush(tx)));
        clock.advance(PERIOD);
        assert_eq!(
            timeout(WAIT, rx.recv()).await.unwrap(),
            Some(Scope::Completed)
        );
        scheduler.stop().await;
        assert_eq!(rx.try_recv().unwrap(), Scope::All);
    }

    #[tokio::test]
    async fn cancellation_skips_final_flush() {
        let clock = ManualClock::from_unix_seconds(0);
        let cancellation = CancellationToken::new();
        let scheduler = Scheduler::new(PERIOD, cancellation.clone()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        scheduler.start(&clock, recording_flush(tx));
        cancellation.cancel();

        // Channel closes once the loop drops its flush callback.
        assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
        assert!(!scheduler.is_running());

        // Stopping a cancelled scheduler does not flush either.
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn cancellation_wins_over_pending_stop() {
        let clock = ManualClock::from_unix_seconds(0);
        let cancellation = CancellationToken::new();
        let scheduler = Scheduler::new(PERIOD, cancellation.clone()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        scheduler.start(&clock, recording_flush(tx));
        cancellation.cancel();
        scheduler.stop().await;

        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_stops_flush_once() {
        let clock = ManualClock::from_unix_seconds(0);
        let scheduler = Arc::new(Scheduler::new(PERIOD, CancellationToken::new()).unwrap());
        let flushes = Arc::new(AtomicUsize::new(0));

        let counted = Arc::clone(&flushes);
        scheduler.start(&clock, move |scope| {
            assert_eq!(scope, Scope::All);
            counted.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        let mut stoppers = Vec::new();
        for _ in 0..8 {
            let scheduler = Arc::clone(&scheduler);
            stoppers.push(tokio::spawn(async move {
                scheduler.stop().await;
                // Every caller returns only after the loop is gone.
                assert!(!scheduler.is_running());
            }));
        }
        for stopper in stoppers {
            timeout(WAIT, stopper).await.unwrap().unwrap();
        }

        assert_eq!(flushes.load(Ordering::SeqCst), 1);
    }
}
