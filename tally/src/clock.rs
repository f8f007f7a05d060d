//! Sources of "now" for counters and the scheduler
//!
//! Counters bucket increments by wall-clock seconds and the scheduler fires on
//! a fixed period. Both go through [`Clock`] and never call the system time
//! directly, so a [`ManualClock`] makes bucket boundaries and tick firing exact
//! in tests.

use std::{
    future::{Future, pending},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::{
    sync::watch,
    time::{self, Instant, Interval, MissedTickBehavior},
};

/// A periodic timer produced by a [`Clock`].
pub trait TickInterval: Send + 'static {
    /// Wait for the next period to elapse.
    fn tick(&mut self) -> impl Future<Output = ()> + Send;
}

/// The `Clock` used by every counter and scheduler.
pub trait Clock: Clone + Send + Sync + 'static {
    /// The timer type returned by [`Clock::interval`].
    type Interval: TickInterval;

    /// The current wall-clock time.
    fn now(&self) -> SystemTime;

    /// A timer firing every `period`, first one `period` from now.
    fn interval(&self, period: Duration) -> Self::Interval;
}

/// Whole seconds since the Unix epoch, rounded toward negative infinity.
#[must_use]
pub fn unix_seconds(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => i64::try_from(since.as_secs()).unwrap_or(i64::MAX),
        Err(err) => {
            let before = err.duration();
            let secs = i64::try_from(before.as_secs()).unwrap_or(i64::MAX);
            if before.subsec_nanos() > 0 {
                -secs - 1
            } else {
                -secs
            }
        }
    }
}

/// The instant `seconds` whole seconds after (or before) the Unix epoch.
#[must_use]
pub fn from_unix_seconds(seconds: i64) -> SystemTime {
    let magnitude = Duration::from_secs(seconds.unsigned_abs());
    if seconds >= 0 {
        UNIX_EPOCH + magnitude
    } else {
        UNIX_EPOCH - magnitude
    }
}

#[derive(Debug, Clone, Copy, Default)]
/// A clock that operates with respect to real-clock time.
pub struct RealClock;

impl Clock for RealClock {
    type Interval = RealInterval;

    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn interval(&self, period: Duration) -> RealInterval {
        let mut inner = time::interval_at(Instant::now() + period, period);
        inner.set_missed_tick_behavior(MissedTickBehavior::Delay);
        RealInterval { inner }
    }
}

/// Timer backed by [`tokio::time::Interval`].
#[derive(Debug)]
pub struct RealInterval {
    inner: Interval,
}

impl TickInterval for RealInterval {
    fn tick(&mut self) -> impl Future<Output = ()> + Send {
        async move {
            self.inner.tick().await;
        }
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same time. Intervals created from a `ManualClock` fire
/// once per period the clock has been advanced past; advancing several
/// periods in one step leaves that many ticks ready to fire back to back.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<watch::Sender<SystemTime>>,
}

impl ManualClock {
    /// Create a new `ManualClock` stopped at `start`.
    #[must_use]
    pub fn new(start: SystemTime) -> Self {
        let (sender, _) = watch::channel(start);
        Self {
            now: Arc::new(sender),
        }
    }

    /// Create a new `ManualClock` stopped `seconds` after the Unix epoch.
    #[must_use]
    pub fn from_unix_seconds(seconds: i64) -> Self {
        Self::new(from_unix_seconds(seconds))
    }

    /// Move time forward by `by`, waking any interval whose deadline passed.
    pub fn advance(&self, by: Duration) {
        self.now.send_modify(|now| *now += by);
    }

    /// Jump to `at`. Moving backward is allowed but intervals will not fire
    /// again until their old deadline is reached.
    pub fn set(&self, at: SystemTime) {
        self.now.send_replace(at);
    }
}

impl Clock for ManualClock {
    type Interval = ManualInterval;

    fn now(&self) -> SystemTime {
        *self.now.borrow()
    }

    fn interval(&self, period: Duration) -> ManualInterval {
        let now = self.now.subscribe();
        let next = *now.borrow() + period;
        ManualInterval { now, next, period }
    }
}

/// Timer driven by a [`ManualClock`].
#[derive(Debug)]
pub struct ManualInterval {
    now: watch::Receiver<SystemTime>,
    next: SystemTime,
    period: Duration,
}

impl TickInterval for ManualInterval {
    fn tick(&mut self) -> impl Future<Output = ()> + Send {
        async move {
            loop {
                let now = *self.now.borrow_and_update();
                if now >= self.next {
                    self.next += self.period;
                    return;
                }
                if self.now.changed().await.is_err() {
                    // Every clock handle is gone, time will never move again.
                    pending::<()>().await;
                }
            }
        }
    }
}
