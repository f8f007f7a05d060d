//! Interval-bucketed counters
//!
//! A [`Counter`] tallies increments into fixed-length windows aligned to the
//! Unix epoch. The bucket for an increment is `floor(now / interval) *
//! interval` in whole seconds, so two increments share a window iff they fall
//! in the same interval-aligned span.
//!
//! # Concurrency
//!
//! Each bucket total is an atomic. [`Counter::count`] computes its key and
//! adds to the bucket while holding the read side of a lock; only the first
//! increment into a new key takes the write side to insert it. Draining takes
//! the write side and determines "current" under it. An increment therefore
//! happens either wholly before a drain, in which case the drain sees it, or
//! wholly after, in which case its key is at least the drain's current key and
//! the drain leaves it alone. No increment is lost and none is counted twice.

use std::{
    collections::BTreeMap,
    sync::{
        PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime},
};

use crate::clock::{self, Clock, RealClock};

/// Errors produced by [`Counter`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The bucket interval must be at least one second.
    #[error("interval must be greater than 0, got {0}")]
    InvalidInterval(i64),
}

/// Truncate `seconds` down to the nearest multiple of `interval`.
///
/// Uses floor division, so negative timestamps round toward negative
/// infinity.
#[inline]
#[must_use]
pub fn bucket_key(seconds: i64, interval: i64) -> i64 {
    debug_assert!(interval > 0);
    seconds.div_euclid(interval) * interval
}

/// A drained accounting period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Inclusive start of the window.
    pub start: SystemTime,
    /// Exclusive end of the window, `start + interval`.
    pub end: SystemTime,
    /// Number of increments counted in the window.
    pub total: u64,
}

impl Window {
    fn from_bucket(key: i64, interval: i64, total: u64) -> Self {
        let start = clock::from_unix_seconds(key);
        Self {
            start,
            end: start + Duration::from_secs(interval.unsigned_abs()),
            total,
        }
    }
}

/// A thread-safe tally of occurrences, bucketed by time window.
#[derive(Debug)]
pub struct Counter<C = RealClock> {
    /// Window length in seconds, always positive.
    interval: i64,
    buckets: RwLock<BTreeMap<i64, AtomicU64>>,
    clock: C,
}

impl<C> Counter<C>
where
    C: Clock,
{
    /// Create a new [`Counter`] with windows `interval` seconds long.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInterval`] if `interval` is not positive.
    pub fn new(interval: i64, clock: C) -> Result<Self, Error> {
        if interval <= 0 {
            return Err(Error::InvalidInterval(interval));
        }
        Ok(Self {
            interval,
            buckets: RwLock::new(BTreeMap::new()),
            clock,
        })
    }

    /// The window length in seconds.
    #[must_use]
    pub fn interval(&self) -> i64 {
        self.interval
    }

    /// The key of the window "now" falls into.
    #[must_use]
    pub fn current_key(&self) -> i64 {
        bucket_key(clock::unix_seconds(self.clock.now()), self.interval)
    }

    /// Add one to the running total of the current window.
    pub fn count(&self) {
        {
            let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(total) = buckets.get(&self.current_key()) {
                total.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        // First increment in this window. The key is recomputed under the
        // write lock: a drain may have run since the read lock was released.
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        let total = buckets.entry(self.current_key()).or_default();
        *total.get_mut() += 1;
    }

    /// Remove and return every window that has fully elapsed, oldest first.
    ///
    /// When `include_current` is true the window "now" falls into is removed
    /// as well. Callers pass true only once no further increments will occur,
    /// an increment after that point opens a fresh window.
    pub fn take_completed_windows(&self, include_current: bool) -> Vec<Window> {
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);

        let drained = if include_current {
            std::mem::take(&mut *buckets)
        } else {
            let open = buckets.split_off(&self.current_key());
            std::mem::replace(&mut *buckets, open)
        };
        drop(buckets);

        drained
            .into_iter()
            .map(|(key, total)| Window::from_bucket(key, self.interval, total.into_inner()))
            .collect()
    }
}
