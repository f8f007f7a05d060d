//! Stop signalling for tally's background tasks.
//!
//! A reporting client runs one background loop. Stopping that loop is a
//! cooperative affair: the caller raises a request, the loop performs a final
//! flush and only then exits. The caller must not return before the loop is
//! gone, otherwise the final flush races process exit.
//!
//! The mechanism here has three components, a `Broadcaster`, a `Watcher` and a
//! `Completion`. The `Broadcaster` raises the signal, a one-time event. The
//! `Watcher` waits for the signal and counts as outstanding until it is
//! dropped, not merely until it has seen the signal. A `Completion` waits for
//! the `Watcher` to drop off. Any number of `Completion` handles may wait at
//! once, which lets concurrent stop callers all block on the same exit.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use tokio::sync::{Notify, watch};
use tracing::debug;

/// Construct a `Watcher` and `Broadcaster` pair.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    let (sender, receiver) = watch::channel(false);
    let peers = Arc::new(Peers {
        count: AtomicU32::new(1),
        notify: Notify::new(),
    });

    let w = Watcher {
        receiver,
        peers: Arc::clone(&peers),
        signal_received: false,
    };
    let b = Broadcaster { sender, peers };

    (w, b)
}

/// Shared bookkeeping of `Watcher` instances still alive.
#[derive(Debug)]
struct Peers {
    count: AtomicU32,
    /// Wakes `Completion` waiters whenever a peer drops off.
    notify: Notify,
}

impl Peers {
    fn decrement(&self) {
        // Not fetch_sub: that wraps at zero and a spurious extra decrement
        // would leave waiters hanging on u32::MAX peers.
        let mut old = self.count.load(Ordering::Relaxed);
        while old > 0 {
            match self.count.compare_exchange_weak(
                old,
                old - 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.notify.notify_waiters();
                    return;
                }
                Err(x) => old = x,
            }
        }
    }
}

#[derive(Debug)]
/// Mechanism to notify one or more `Watcher` instances that they should stop.
pub struct Broadcaster {
    /// Transmission point for the signal. `true` once signalled.
    sender: watch::Sender<bool>,
    peers: Arc<Peers>,
}

impl Broadcaster {
    /// Send the signal through to any `Watcher` instances.
    ///
    /// Function will NOT block until the peers have finished.
    pub fn signal(self) {
        self.sender.send_replace(true);
    }

    /// Obtain a handle that resolves once the `Watcher` has dropped. Useful
    /// to callers that did not raise the signal themselves.
    #[must_use]
    pub fn completion(&self) -> Completion {
        Completion {
            peers: Arc::clone(&self.peers),
        }
    }
}

#[derive(Debug, Clone)]
/// Waits for the `Watcher` of a signal to drop.
pub struct Completion {
    peers: Arc<Peers>,
}

impl Completion {
    /// Block until no `Watcher` remains.
    pub async fn wait(&self) {
        // Register for notification before checking the condition. Checking
        // first would let a peer decrement and notify between the check and
        // the registration, and the wakeup would be lost.
        loop {
            let notified = self.peers.notify.notified();

            let peers = self.peers.count.load(Ordering::SeqCst);
            if peers == 0 {
                break;
            }
            debug!("Waiting for {peers} peers");

            notified.await;
        }
    }

    /// Whether the `Watcher` has dropped.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.peers.count.load(Ordering::SeqCst) == 0
    }
}

#[derive(Debug)]
/// Mechanism to watch for the stop signal.
///
/// A `Watcher` holds any `Completion` open until it is dropped, so holders
/// should drop it only once their work is done.
pub struct Watcher {
    receiver: watch::Receiver<bool>,
    peers: Arc<Peers>,
    /// Used to track if the signal has been received without synchronization.
    signal_received: bool,
}

impl Watcher {
    /// Receive the stop signal. This function will block if the signal has
    /// not already been sent.
    ///
    /// A dropped `Broadcaster` counts as a sent signal. Once received every
    /// further call returns immediately. Safe to use as a `select!` branch.
    pub async fn recv(&mut self) {
        if self.signal_received {
            return;
        }
        // An error means the sender is gone, the same as a signal.
        let _ = self.receiver.wait_for(|signalled| *signalled).await;
        self.signal_received = true;
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.peers.decrement();
    }
}
