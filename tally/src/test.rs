//! Test helpers shared across modules.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::sync::mpsc;

use crate::{
    backend::{Backend, Error},
    series::CreateTimeSeriesRequest,
};

/// A backend that records every request it is handed.
///
/// Each submission, failed ones included, is forwarded to the receiver
/// returned by [`Recording::new`].
#[derive(Debug)]
pub(crate) struct Recording {
    sent: mpsc::UnboundedSender<CreateTimeSeriesRequest>,
    failures: AtomicUsize,
}

impl Recording {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<CreateTimeSeriesRequest>) {
        let (sent, received) = mpsc::unbounded_channel();
        let backend = Arc::new(Self {
            sent,
            failures: AtomicUsize::new(0),
        });
        (backend, received)
    }

    /// Reject the next `n` submissions.
    pub(crate) fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Backend for Recording {
    async fn submit(&self, request: &CreateTimeSeriesRequest) -> Result<(), Error> {
        // The receiver may be gone in tests that only care about side effects.
        let _ = self.sent.send(request.clone());

        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(Error::Status {
                status: StatusCode::SERVICE_UNAVAILABLE,
                body: "unavailable".to_string(),
            });
        }
        Ok(())
    }
}

/// Everything received so far, without waiting.
pub(crate) fn drain(
    received: &mut mpsc::UnboundedReceiver<CreateTimeSeriesRequest>,
) -> Vec<CreateTimeSeriesRequest> {
    let mut requests = Vec::new();
    while let Ok(request) = received.try_recv() {
        requests.push(request);
    }
    requests
}
