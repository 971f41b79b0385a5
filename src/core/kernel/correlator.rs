use crate::core::errors::ExchangeError;
use crate::core::kernel::codec::AckError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

type AckSender = oneshot::Sender<Result<(), AckError>>;

/// Matches control-frame replies to the requests that caused them.
///
/// Ids are allocated from a per-connection counter starting at 1 and are never
/// reused while the connection lives. Each id has at most one waiter; a reply
/// for an id with no waiter is reported back to the caller as unmatched.
#[derive(Debug, Default)]
pub struct Correlator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, AckSender>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next request id
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a waiter for `id`.
    ///
    /// The waiter must be registered before the request frame is sent so that
    /// a fast reply cannot overtake it.
    pub fn register(self: &Arc<Self>, id: u64) -> PendingAck {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        PendingAck {
            id,
            rx: Some(rx),
            correlator: Arc::clone(self),
        }
    }

    /// Complete the waiter for `id`. Returns false when nobody is waiting,
    /// which covers both unknown ids and replies that arrived after a timeout.
    pub fn resolve(&self, id: u64, outcome: Result<(), AckError>) -> bool {
        let sender = self.pending.lock().remove(&id);
        match sender {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Drop every waiter; each sees the connection as closed
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();
        if count > 0 {
            debug!(count, "Failing pending control requests");
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn forget(&self, id: u64) {
        self.pending.lock().remove(&id);
    }
}

/// Waiter for a single acknowledgement. Dropping it deregisters the id.
#[derive(Debug)]
pub struct PendingAck {
    id: u64,
    rx: Option<oneshot::Receiver<Result<(), AckError>>>,
    correlator: Arc<Correlator>,
}

impl PendingAck {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the reply.
    ///
    /// Resolves to `SubscriptionTimeout` when nothing arrives in time,
    /// `ConnectionClosed` when the connection dropped the waiter, and
    /// `SubscriptionRejected` when the server reported an error.
    pub async fn wait(mut self, timeout: Duration) -> Result<(), ExchangeError> {
        let Some(rx) = self.rx.take() else {
            return Err(ExchangeError::ConnectionClosed);
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome.map_err(ExchangeError::from),
            Ok(Err(_)) => Err(ExchangeError::ConnectionClosed),
            Err(_) => Err(ExchangeError::SubscriptionTimeout {
                id: self.id,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

impl Drop for PendingAck {
    fn drop(&mut self) {
        self.correlator.forget(self.id);
    }
}
