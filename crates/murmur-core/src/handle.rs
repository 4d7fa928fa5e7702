//! Outbound queues.
//!
//! Every registered client owns a bounded queue of events. The relay only
//! ever enqueues (never blocks); the connection's writer task drains the
//! queue and performs the actual I/O.

use murmur_protocol::Event;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Default outbound queue capacity per client.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

/// Receiving half of a client's outbound queue.
pub type OutboundReceiver = mpsc::Receiver<Arc<Event>>;

/// Why an event could not be enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// The queue is full: the consumer is not keeping up.
    Full,
    /// The receiving side is gone: the connection has ended.
    Closed,
}

/// Capability to deliver events to one client.
///
/// Cloning is cheap; all clones feed the same queue.
#[derive(Clone)]
pub struct SendHandle {
    tx: mpsc::Sender<Arc<Event>>,
    dropped: Arc<AtomicU64>,
}

impl SendHandle {
    /// Create a handle and the receiver that drains it.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, OutboundReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Enqueue an event without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`SendFailure`] if the queue is full or closed.
    pub fn try_deliver(&self, event: Arc<Event>) -> Result<(), SendFailure> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(SendFailure::Full)
            }
            Err(TrySendError::Closed(_)) => Err(SendFailure::Closed),
        }
    }

    /// Whether the receiving side has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Events dropped because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for SendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendHandle")
            .field("closed", &self.is_closed())
            .field("dropped", &self.dropped())
            .finish()
    }
}
