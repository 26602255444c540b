use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use parley_core::{ConnectionId, UserId};

/// Why a payload could not be queued for a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The consumer is not keeping up. Fatal for the session.
    #[error("outbound queue full")]
    Full,
    #[error("outbound queue closed")]
    Closed,
}

/// One live connection for one user, as seen by the hub: an identity plus
/// the producer side of a bounded outbound queue.
///
/// Clones share the same queue. Closing it from any clone makes the write
/// pump drain what is already buffered and then stop.
#[derive(Clone, Debug)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    tx: mpsc::Sender<Bytes>,
    closed: CancellationToken,
}

impl Session {
    /// Create a session with an outbound queue of `capacity` payloads.
    /// The receiver belongs to the session's write pump.
    pub fn new(user_id: UserId, capacity: usize) -> (Self, Outbound) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();
        let session = Self {
            connection_id: ConnectionId::new(),
            user_id,
            tx,
            closed: closed.clone(),
        };
        (session, Outbound { rx, closed })
    }

    /// Non-blocking enqueue. Never waits for the consumer.
    pub fn try_push(&self, payload: Bytes) -> Result<(), QueueError> {
        if self.closed.is_cancelled() {
            return Err(QueueError::Closed);
        }
        self.tx.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })
    }

    /// Close the outbound queue. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    pub fn is_same_connection(&self, other: &Session) -> bool {
        self.connection_id == other.connection_id
    }
}

/// Consumer side of a session's outbound queue.
#[derive(Debug)]
pub struct Outbound {
    rx: mpsc::Receiver<Bytes>,
    closed: CancellationToken,
}

impl Outbound {
    /// Next payload. Buffered payloads are still yielded after the queue is
    /// closed; `None` means closed and drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        tokio::select! {
            biased;
            item = self.rx.recv() => item,
            _ = self.closed.cancelled() => self.rx.try_recv().ok(),
        }
    }

    /// Payload already buffered, if any.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }

    /// Number of payloads currently buffered.
    pub fn buffered(&self) -> usize {
        self.rx.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
