use std::{fmt, sync::Arc};

use thiserror::Error;
use tokio::sync::{Notify, mpsc, mpsc::error::TrySendError};

use super::{ConnectionId, ServerEvent, UserId};

pub type Frame = Arc<ServerEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailureReason {
    /// The session dropped its queue.
    Gone,
    /// The queue was full: the writer is not keeping up.
    Stalled,
}

impl fmt::Display for DeliveryFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Gone => "peer gone",
            Self::Stalled => "peer stalled",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("delivery to {connection} failed: {reason}")]
pub struct DeliveryFailure {
    pub connection: ConnectionId,
    pub reason: DeliveryFailureReason,
}

/// Routing token for one live connection.
///
/// Holds only a weak reference to the outbound queue: the owning session keeps
/// the strong sender, so a handle left in someone's snapshot never keeps a dead
/// connection alive.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: UserId,
    sender: mpsc::WeakSender<Frame>,
    evicted: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Enqueues without waiting. A full queue counts as a stalled peer.
    pub fn deliver(&self, frame: Frame) -> Result<(), DeliveryFailure> {
        let failure = |reason| DeliveryFailure { connection: self.id, reason };

        let Some(sender) = self.sender.upgrade() else {
            return Err(failure(DeliveryFailureReason::Gone));
        };

        sender.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => failure(DeliveryFailureReason::Stalled),
            TrySendError::Closed(_) => failure(DeliveryFailureReason::Gone),
        })
    }

    /// Asks the owning session to close.
    pub fn evict(&self) {
        self.evicted.notify_one();
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Receiving end of a connection's queue, drained by the transport writer.
/// Dropping it evicts the session.
pub struct Outbox {
    receiver: mpsc::Receiver<Frame>,
    evicted: Arc<Notify>,
}

impl Outbox {
    pub async fn recv(&mut self) -> Option<Frame> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Outbox {
    fn drop(&mut self) {
        self.evicted.notify_one();
    }
}

pub(crate) struct Channel {
    pub sender: mpsc::Sender<Frame>,
    pub handle: ConnectionHandle,
    pub outbox: Outbox,
    pub evicted: Arc<Notify>,
}

pub(crate) fn channel(id: ConnectionId, user_id: UserId, capacity: usize) -> Channel {
    let (sender, receiver) = mpsc::channel(capacity);
    let evicted = Arc::new(Notify::new());

    Channel {
        handle: ConnectionHandle {
            id,
            user_id,
            sender: sender.downgrade(),
            evicted: evicted.clone(),
        },
        outbox: Outbox {
            receiver,
            evicted: evicted.clone(),
        },
        sender,
        evicted,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn frame() -> Frame {
        Arc::new(ServerEvent::Error { kind: "test".into(), detail: String::new() })
    }

    #[tokio::test]
    async fn delivers_while_owner_is_alive() {
        let mut chan = channel(ConnectionId(1), 1, 4);
        chan.handle.deliver(frame()).unwrap();
        assert_eq!(chan.outbox.recv().await, Some(frame()));
    }

    #[test]
    fn dropped_owner_means_gone() {
        let Channel { sender, handle, outbox: _outbox, .. } = channel(ConnectionId(2), 1, 4);
        drop(sender);

        let err = handle.deliver(frame()).unwrap_err();
        assert_eq!(err.reason, DeliveryFailureReason::Gone);
    }

    #[test]
    fn full_queue_is_stalled() {
        let Channel { sender: _sender, handle, outbox: _outbox, .. } = channel(ConnectionId(3), 1, 1);
        handle.deliver(frame()).unwrap();

        let err = handle.deliver(frame()).unwrap_err();
        assert_eq!(err.reason, DeliveryFailureReason::Stalled);
    }

    #[tokio::test]
    async fn dropping_outbox_evicts() {
        let Channel { outbox, evicted, .. } = channel(ConnectionId(4), 1, 1);
        drop(outbox);
        tokio::time::timeout(Duration::from_secs(1), evicted.notified())
            .await
            .unwrap();
    }
}
