//! Fan-out of stored messages to the connections of a room.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use super::{ConnectionHandle, DeliveryFailure, RoomId, connection::Frame};

/// Outcome of one broadcast. Failures are per connection and never abort the
/// rest of the fan-out.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failures: Vec<DeliveryFailure>,
}

#[derive(Default)]
pub struct Broadcaster {
    turns: Mutex<HashMap<RoomId, Arc<tokio::sync::Mutex<()>>>>,
}

/// Exclusive right to persist and broadcast in one room. Held across both
/// steps so every connection sees a room's messages in persistence order.
pub struct RoomTurn<'a> {
    broadcaster: &'a Broadcaster,
    room: RoomId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn turn(&self, room: RoomId) -> RoomTurn<'_> {
        let lock = self.turns.lock().entry(room).or_default().clone();
        let guard = lock.lock_owned().await;

        RoomTurn {
            broadcaster: self,
            room,
            guard: Some(guard),
        }
    }

    /// Enqueues `frame` on every connection in the snapshot. Never waits on a
    /// peer; connections that fail are asked to close by their own sessions.
    pub fn broadcast(&self, frame: &Frame, connections: &[ConnectionHandle]) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for connection in connections {
            match connection.deliver(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(failure) => {
                    warn!(
                        connection_id = %failure.connection,
                        user_id = connection.user_id(),
                        reason = %failure.reason,
                        "delivery failed, evicting"
                    );
                    connection.evict();
                    report.failures.push(failure);
                }
            }
        }

        debug!(
            recipients = connections.len(),
            delivered = report.delivered,
            failed = report.failures.len(),
            "broadcast"
        );
        report
    }

    #[cfg(test)]
    fn active_turns(&self) -> usize {
        self.turns.lock().len()
    }
}

impl Drop for RoomTurn<'_> {
    fn drop(&mut self) {
        let mut turns = self.broadcaster.turns.lock();
        // Only the map and this guard hold the lock: nobody is queued behind us.
        if turns.get(&self.room).is_some_and(|lock| Arc::strong_count(lock) <= 2) {
            turns.remove(&self.room);
        }
        self.guard.take();
    }
}
