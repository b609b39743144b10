use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::ChatError;

use super::{ConnectionHandle, ConnectionId, RoomId};

/// Room → live connections. Every operation takes the lock once and never
/// holds it across an await.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<Attachments>,
}

#[derive(Default)]
struct Attachments {
    rooms: HashMap<RoomId, Vec<ConnectionHandle>>,
    room_of: HashMap<ConnectionId, RoomId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-registering in the same room is a no-op; a handle already attached
    /// elsewhere is refused.
    pub fn register(&self, room: RoomId, connection: &ConnectionHandle) -> Result<(), ChatError> {
        let mut inner = self.inner.lock();
        let id = connection.id();

        match inner.room_of.get(&id) {
            Some(current) if *current == room => return Ok(()),
            Some(current) => {
                return Err(ChatError::AlreadyAttached { connection: id, room: *current });
            }
            None => {}
        }

        inner.room_of.insert(id, room);
        inner.rooms.entry(room).or_default().push(connection.clone());
        debug!(room_id = %room, connection_id = %id, "registered");
        Ok(())
    }

    /// Returns whether anything was removed. Absent handles are fine.
    pub fn deregister(&self, room: RoomId, connection: ConnectionId) -> bool {
        let mut inner = self.inner.lock();

        let Some(members) = inner.rooms.get_mut(&room) else {
            return false;
        };
        let Some(position) = members.iter().position(|c| c.id() == connection) else {
            return false;
        };
        members.remove(position);
        if members.is_empty() {
            inner.rooms.remove(&room);
        }
        inner.room_of.remove(&connection);

        debug!(room_id = %room, connection_id = %connection, "deregistered");
        true
    }

    /// Snapshot in registration order; empty for unknown rooms.
    pub fn list_connections(&self, room: RoomId) -> Vec<ConnectionHandle> {
        self.inner
            .lock()
            .rooms
            .get(&room)
            .cloned()
            .unwrap_or_default()
    }

    pub fn room_of(&self, connection: ConnectionId) -> Option<RoomId> {
        self.inner.lock().room_of.get(&connection).copied()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().room_of.len()
    }

    pub fn room_count(&self) -> usize {
        self.inner.lock().rooms.len()
    }
}
