use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::{
    config::Limits,
    error::ChatError,
    store::{ChatMessage, Identity, Membership, MessageStore, SqliteStore},
};

use super::{
    BroadcastReport, Broadcaster, ConnectionId, ConnectionRegistry, OutboundMessage, RoomId,
    ServerEvent, UserId,
};

/// The one registry/broadcaster pair of the process, with the stores it
/// needs. Built at startup and handed to every session.
pub struct ChatHub {
    registry: ConnectionRegistry,
    broadcaster: Broadcaster,
    store: Arc<dyn MessageStore>,
    membership: Arc<dyn Membership>,
    identity: Arc<dyn Identity>,
    limits: Limits,
    shutdown: watch::Sender<bool>,
    next_connection: AtomicU64,
}

#[derive(Debug)]
pub struct Published {
    pub message: ChatMessage,
    pub report: BroadcastReport,
}

impl ChatHub {
    pub fn new(
        store: Arc<dyn MessageStore>,
        membership: Arc<dyn Membership>,
        identity: Arc<dyn Identity>,
        limits: Limits,
    ) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            broadcaster: Broadcaster::new(),
            store,
            membership,
            identity,
            limits,
            shutdown: watch::Sender::new(false),
            next_connection: AtomicU64::new(1),
        }
    }

    pub fn with_sqlite(store: SqliteStore, limits: Limits) -> Self {
        let store = Arc::new(store);
        Self::new(store.clone(), store.clone(), store, limits)
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn connection_count(&self) -> usize {
        self.registry.connection_count()
    }

    pub fn room_count(&self) -> usize {
        self.registry.room_count()
    }

    pub(crate) fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed))
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Tells every live session to close. Sessions opened afterwards close
    /// immediately.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        info!(connections = self.connection_count(), "chat hub shutting down");
    }

    pub async fn authorize(&self, room: RoomId, user: UserId) -> Result<(), ChatError> {
        if self.membership.is_participant(room, user).await? {
            Ok(())
        } else {
            Err(ChatError::NotAuthorized { room, user })
        }
    }

    pub async fn display_name(&self, user: UserId) -> String {
        self.identity.display_name(user).await
    }

    /// Stores `content` and fans it out to the room. Nothing is broadcast
    /// unless the store accepted it.
    pub async fn publish(
        &self,
        room: RoomId,
        sender: UserId,
        sender_name: &str,
        content: &str,
    ) -> Result<Published, ChatError> {
        let max = self.limits.max_message_bytes;
        if content.len() > max {
            return Err(ChatError::PayloadTooLarge { len: content.len(), max });
        }
        self.authorize(room, sender).await?;

        let _turn = self.broadcaster.turn(room).await;
        let message = self
            .store
            .append(room, sender, content)
            .await
            .map_err(ChatError::PersistenceFailure)?;

        let frame = Arc::new(ServerEvent::Message(OutboundMessage::new(&message, sender_name)));
        let report = self.broadcaster.broadcast(&frame, &self.registry.list_connections(room));

        debug!(room_id = %room, message_id = %message.message_id, delivered = report.delivered, "published");
        Ok(Published { message, report })
    }

    pub async fn history(&self, room: RoomId, reader: UserId) -> Result<Vec<ChatMessage>, ChatError> {
        self.authorize(room, reader).await?;
        Ok(self.store.list_ordered(room).await?)
    }
}
