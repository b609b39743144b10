use thiserror::Error;

use crate::chat::{ConnectionId, RoomId, UserId};

/// Failures raised by the persistence collaborators.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<uuid::Error> for StoreError {
    fn from(err: uuid::Error) -> Self {
        Self::Corrupt(err.to_string())
    }
}

impl From<time::error::Parse> for StoreError {
    fn from(err: time::error::Parse) -> Self {
        Self::Corrupt(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("user {user} is not a participant of room {room}")]
    NotAuthorized { room: RoomId, user: UserId },

    #[error("connection {connection} is already attached to room {room}")]
    AlreadyAttached { connection: ConnectionId, room: RoomId },

    #[error("message could not be stored: {0}")]
    PersistenceFailure(#[source] StoreError),

    #[error("message is {len} bytes, limit is {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ChatError {
    /// Stable label sent to clients in error frames.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotAuthorized { .. } => "not_authorized",
            Self::AlreadyAttached { .. } => "already_attached",
            Self::PersistenceFailure(_) => "persistence_failure",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::NotFound(_) => "not_found",
            Self::Store(_) => "store_unavailable",
        }
    }
}
