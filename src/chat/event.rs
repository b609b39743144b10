use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{error::ChatError, store::ChatMessage};

use super::{RoomId, UserId};

/// Frames pushed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Message(OutboundMessage),
    Error { kind: String, detail: String },
}

/// A stored message plus the sender's label, so clients need no second fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub message_id: Uuid,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: OffsetDateTime,
}

impl OutboundMessage {
    pub fn new(message: &ChatMessage, sender_name: &str) -> Self {
        Self {
            message_id: message.message_id,
            room_id: message.room_id,
            sender_id: message.sender_id,
            sender_name: sender_name.to_owned(),
            content: message.content.clone(),
            sent_at: message.sent_at,
        }
    }
}

impl ServerEvent {
    pub fn error(err: &ChatError) -> Self {
        Self::Error {
            kind: err.kind().to_owned(),
            detail: err.to_string(),
        }
    }
}
