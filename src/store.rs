//! Persistence collaborators of the chat core.
//!
//! The core only talks to [`MessageStore`], [`Membership`] and [`Identity`];
//! [`SqliteStore`] implements all three on top of one pool, along with the
//! conversation bookkeeping used by the REST routes.

use async_trait::async_trait;
use serde::Serialize;
use sqlx::SqlitePool;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::warn;
use uuid::Uuid;

use crate::{chat::{RoomId, UserId}, error::StoreError};

/// A persisted message. Never mutated once returned by [`MessageStore::append`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub message_id: Uuid,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    pub room_id: RoomId,
    pub is_group: bool,
    pub name: Option<String>,
    pub creator_id: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Participant {
    pub id: Uuid,
    pub room_id: RoomId,
    pub user_id: UserId,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Assigns `message_id` and `sent_at`.
    async fn append(&self, room_id: RoomId, sender_id: UserId, content: &str) -> Result<ChatMessage, StoreError>;

    /// Oldest first; empty for unknown rooms. Appends to one room are
    /// sequenced by the hub, so insertion order is also `sent_at` order.
    async fn list_ordered(&self, room_id: RoomId) -> Result<Vec<ChatMessage>, StoreError>;
}

#[async_trait]
pub trait Membership: Send + Sync {
    async fn is_participant(&self, room_id: RoomId, user_id: UserId) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait Identity: Send + Sync {
    /// Never fails: unknown users get a synthesized label.
    async fn display_name(&self, user_id: UserId) -> String;
}

pub fn placeholder_name(user_id: UserId) -> String {
    format!("User-{user_id}")
}

#[derive(Clone)]
pub struct SqliteStore {
    db_pool: SqlitePool,
}

type MessageRow = (String, String, i64, String, String);

fn message_from_row((message_id, room_id, sender_id, content, sent_at): MessageRow) -> Result<ChatMessage, StoreError> {
    Ok(ChatMessage {
        message_id: Uuid::parse_str(&message_id)?,
        room_id: Uuid::parse_str(&room_id)?,
        sender_id,
        content,
        sent_at: OffsetDateTime::parse(&sent_at, &Rfc3339)?,
    })
}

fn now_text() -> Result<(OffsetDateTime, String), StoreError> {
    let now = OffsetDateTime::now_utc();
    let text = now.format(&Rfc3339).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Ok((now, text))
}

impl SqliteStore {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }

    pub async fn upsert_user(&self, user_id: UserId, name: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO users (id,name) VALUES (?,?) ON CONFLICT(id) DO UPDATE SET name=excluded.name")
            .bind(user_id)
            .bind(name)
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }

    /// Creates the room and makes its creator the first participant.
    pub async fn create_conversation(&self, creator_id: UserId, name: Option<&str>, is_group: bool) -> Result<Conversation, StoreError> {
        let room_id = Uuid::now_v7();
        let (created_at, created_text) = now_text()?;

        let mut tx = self.db_pool.begin().await?;
        sqlx::query("INSERT INTO conversations (room_id,is_group,name,creator_id,created_at) VALUES (?,?,?,?,?)")
            .bind(room_id.to_string())
            .bind(is_group)
            .bind(name)
            .bind(creator_id)
            .bind(&created_text)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO conversation_participants (id,room_id,user_id) VALUES (?,?,?)")
            .bind(Uuid::now_v7().to_string())
            .bind(room_id.to_string())
            .bind(creator_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Conversation {
            room_id,
            is_group,
            name: name.map(str::to_owned),
            creator_id,
            created_at,
        })
    }

    pub async fn conversation_exists(&self, room_id: RoomId) -> Result<bool, StoreError> {
        Ok(sqlx::query_as::<_, (i64,)>("SELECT 1 FROM conversations WHERE room_id=?")
            .bind(room_id.to_string())
            .fetch_optional(&self.db_pool)
            .await?
            .is_some())
    }

    pub async fn conversations_created_by(&self, creator_id: UserId) -> Result<Vec<Conversation>, StoreError> {
        let rows: Vec<(String, bool, Option<String>, i64, String)> =
            sqlx::query_as("SELECT room_id,is_group,name,creator_id,created_at FROM conversations WHERE creator_id=? ORDER BY rowid")
                .bind(creator_id)
                .fetch_all(&self.db_pool)
                .await?;

        rows.into_iter()
            .map(|(room_id, is_group, name, creator_id, created_at)| {
                Ok::<_, StoreError>(Conversation {
                    room_id: Uuid::parse_str(&room_id)?,
                    is_group,
                    name,
                    creator_id,
                    created_at: OffsetDateTime::parse(&created_at, &Rfc3339)?,
                })
            })
            .collect()
    }

    /// Idempotent: an existing participant is returned unchanged.
    pub async fn add_participant(&self, room_id: RoomId, user_id: UserId) -> Result<Participant, StoreError> {
        sqlx::query("INSERT INTO conversation_participants (id,room_id,user_id) VALUES (?,?,?) ON CONFLICT(room_id,user_id) DO NOTHING")
            .bind(Uuid::now_v7().to_string())
            .bind(room_id.to_string())
            .bind(user_id)
            .execute(&self.db_pool)
            .await?;

        self.participant(room_id, user_id)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("participant {user_id} vanished from {room_id}")))
    }

    pub async fn participant(&self, room_id: RoomId, user_id: UserId) -> Result<Option<Participant>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT id FROM conversation_participants WHERE room_id=? AND user_id=?")
            .bind(room_id.to_string())
            .bind(user_id)
            .fetch_optional(&self.db_pool)
            .await?;

        row.map(|(id,)| Ok::<_, StoreError>(Participant { id: Uuid::parse_str(&id)?, room_id, user_id }))
            .transpose()
    }

    pub async fn participants(&self, room_id: RoomId) -> Result<Vec<Participant>, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as("SELECT id,user_id FROM conversation_participants WHERE room_id=? ORDER BY user_id")
            .bind(room_id.to_string())
            .fetch_all(&self.db_pool)
            .await?;

        rows.into_iter()
            .map(|(id, user_id)| Ok::<_, StoreError>(Participant { id: Uuid::parse_str(&id)?, room_id, user_id }))
            .collect()
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn append(&self, room_id: RoomId, sender_id: UserId, content: &str) -> Result<ChatMessage, StoreError> {
        let message_id = Uuid::now_v7();
        let (sent_at, sent_text) = now_text()?;

        sqlx::query("INSERT INTO messages (message_id,room_id,sender_id,content,sent_at) VALUES (?,?,?,?,?)")
            .bind(message_id.to_string())
            .bind(room_id.to_string())
            .bind(sender_id)
            .bind(content)
            .bind(&sent_text)
            .execute(&self.db_pool)
            .await?;

        Ok(ChatMessage {
            message_id,
            room_id,
            sender_id,
            content: content.to_owned(),
            sent_at,
        })
    }

    async fn list_ordered(&self, room_id: RoomId) -> Result<Vec<ChatMessage>, StoreError> {
        let rows: Vec<MessageRow> =
            sqlx::query_as("SELECT message_id,room_id,sender_id,content,sent_at FROM messages WHERE room_id=? ORDER BY seq")
                .bind(room_id.to_string())
                .fetch_all(&self.db_pool)
                .await?;

        rows.into_iter().map(message_from_row).collect()
    }
}

#[async_trait]
impl Membership for SqliteStore {
    async fn is_participant(&self, room_id: RoomId, user_id: UserId) -> Result<bool, StoreError> {
        Ok(self.participant(room_id, user_id).await?.is_some())
    }
}

#[async_trait]
impl Identity for SqliteStore {
    async fn display_name(&self, user_id: UserId) -> String {
        let found: Result<Option<(String,)>, sqlx::Error> = sqlx::query_as("SELECT name FROM users WHERE id=?")
            .bind(user_id)
            .fetch_optional(&self.db_pool)
            .await;

        match found {
            Ok(Some((name,))) => name,
            Ok(None) => placeholder_name(user_id),
            Err(e) => {
                warn!(user_id, error = %e, "display name lookup failed");
                placeholder_name(user_id)
            }
        }
    }
}
