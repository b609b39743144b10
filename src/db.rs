use std::str::FromStr;

use sqlx::{SqlitePool, sqlite::{SqliteConnectOptions, SqlitePoolOptions}};
use tracing::info;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS conversations (
        room_id TEXT PRIMARY KEY,
        is_group INTEGER NOT NULL DEFAULT 0,
        name TEXT,
        creator_id INTEGER NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS conversation_participants (
        id TEXT PRIMARY KEY,
        room_id TEXT NOT NULL REFERENCES conversations(room_id) ON DELETE CASCADE,
        user_id INTEGER NOT NULL,
        UNIQUE (room_id, user_id)
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        message_id TEXT NOT NULL UNIQUE,
        room_id TEXT NOT NULL REFERENCES conversations(room_id) ON DELETE CASCADE,
        sender_id INTEGER NOT NULL,
        content TEXT NOT NULL,
        sent_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS messages_by_room ON messages (room_id, seq)",
];

pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?.foreign_keys(true);
    let db_pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    migrate(&db_pool).await?;
    info!(database_url, "database ready");
    Ok(db_pool)
}

pub async fn migrate(db_pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(db_pool).await?;
    }
    Ok(())
}

/// Single-connection in-memory database for tests.
#[cfg(test)]
pub(crate) async fn memory() -> SqlitePool {
    let db_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    migrate(&db_pool).await.unwrap();
    db_pool
}
