use axum::{debug_handler, extract::{Path, State}, http::StatusCode, response::{IntoResponse, Response}, Json};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::{chat::UserId, store::SqliteStore, AppResult};

#[derive(Debug, Deserialize)]
pub(crate) struct NewChatQuery {
    name: Option<String>,
    #[serde(default)]
    is_group: bool,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn new_chat(
    State(store): State<SqliteStore>,
    Path(user_id): Path<UserId>,

    Json(NewChatQuery { name, is_group }): Json<NewChatQuery>,
) -> AppResult<Response> {
    let chat = store.create_conversation(user_id, name.as_deref(), is_group).await?;
    info!(room_id = %chat.room_id, creator_id = user_id, is_group, "chat created");

    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "Chat created successfully", "chat_id": chat.room_id })),
    ).into_response())
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn list_chats(
    State(store): State<SqliteStore>,
    Path(user_id): Path<UserId>,
) -> AppResult<Response> {
    Ok(Json(store.conversations_created_by(user_id).await?).into_response())
}
