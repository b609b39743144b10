use axum::{debug_handler, extract::{Path, State}, response::{IntoResponse, Response}, Json};
use serde::Deserialize;

use crate::{chat::{RoomId, UserId}, error::ChatError, store::SqliteStore, AppResult};

#[derive(Debug, Deserialize)]
pub(crate) struct JoinQuery {
    user_id: UserId,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn participant(
    State(store): State<SqliteStore>,
    Path((user_id, room_id)): Path<(UserId, RoomId)>,
) -> AppResult<Response> {
    let Some(participant) = store.participant(room_id, user_id).await? else {
        return Err(ChatError::NotFound("participant").into());
    };

    Ok(Json(participant).into_response())
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn participants(
    State(store): State<SqliteStore>,
    Path(room_id): Path<RoomId>,
) -> AppResult<Response> {
    if !store.conversation_exists(room_id).await? {
        return Err(ChatError::NotFound("chat").into());
    }

    Ok(Json(store.participants(room_id).await?).into_response())
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn join(
    State(store): State<SqliteStore>,
    Path(room_id): Path<RoomId>,

    Json(JoinQuery { user_id }): Json<JoinQuery>,
) -> AppResult<Response> {
    if !store.conversation_exists(room_id).await? {
        return Err(ChatError::NotFound("chat").into());
    }

    Ok(Json(store.add_participant(room_id, user_id).await?).into_response())
}
