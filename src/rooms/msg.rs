use std::sync::Arc;

use axum::{debug_handler, extract::{Path, Query, State}, response::{IntoResponse, Response}, Json};
use serde::Deserialize;

use crate::{chat::{ChatHub, RoomId, UserId}, AppResult};

#[derive(Deserialize)]
pub(crate) struct SendMessageQuery {
    message: String,
}

#[derive(Deserialize)]
pub(crate) struct HistoryQuery {
    user_id: UserId,
}

/// Same path as a live session: stored first, then fanned out to the room.
#[debug_handler(state = crate::AppState)]
pub(crate) async fn send_message(
    State(hub): State<Arc<ChatHub>>,
    Path((user_id, room_id)): Path<(UserId, RoomId)>,

    Json(SendMessageQuery { message }): Json<SendMessageQuery>,
) -> AppResult<Response> {
    let sender_name = hub.display_name(user_id).await;
    let published = hub.publish(room_id, user_id, &sender_name, &message).await?;

    Ok(Json(published.message).into_response())
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn history(
    State(hub): State<Arc<ChatHub>>,
    Path(room_id): Path<RoomId>,
    Query(HistoryQuery { user_id }): Query<HistoryQuery>,
) -> AppResult<Response> {
    Ok(Json(hub.history(room_id, user_id).await?).into_response())
}
