mod room;
mod msg;
mod new;
mod ws;

use axum::{routing::{get, post}, Router};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws/{room_id}/{user_id}", get(ws::room_ws))
        .route("/users/{user_id}/chats", get(new::list_chats).post(new::new_chat))
        .route("/users/{user_id}/chats/{room_id}", get(room::participant))
        .route("/users/{user_id}/chats/{room_id}/messages", post(msg::send_message))
        .route("/rooms/{room_id}/messages", get(msg::history))
        .route("/rooms/{room_id}/participants", get(room::participants).post(room::join))
}
