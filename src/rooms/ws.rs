use std::{sync::Arc, time::Duration};

use axum::{debug_handler, extract::{ws::{Message, WebSocket}, Path, State, WebSocketUpgrade}, response::{IntoResponse, Response}};
use futures_util::{future, SinkExt, StreamExt};
use tracing::warn;

use crate::{chat::{ChatHub, ChatSession, Outbox, RoomId, UserId}, AppResult};

/// How long the writer may keep flushing after its session has closed.
const WRITER_GRACE: Duration = Duration::from_secs(5);

/// Non-participants get a 403 and no socket.
#[debug_handler(state = crate::AppState)]
pub async fn room_ws(
    Path((room_id, user_id)): Path<(RoomId, UserId)>,
    State(hub): State<Arc<ChatHub>>,

    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let (session, outbox) = ChatSession::connect(hub, room_id, user_id).await?;

    Ok(ws.on_upgrade(move |stream| serve_socket(stream, session, outbox)).into_response())
}

async fn serve_socket(stream: WebSocket, session: ChatSession, mut outbox: Outbox) {
    let (mut sender, receiver) = stream.split();

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbox.recv().await {
            let text = match serde_json::to_string(&*frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "unencodable frame");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let inbound = receiver
        .take_while(|frame| future::ready(!matches!(frame, Ok(Message::Close(_)))))
        .filter_map(|frame| future::ready(match frame {
            Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        }));

    // Outcome is logged by the session itself.
    let _ = session.run(inbound).await;

    if tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }
}
