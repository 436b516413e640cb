//! Streams every published `ProgressUpdate` to a connected websocket client
//! as JSON, one frame per bus sample, until the client disconnects or the
//! bus unsubscribes it.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;

use crate::api::ApiState;

pub async fn handler(ws: WebSocketUpgrade, State(state): State<Arc<ApiState>>) -> Response {
    ws.on_upgrade(move |socket| stream_progress(socket, state))
}

async fn stream_progress(mut socket: WebSocket, state: Arc<ApiState>) {
    let bus = state.scheduler.bus().clone();
    let subscription = bus.subscribe().await;

    loop {
        tokio::select! {
            update = subscription.recv() => {
                let Some(update) = update else { break };
                let payload = match serde_json::to_string(&update) {
                    Ok(payload) => payload,
                    Err(_) => continue,
                };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    subscription.unsubscribe();
}
