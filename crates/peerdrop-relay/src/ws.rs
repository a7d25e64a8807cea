//! Per-connection WebSocket handling
//!
//! One reader loop per connection, one spawned writer task fed by that
//! endpoint's mpsc queue. Envelopes from a single endpoint are processed in
//! arrival order and every recipient has a FIFO queue, so the relay hop
//! never reorders a sender's envelopes. A malformed envelope is logged and
//! ignored: nothing a client sends can take the relay down or disturb other
//! connections.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use peerdrop_core::ClientMessage;

use crate::state::RelayState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let id = Uuid::new_v4().to_string();
    debug!("endpoint {} connected", id);

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel(64);
    state.attach(&id, tx).await;

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(_) => continue,
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => state.handle_message(&id, msg).await,
                Err(err) => warn!("ignoring malformed envelope from {}: {}", id, err),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!("socket error from {}: {}", id, err);
                break;
            }
        }
    }

    debug!("endpoint {} disconnected", id);
    state.disconnect(&id).await;
    let _ = writer.await;
}
