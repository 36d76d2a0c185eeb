//! WebSocket endpoint carrying the control protocol.

use crate::ops::{self, Reply, Request};
use crate::state::AppState;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    while let Some(msg) = socket.recv().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(_) => break,
        };

        match msg {
            Message::Text(text) => {
                debug!(request = %text, "Control request");
                match serde_json::from_str::<Request>(&text) {
                    Ok(request) => {
                        // One in-flight request per connection;
                        // frames are forwarded as the op produces them.
                        let (tx, mut rx) = mpsc::channel::<Reply>(64);
                        let op_state = state.clone();
                        tokio::spawn(async move {
                            ops::handle(op_state, request, tx).await;
                        });
                        while let Some(reply) = rx.recv().await {
                            let frame = serde_json::to_string(&reply).unwrap();
                            if socket.send(Message::Text(frame.into())).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        let reply = Reply::error(format!("Invalid message: {}", err));
                        let frame = serde_json::to_string(&reply).unwrap();
                        if socket.send(Message::Text(frame.into())).await.is_err() {
                            return;
                        }
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}
