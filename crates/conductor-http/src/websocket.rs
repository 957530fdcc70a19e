//! WebSocket transport.
//!
//! Clients connect to `/ws`. Each text frame is handed to the
//! [`ConnectionRouter`](conductor_core::ConnectionRouter); frames the engine
//! sends to this client arrive on a channel and are written out by a
//! dedicated task.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::state::HttpState;

/// Handler for GET /ws
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<HttpState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<HttpState>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut outbound) = mpsc::unbounded_channel::<String>();
    let mut conn = state.router.connect(tx);

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => state.router.handle_frame(&mut conn, text.as_str()),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("WebSocket error from client {}: {}", conn.id(), e);
                    break;
                }
            },
            _ = &mut send_task => break,
        }
    }

    state.router.disconnect(conn);
    send_task.abort();
}
