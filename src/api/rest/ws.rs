use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::SinkExt;
use futures::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use crate::state::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut positions = BroadcastStream::new(state.live_tx.subscribe());

    info!("live position viewer connected");

    let send_task = tokio::spawn(async move {
        while let Some(next) = positions.next().await {
            let position = match next {
                Ok(position) => position,
                Err(err) => {
                    warn!(error = %err, "live viewer lagging; positions skipped");
                    continue;
                }
            };

            let json = match serde_json::to_string(&position) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize live position for ws");
                    continue;
                }
            };

            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    info!("live position viewer disconnected");
}
