use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::SinkExt;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::rest::identity::Caller;
use crate::error::AppError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct Subscription {
    pub user_id: Option<Uuid>,
}

impl Subscription {
    /// Streams carry one-time codes, so nobody (admins included) may listen
    /// on another user's behalf.
    pub fn receiver_for(&self, caller: &Caller) -> Result<Uuid, AppError> {
        match self.user_id {
            Some(user_id) if user_id != caller.id => Err(AppError::Forbidden(
                "cannot subscribe to another user's notifications".to_string(),
            )),
            _ => Ok(caller.id),
        }
    }
}

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    ws: WebSocketUpgrade,
    Query(subscription): Query<Subscription>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = subscription.receiver_for(&caller)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user_id)))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user_id: Uuid) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.events_tx.subscribe();

    info!(user_id = %user_id, "websocket client connected");

    let send_task = tokio::spawn(async move {
        loop {
            let notification = match rx.recv().await {
                Ok(notification) => notification,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(user_id = %user_id, skipped, "websocket subscriber lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if notification.receiver_id != user_id {
                continue;
            }

            let json = match serde_json::to_string(&notification) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize notification for ws");
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

    info!(user_id = %user_id, "websocket client disconnected");
}
