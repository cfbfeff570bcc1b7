use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::api::rest::identity::Caller;
use crate::api::rest::ws::Subscription;
use crate::error::AppError;
use crate::state::AppState;

/// Server-sent events carrying the caller's notifications, one JSON object
/// per event, named after the notification kind.
pub async fn sse_handler(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Query(subscription): Query<Subscription>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let user_id = subscription.receiver_for(&caller)?;
    info!(user_id = %user_id, "sse client connected");

    let stream = BroadcastStream::new(state.events_tx.subscribe()).filter_map(move |item| {
        let notification = match item {
            Ok(notification) if notification.receiver_id == user_id => notification,
            Ok(_) => return None,
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "sse subscriber lagged");
                return None;
            }
        };

        let kind = serde_json::to_value(notification.kind)
            .ok()
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_else(|| "notification".to_string());

        match Event::default().event(kind).json_data(&notification) {
            Ok(event) => Some(Ok(event)),
            Err(err) => {
                warn!(error = %err, "failed to serialize notification for sse");
                None
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
