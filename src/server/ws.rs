use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::api::SharedState;
use crate::events::{ExecutionUpdate, Subscription};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Only forward updates of this Execution
    pub execution_id: Option<Uuid>,
}

/// `GET /ws[?execution_id=...]`: live feed of execution updates as JSON text frames.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    let subscription = state.engine.subscribe(params.execution_id);
    ws.on_upgrade(move |socket| handle_socket(socket, subscription))
}

async fn handle_socket(socket: WebSocket, subscription: Subscription) {
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, subscription).await;
    debug!("websocket closed");
}

pub fn encode_update(update: &ExecutionUpdate) -> Option<String> {
    match serde_json::to_string(update) {
        Ok(json) => Some(json),
        Err(e) => {
            warn!(error = %e, "Failed to serialize execution update");
            None
        }
    }
}

/// Forward updates and keep the connection alive with ping/pong.
///
/// If no Pong arrives within [`PONG_TIMEOUT`] after a Ping, the connection
/// is considered dead and the loop exits.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut subscription: Subscription,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            update = subscription.next() => {
                let Some(update) = update else { break };
                let Some(json) = encode_update(&update) else { continue };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ExecutionEvent;
    use crate::model::ExecutionStatus;
    use chrono::Utc;

    #[test]
    fn test_update_wire_format() {
        let update = ExecutionUpdate {
            execution_id: Uuid::nil(),
            seq: 3,
            timestamp: Utc::now(),
            event: ExecutionEvent::StatusChanged {
                from: ExecutionStatus::Running,
                to: ExecutionStatus::Paused,
            },
        };
        let json: serde_json::Value =
            serde_json::from_str(&encode_update(&update).unwrap()).unwrap();
        assert_eq!(json["type"], "status_changed");
        assert_eq!(json["seq"], 3);
        assert_eq!(json["from"], "running");
        assert_eq!(json["to"], "paused");
    }

    #[test]
    fn test_params_filter_is_optional() {
        let params: WsParams = serde_json::from_str("{}").unwrap();
        assert!(params.execution_id.is_none());
    }
}
