// =============================================================================
// WebSocket Handler — scan subscription streams
// =============================================================================
//
// Clients connect to `/api/v1/scans/:id/stream?token=<token>` and receive:
//   1. The current result set as a synthetic "added" burst.
//   2. Live per-tick diffs (result / status / error / metrics frames), each
//      stamped with an ISO-8601 timestamp.
//
// Client messages: `{"type":"subscribe","events":[...]}` narrows the event
// filter, `{"type":"unsubscribe"}` detaches, `{"type":"ping"}` is answered
// with a pong frame. A malformed message is a protocol violation: the client
// gets one error frame and the socket closes.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::auth::validate_token;
use crate::api::ApiState;
use crate::engine::broadcast::{error_frame, metrics_frame, EventKind, OutboundFrame};
use crate::error::ScanError;

// =============================================================================
// Client messages
// =============================================================================

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientFrame {
    Subscribe {
        #[serde(default)]
        events: Vec<EventKind>,
    },
    Unsubscribe,
    Ping,
}

fn pong_json() -> String {
    serde_json::json!({
        "type": "pong",
        "timestamp": Utc::now().to_rfc3339(),
    })
    .to_string()
}

// =============================================================================
// Upgrade handler
// =============================================================================

/// Axum handler for the subscription stream upgrade. Validates the token and
/// the connection cap before upgrading, and attaches the subscriber to the
/// scan so the snapshot burst is queued before any live tick can land.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
    Path(scan_id): Path<Uuid>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!(scan_id = %scan_id, "stream rejected: invalid token");
        return (axum::http::StatusCode::FORBIDDEN, "Invalid or missing token").into_response();
    }

    let max_connections = state.engine_config().websocket.max_connections;
    let connections = state.engine.ws_connections.fetch_add(1, Ordering::SeqCst) + 1;
    if connections > max_connections {
        state.engine.ws_connections.fetch_sub(1, Ordering::SeqCst);
        warn!(connections, max_connections, "stream rejected: connection cap");
        return crate::api::rest::error_response(&ScanError::Overload(format!(
            "websocket connection limit reached ({max_connections})"
        )))
        .into_response();
    }

    let Some((sub_id, rx)) = state.engine.subscribe(scan_id) else {
        state.engine.ws_connections.fetch_sub(1, Ordering::SeqCst);
        return (axum::http::StatusCode::NOT_FOUND, "Unknown scan").into_response();
    };

    info!(scan_id = %scan_id, subscriber = %sub_id, "stream accepted — upgrading");
    ws.on_upgrade(move |socket| handle_stream(socket, state, scan_id, sub_id, rx))
        .into_response()
}

// =============================================================================
// Connection loop
// =============================================================================

/// Runs one subscription stream: forwards queued frames, answers pings, and
/// processes client messages, via `tokio::select!` over the three sources.
async fn handle_stream(
    socket: WebSocket,
    state: Arc<ApiState>,
    scan_id: Uuid,
    sub_id: Uuid,
    mut rx: tokio::sync::mpsc::Receiver<OutboundFrame>,
) {
    let (mut sender, mut receiver) = socket.split();
    let mut ping_interval = interval(Duration::from_secs(
        state.engine_config().websocket.ping_interval_secs.max(1),
    ));
    // The first tick of a tokio interval fires immediately; skip it.
    ping_interval.tick().await;

    loop {
        tokio::select! {
            // ── Engine frames ───────────────────────────────────────────
            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(e) = sender.send(Message::Text(frame.json.to_string())).await {
                            debug!(subscriber = %sub_id, error = %e, "stream send failed — disconnecting");
                            break;
                        }
                    }
                    None => {
                        // The engine dropped this subscriber (slow consumer).
                        let err = error_frame(
                            "overload",
                            "subscriber queue overflowed — disconnected",
                        );
                        let _ = sender.send(Message::Text(err.json.to_string())).await;
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            // ── Keepalive pings ─────────────────────────────────────────
            _ = ping_interval.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    debug!(subscriber = %sub_id, "ping failed — disconnecting");
                    break;
                }
            }

            // ── Client messages ─────────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match handle_client_frame(&state, scan_id, sub_id, &text) {
                            ClientAction::Continue => {}
                            ClientAction::Pong => {
                                if sender.send(Message::Text(pong_json())).await.is_err() {
                                    break;
                                }
                            }
                            ClientAction::SendMetrics => {
                                let frame = metrics_frame(state.engine.engine_stats());
                                if sender.send(Message::Text(frame.json.to_string())).await.is_err() {
                                    break;
                                }
                            }
                            ClientAction::Close => break,
                            ClientAction::Protocol(e) => {
                                warn!(subscriber = %sub_id, error = %e, "protocol violation — disconnecting");
                                let err = error_frame(e.kind(), &e.to_string());
                                let _ = sender.send(Message::Text(err.json.to_string())).await;
                                let _ = sender.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        debug!(subscriber = %sub_id, "pong received");
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(subscriber = %sub_id, "close frame received");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!(subscriber = %sub_id, "binary message ignored");
                    }
                    Some(Err(e)) => {
                        debug!(subscriber = %sub_id, error = %e, "receive error — disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    state.engine.unsubscribe(scan_id, sub_id);
    state.engine.ws_connections.fetch_sub(1, Ordering::SeqCst);
    info!(scan_id = %scan_id, subscriber = %sub_id, "stream closed — cleanup complete");
}

enum ClientAction {
    Continue,
    Pong,
    SendMetrics,
    Close,
    Protocol(ScanError),
}

fn handle_client_frame(
    state: &Arc<ApiState>,
    scan_id: Uuid,
    sub_id: Uuid,
    text: &str,
) -> ClientAction {
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(ClientFrame::Subscribe { events }) => {
            let set: HashSet<EventKind> = if events.is_empty() {
                EventKind::all()
            } else {
                events.into_iter().collect()
            };
            let wants_metrics = set.contains(&EventKind::Metrics);
            debug!(subscriber = %sub_id, events = set.len(), "event filter updated");
            state.engine.set_subscriber_events(scan_id, sub_id, set);
            if wants_metrics {
                ClientAction::SendMetrics
            } else {
                ClientAction::Continue
            }
        }
        Ok(ClientFrame::Unsubscribe) => ClientAction::Close,
        Ok(ClientFrame::Ping) => ClientAction::Pong,
        Err(e) => {
            ClientAction::Protocol(ScanError::Protocol(format!("malformed client message: {e}")))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_parse() {
        let f: ClientFrame =
            serde_json::from_str(r#"{"type":"subscribe","events":["result","status"]}"#).unwrap();
        assert!(matches!(f, ClientFrame::Subscribe { ref events } if events.len() == 2));

        let f: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(f, ClientFrame::Ping));

        let f: ClientFrame = serde_json::from_str(r#"{"type":"unsubscribe"}"#).unwrap();
        assert!(matches!(f, ClientFrame::Unsubscribe));

        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"order"}"#).is_err());
    }

    #[test]
    fn pong_carries_timestamp() {
        let parsed: serde_json::Value = serde_json::from_str(&pong_json()).unwrap();
        assert_eq!(parsed["type"], "pong");
        assert!(parsed["timestamp"].as_str().unwrap().contains('T'));
    }
}
