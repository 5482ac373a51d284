// Realtime WebSocket endpoint.
//
// Route:
//   GET /v1/realtime?vsn=scrumflow-realtime.v1
//
// Each socket becomes one hub connection. Inbound frames manage topic
// membership, broadcasts and presence; everything the hub queues for the
// connection is written back out.

pub mod protocol;
pub mod row_changes;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{
            close_code, rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket,
            WebSocketUpgrade,
        },
        Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use scrumflow_common::protocol::realtime::{decode_message, RealtimeMessage, MAX_FRAME_BYTES};
use scrumflow_common::realtime::{ConnectionId, RealtimeHub};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use self::protocol::{require_supported, send_ws_message};
use crate::error::{current_request_id, request_id_from_headers_or_generate, with_request_id_scope};
use crate::metrics::RelayMetrics;

pub const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
const MAX_TOPIC_BYTES: usize = 255;

pub const INVALID_FRAME: &str = "REALTIME_INVALID_FRAME";
pub const INVALID_TOPIC: &str = "REALTIME_INVALID_TOPIC";
pub const NOT_JOINED: &str = "REALTIME_NOT_JOINED";
pub const UNSUPPORTED_FRAME: &str = "REALTIME_UNSUPPORTED_FRAME";

#[derive(Clone)]
struct RealtimeState {
    hub: RealtimeHub,
    metrics: Arc<RelayMetrics>,
}

#[derive(Debug, Deserialize)]
struct UpgradeQuery {
    vsn: Option<String>,
}

pub fn router(hub: RealtimeHub, metrics: Arc<RelayMetrics>) -> Router {
    Router::new().route("/v1/realtime", get(ws_upgrade)).with_state(RealtimeState { hub, metrics })
}

async fn ws_upgrade(
    State(state): State<RealtimeState>,
    Query(query): Query<UpgradeQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> impl IntoResponse {
    if let Err(upgrade_error) = require_supported(query.vsn.as_deref()) {
        return upgrade_error.into_response();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let RealtimeState { hub, metrics } = state;
    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_frame_size(MAX_FRAME_BYTES)
        .max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| async move {
            with_request_id_scope(request_id, handle_socket(hub, metrics, socket)).await;
        })
        .into_response()
}

fn frame_size_exceeded_reason() -> String {
    format!("websocket frame exceeds maximum size of {MAX_FRAME_BYTES} bytes")
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

async fn close_frame_too_large(socket: &mut WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::SIZE,
            reason: frame_size_exceeded_reason().into(),
        })))
        .await;
}

async fn handle_socket(hub: RealtimeHub, metrics: Arc<RelayMetrics>, mut socket: WebSocket) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());
    let (connection_id, mut outbound_receiver) = hub.connect().await;
    metrics.realtime_connection_opened();
    info!(connection_id = %connection_id, request_id = %request_id, "realtime connection opened");

    // Ping every interval; a peer that has not ponged within one interval
    // plus the timeout is considered gone.
    let mut heartbeat_interval = tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat_interval.reset();
    let mut last_pong = Instant::now();
    let pong_deadline = Duration::from_millis(HEARTBEAT_INTERVAL_MS + HEARTBEAT_TIMEOUT_MS);

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_pong.elapsed() > pong_deadline {
                    warn!(
                        connection_id = %connection_id,
                        request_id = %request_id,
                        "heartbeat timeout, disconnecting"
                    );
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(outbound_message) => {
                        if send_ws_message(&mut socket, &outbound_message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        if raw_message.len() > MAX_FRAME_BYTES {
                            close_frame_too_large(&mut socket).await;
                            break;
                        }

                        let inbound = match decode_message(&raw_message) {
                            Ok(message) => message,
                            Err(error) => {
                                metrics.record_realtime_frame("invalid", true);
                                debug!(connection_id = %connection_id, error = %error, "undecodable realtime frame");
                                let reply = RealtimeMessage::error(
                                    INVALID_FRAME,
                                    "invalid realtime frame payload",
                                    None,
                                );
                                if send_ws_message(&mut socket, &reply).await.is_err() {
                                    break;
                                }
                                continue;
                            }
                        };

                        let kind = inbound.kind();
                        match apply_client_message(&hub, connection_id, inbound).await {
                            Ok(()) => metrics.record_realtime_frame(kind, false),
                            Err(reply) => {
                                metrics.record_realtime_frame(kind, true);
                                if send_ws_message(&mut socket, &reply).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Ok(Message::Binary(_)) => {
                        metrics.record_realtime_frame("binary", true);
                        let reply = RealtimeMessage::error(
                            UNSUPPORTED_FRAME,
                            "binary frames are not supported",
                            None,
                        );
                        if send_ws_message(&mut socket, &reply).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Err(error) => {
                        if is_frame_size_violation(&error) {
                            close_frame_too_large(&mut socket).await;
                        }
                        break;
                    }
                }
            }
        }
    }

    hub.disconnect(connection_id).await;
    metrics.realtime_connection_closed();
    info!(connection_id = %connection_id, request_id = %request_id, "realtime connection closed");
}

/// Apply one client frame to the hub. `Err` carries the error frame to send
/// back to this connection.
pub async fn apply_client_message(
    hub: &RealtimeHub,
    connection_id: ConnectionId,
    message: RealtimeMessage,
) -> Result<(), RealtimeMessage> {
    match message {
        RealtimeMessage::Join { topic, bindings } => {
            validate_topic(&topic)?;
            hub.join(connection_id, &topic, bindings).await;
            Ok(())
        }
        RealtimeMessage::Leave { topic } => {
            hub.leave(connection_id, &topic).await;
            Ok(())
        }
        RealtimeMessage::Broadcast { topic, event } => {
            if !hub.is_member(connection_id, &topic).await {
                return Err(not_joined(topic));
            }
            hub.broadcast(Some(connection_id), &topic, event).await;
            Ok(())
        }
        RealtimeMessage::Track { topic, presence } => {
            if hub.track(connection_id, &topic, presence).await {
                Ok(())
            } else {
                Err(not_joined(topic))
            }
        }
        RealtimeMessage::Untrack { topic } => {
            hub.untrack(connection_id, &topic).await;
            Ok(())
        }
        other => Err(RealtimeMessage::error(
            UNSUPPORTED_FRAME,
            format!("`{}` frames are sent by the server only", other.kind()),
            None,
        )),
    }
}

fn validate_topic(topic: &str) -> Result<(), RealtimeMessage> {
    if topic.trim().is_empty() || topic.len() > MAX_TOPIC_BYTES {
        return Err(RealtimeMessage::error(
            INVALID_TOPIC,
            format!("topic must be 1-{MAX_TOPIC_BYTES} bytes"),
            Some(topic.to_string()),
        ));
    }
    Ok(())
}

fn not_joined(topic: String) -> RealtimeMessage {
    RealtimeMessage::error(NOT_JOINED, "join the topic before sending on it", Some(topic))
}
