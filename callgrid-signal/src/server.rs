//! axum WebSocket endpoint carrying the signaling RPC exchange.
//!
//! One socket per user. Inbound text frames are decoded into requests and
//! each runs as an independent task; outbound frames (responses and events)
//! funnel through a per-connection channel drained by a writer task. Socket
//! teardown triggers the same cleanup as an explicit leave for every room
//! the connection joined.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use callgrid_core::config::SignalConfig;
use callgrid_core::error::Result;
use callgrid_core::types::UserId;

use crate::gateway::SessionGateway;
use crate::presence::{ConnectionHandle, PresenceTracker};
use crate::protocol::{OutboundFrame, RequestFrame, ResponseFrame};

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<SessionGateway>,
    pub presence: Arc<PresenceTracker>,
    pub rpc_timeout: Duration,
}

impl AppState {
    /// Wire the gateway and presence together and start the presence
    /// heartbeat.
    #[must_use]
    pub fn new(
        gateway: Arc<SessionGateway>,
        presence: Arc<PresenceTracker>,
        config: &SignalConfig,
    ) -> Self {
        presence.spawn_heartbeat(Duration::from_secs(config.presence_heartbeat_seconds));
        Self {
            gateway,
            presence,
            rpc_timeout: Duration::from_secs(config.rpc_timeout_seconds),
        }
    }
}

/// The user identity arrives from the excluded auth layer at connection
/// time; the query parameter is its stand-in interface.
#[derive(Debug, Deserialize)]
struct WsQuery {
    user_id: String,
}

/// Signaling routes, for mounting into the embedding application's router.
pub fn router(state: AppState) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, UserId::from(query.user_id), socket))
}

async fn handle_socket(state: AppState, user_id: UserId, socket: WebSocket) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundFrame>();

    // Writer task: drains outbound frames into the socket.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    state.presence.set_online(
        user_id.clone(),
        ConnectionHandle::new(connection_id.clone(), tx.clone()),
    );
    info!(connection_id = %connection_id, user_id = %user_id, "signaling connection established");

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match decode_request(&text) {
                Ok(frame) => spawn_request(&state, &connection_id, &tx, frame),
                Err(Some(id)) => {
                    let _ = tx.send(OutboundFrame::Response(ResponseFrame::err(
                        id,
                        "malformed request",
                    )));
                }
                Err(None) => {
                    warn!(connection_id = %connection_id, "undecodable frame dropped");
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            // Ping/pong are handled by axum; binary is not part of the
            // protocol.
            Ok(_) => {}
        }
    }

    state.gateway.disconnect(&connection_id).await;
    writer.abort();
    info!(connection_id = %connection_id, user_id = %user_id, "signaling connection closed");
}

/// Decode a request frame. On failure, recover the `id` when present so the
/// caller still receives its correlated error response.
fn decode_request(text: &str) -> std::result::Result<RequestFrame, Option<u64>> {
    serde_json::from_str::<RequestFrame>(text).map_err(|_| {
        serde_json::from_str::<Value>(text)
            .ok()
            .and_then(|value| value.get("id").and_then(Value::as_u64))
    })
}

/// Run the request as its own task so one room's slow engine call never
/// stalls another connection's requests.
fn spawn_request(
    state: &AppState,
    connection_id: &str,
    tx: &mpsc::UnboundedSender<OutboundFrame>,
    frame: RequestFrame,
) {
    let gateway = Arc::clone(&state.gateway);
    let rpc_timeout = state.rpc_timeout;
    let connection_id = connection_id.to_string();
    let tx = tx.clone();
    tokio::spawn(async move {
        let RequestFrame { id, request } = frame;
        let operation = async move { gateway.handle(&connection_id, request).await };
        let response = answer_with_timeout(id, rpc_timeout, operation).await;
        let _ = tx.send(OutboundFrame::Response(response));
    });
}

/// Answer within the timeout. The operation keeps running in its own task
/// either way: an engine call completing after the caller gave up must
/// still update registry state, and idempotent teardown makes that safe.
async fn answer_with_timeout<F>(id: u64, timeout: Duration, operation: F) -> ResponseFrame
where
    F: Future<Output = Result<Value>> + Send + 'static,
{
    let handle = tokio::spawn(operation);
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(Ok(data))) => ResponseFrame::ok(id, data),
        Ok(Ok(Err(error))) => {
            debug!(error = %error, "request answered with error");
            ResponseFrame::err(id, error.to_string())
        }
        Ok(Err(join_error)) => {
            warn!(error = %join_error, "request handler failed");
            ResponseFrame::err(id, "request handler failed")
        }
        Err(_) => ResponseFrame::err(id, "request timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_decode_request_roundtrip() {
        let frame = decode_request(
            r#"{"id": 1, "method": "getProducers", "params": {"roomId": "r1", "peerId": "alice"}}"#,
        )
        .expect("decode");
        assert_eq!(frame.id, 1);
    }

    #[test]
    fn test_decode_malformed_recovers_id() {
        // Unknown method, but the id is recoverable for the error response.
        let err = decode_request(r#"{"id": 9, "method": "warpDrive", "params": {}}"#)
            .expect_err("must fail");
        assert_eq!(err, Some(9));

        let err = decode_request("not json").expect_err("must fail");
        assert_eq!(err, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_answers_while_operation_completes() {
        let completed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&completed);
        let response = answer_with_timeout(5, Duration::from_secs(1), async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            flag.store(true, Ordering::Release);
            Ok(json!({"late": true}))
        })
        .await;

        assert_eq!(response.id, 5);
        assert_eq!(response.error.as_deref(), Some("request timed out"));
        assert!(!completed.load(Ordering::Acquire));

        // The detached operation still finishes and mutates state.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(completed.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_fast_operation_answers_with_data() {
        let response =
            answer_with_timeout(2, Duration::from_secs(1), async { Ok(json!({"x": 1})) }).await;
        assert_eq!(response.data, Some(json!({"x": 1})));
        assert!(response.error.is_none());
    }
}
