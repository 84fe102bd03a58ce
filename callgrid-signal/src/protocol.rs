//! Wire protocol for the signaling exchange.
//!
//! Every client-initiated frame carries a numeric `id` and receives exactly
//! one correlated response with either `data` or `error`. Server-initiated
//! events carry no `id`. Engine payloads travel as opaque JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use callgrid_core::engine::{MediaKind, TransportDirection};
use callgrid_core::types::{ConsumerId, PeerId, ProducerId, RoomId, TransportId, UserId};

/// One client request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    #[serde(flatten)]
    pub request: ClientRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum ClientRequest {
    #[serde(rename_all = "camelCase")]
    CreateRoom {
        room_id: RoomId,
        caller_id: UserId,
        target_ids: Vec<UserId>,
        #[serde(default)]
        is_video: bool,
        #[serde(default)]
        metadata: Value,
    },
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: RoomId,
        peer_id: PeerId,
        display_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        room_id: RoomId,
        peer_id: PeerId,
        transport_id: TransportId,
        connection_parameters: Value,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        room_id: RoomId,
        peer_id: PeerId,
        transport_id: TransportId,
        kind: MediaKind,
        media_parameters: Value,
    },
    #[serde(rename_all = "camelCase")]
    GetProducers { room_id: RoomId, peer_id: PeerId },
    #[serde(rename_all = "camelCase")]
    Consume {
        room_id: RoomId,
        peer_id: PeerId,
        producer_id: ProducerId,
        receive_capabilities: Value,
    },
    #[serde(rename_all = "camelCase")]
    ResumeConsumer {
        room_id: RoomId,
        peer_id: PeerId,
        consumer_id: ConsumerId,
    },
    #[serde(rename_all = "camelCase")]
    LeaveRoom { room_id: RoomId, peer_id: PeerId },
}

/// One server response frame: exactly one of `data` / `error` is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseFrame {
    #[must_use]
    pub fn ok(id: u64, data: Value) -> Self {
        Self {
            id,
            data: Some(data),
            error: None,
        }
    }

    #[must_use]
    pub fn err(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Server-initiated notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    IncomingCall {
        room_id: RoomId,
        caller_id: UserId,
        is_video: bool,
        participants: Vec<ParticipantInfo>,
        #[serde(default)]
        metadata: Value,
    },
    #[serde(rename_all = "camelCase")]
    PeerJoined {
        room_id: RoomId,
        peer_id: PeerId,
        display_name: String,
    },
    #[serde(rename_all = "camelCase")]
    NewProducer {
        room_id: RoomId,
        peer_id: PeerId,
        producer_id: ProducerId,
        kind: MediaKind,
    },
    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        room_id: RoomId,
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
    #[serde(rename_all = "camelCase")]
    PeerLeft { room_id: RoomId, peer_id: PeerId },
    #[serde(rename_all = "camelCase")]
    OnlineUsers { users: Vec<UserId> },
}

/// Frames travelling server → client on one connection.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutboundFrame {
    Response(ResponseFrame),
    Event(ServerEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub peer_id: PeerId,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub transport_id: TransportId,
    pub direction: TransportDirection,
    pub connect_params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomResponse {
    pub room_id: RoomId,
    pub participants: Vec<ParticipantInfo>,
    /// Targets that were online and received the incoming-call event.
    pub notified: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomResponse {
    pub routing_capabilities: Value,
    pub send_transport: TransportParams,
    pub recv_transport: TransportParams,
    /// The members present before this peer joined.
    pub peers: Vec<ParticipantInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceResponse {
    pub producer_id: ProducerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeResponse {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub consumer_parameters: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_frame_wire_shape() {
        let text = r#"{
            "id": 7,
            "method": "joinRoom",
            "params": {"roomId": "r1", "peerId": "alice", "displayName": "Alice"}
        }"#;
        let frame: RequestFrame = serde_json::from_str(text).expect("decode");
        assert_eq!(frame.id, 7);
        match frame.request {
            ClientRequest::JoinRoom {
                room_id,
                peer_id,
                display_name,
            } => {
                assert_eq!(room_id, RoomId::from("r1"));
                assert_eq!(peer_id, PeerId::from("alice"));
                assert_eq!(display_name, "Alice");
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_response_frame_has_exactly_one_side() {
        let ok = serde_json::to_value(ResponseFrame::ok(1, json!({"x": 1}))).expect("ok");
        assert!(ok.get("data").is_some());
        assert!(ok.get("error").is_none());

        let err = serde_json::to_value(ResponseFrame::err(2, "room not found: r9")).expect("err");
        assert!(err.get("data").is_none());
        assert_eq!(err["error"], "room not found: r9");
    }

    #[test]
    fn test_event_names_are_camel_case() {
        let event = ServerEvent::NewProducer {
            room_id: RoomId::from("r1"),
            peer_id: PeerId::from("alice"),
            producer_id: ProducerId::from("p1"),
            kind: MediaKind::Audio,
        };
        let value = serde_json::to_value(&event).expect("encode");
        assert_eq!(value["event"], "newProducer");
        assert_eq!(value["peerId"], "alice");
        assert_eq!(value["kind"], "audio");
    }

    #[test]
    fn test_outbound_frame_untagged() {
        let frame = OutboundFrame::Response(ResponseFrame::ok(3, json!(null)));
        let value = serde_json::to_value(&frame).expect("encode");
        assert_eq!(value["id"], 3);
        assert!(value.get("event").is_none());
    }
}
